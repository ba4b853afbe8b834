//! AMD-SVM per-CPU enable/disable logic
//!
//! References (AMD APM v2 *System Programming*), § 15.4 Enabling SVM:
//!  1. check that the CPU supports SVM and that firmware did not lock it off
//!  2. allocate the host save area and write its address to `VM_HSAVE_PA`
//!  3. set `EFER.SVME`
//!
//! Clearing `EFER.SVME` disables SVM again; there is no VMXOFF counterpart.

use axerrno::{AxResult, ax_err};
use x86_64::registers::model_specific::EferFlags;

use super::platform::has_hardware_support;
use crate::frame::PhysFrames;
use crate::hal::SvmVCpuHal;
use crate::msr::Msr;

const VM_CR_LOCK: u64 = 1 << 3;
const VM_CR_SVMDIS: u64 = 1 << 4;

/// SVM state of one physical CPU.
///
/// (AMD64 APM Vol.2, Section 15.30.4) VMRUN saves part of the host state in
/// the 4K page VM_HSAVE_PA points to.
#[derive(Debug)]
pub struct SvmPerCpuState<H: SvmVCpuHal> {
    cpu_id: usize,
    hsave_page: Option<PhysFrames<H>>,
}

impl<H: SvmVCpuHal> SvmPerCpuState<H> {
    pub fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            hsave_page: None,
        }
    }

    /// Returns true if SVM is enabled on this core (EFER.SVME == 1).
    pub fn is_enabled(&self) -> bool {
        EferFlags::from_bits_truncate(Msr::IA32_EFER.read::<H>())
            .contains(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE)
    }

    /// Turns SVM on for the calling CPU.
    pub fn hardware_enable(&mut self) -> AxResult {
        if !has_hardware_support::<H>() {
            return ax_err!(Unsupported, "CPU does not support AMD-SVM");
        }
        if self.is_enabled() {
            return ax_err!(BadState, "SVM already enabled");
        }

        let vm_cr = Msr::AMD_VM_CR.read::<H>();
        if vm_cr & VM_CR_SVMDIS != 0 {
            if vm_cr & VM_CR_LOCK != 0 {
                return ax_err!(Unsupported, "SVM disabled by firmware");
            }
            unsafe { Msr::AMD_VM_CR.write::<H>(vm_cr & !VM_CR_SVMDIS) };
        }

        let hsave_page = PhysFrames::alloc_filled(1, 0)?;
        let hsave_pa = hsave_page.start_paddr().as_usize() as u64;
        unsafe {
            Msr::AMD_VM_HSAVE_PA.write::<H>(hsave_pa);
            let efer = Msr::IA32_EFER.read::<H>();
            Msr::IA32_EFER.write::<H>(efer | EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE.bits());
        }
        self.hsave_page = Some(hsave_page);

        info!("[SVM] enabled on CPU {} (HSAVE @ {:#x})", self.cpu_id, hsave_pa);
        Ok(())
    }

    /// Turns SVM off again. No vCPU may run on this CPU afterwards.
    pub fn hardware_disable(&mut self) -> AxResult {
        if !self.is_enabled() {
            return ax_err!(BadState, "SVM is not enabled");
        }
        unsafe {
            let efer = Msr::IA32_EFER.read::<H>();
            Msr::IA32_EFER.write::<H>(efer & !EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE.bits());
            Msr::AMD_VM_HSAVE_PA.write::<H>(0);
        }
        self.hsave_page = None;

        info!("[SVM] disabled on CPU {}", self.cpu_id);
        Ok(())
    }
}
