//! Host interfaces the SVM engine is built on.
//!
//! The embedding kernel implements the memory and scheduling hooks; the
//! privileged-instruction hooks default to the real instructions and only
//! need overriding when the engine runs somewhere they cannot execute.

use core::arch::asm;

use memory_addr::{PhysAddr, VirtAddr};
use raw_cpuid::CpuIdResult;

use crate::regs::GeneralRegisters;
use crate::svm::instructions;
use crate::xstate::XSaveArea;

/// Host physical address.
pub type HostPhysAddr = PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = VirtAddr;

/// Hardware abstraction layer for the SVM vCPU engine.
pub trait SvmVCpuHal: Sized + 'static {
    /// Allocates a 4K-sized, 4K-aligned physical frame.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Deallocates a frame returned by [`SvmVCpuHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Allocates `num` physically contiguous frames.
    fn alloc_contiguous_frames(num: usize) -> Option<HostPhysAddr>;

    /// Deallocates frames returned by [`SvmVCpuHal::alloc_contiguous_frames`].
    fn dealloc_contiguous_frames(paddr: HostPhysAddr, num: usize);

    /// Converts a host physical address to a host virtual address the engine
    /// can dereference.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Index of the physical CPU the caller is running on.
    fn current_cpu_id() -> usize;

    fn preempt_disable();

    fn preempt_enable();

    /// Whether a signal or flush request is pending for the current thread.
    /// Called with GIF cleared, right before VMRUN.
    fn host_event_pending() -> bool;

    /// Whether the host scheduler wants the CPU back.
    fn return_needed() -> bool;

    /// Sends an IPI to every physical CPU so that running guests exit.
    fn kick_all_cpus();

    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        raw_cpuid::cpuid!(leaf, subleaf)
    }

    fn rdtsc() -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn rdmsr(msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    /// # Safety
    ///
    /// Writing an MSR may change the behaviour of the whole processor.
    unsafe fn wrmsr(msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) }
    }

    fn read_xcr0() -> u64 {
        let (lo, hi): (u32, u32);
        unsafe {
            asm!("xgetbv", in("ecx") 0u32, out("eax") lo, out("edx") hi, options(nomem, nostack));
        }
        ((hi as u64) << 32) | lo as u64
    }

    /// # Safety
    ///
    /// `value` must be a valid XCR0 for this processor.
    unsafe fn write_xcr0(value: u64) {
        unsafe {
            asm!(
                "xsetbv",
                in("ecx") 0u32,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nomem, nostack),
            );
        }
    }

    /// Reads debug register `index` (0-3, 6 or 7).
    fn read_dr(index: u8) -> u64 {
        unsafe { instructions::read_dr(index) }
    }

    /// # Safety
    ///
    /// Loading debug registers arms hardware breakpoints on the host.
    unsafe fn write_dr(index: u8, value: u64) {
        unsafe { instructions::write_dr(index, value) }
    }

    /// Saves the FPU state components selected by `mask` into `area`, using
    /// FXSAVE when `mask` is zero.
    ///
    /// # Safety
    ///
    /// `mask` must be a subset of the current XCR0.
    unsafe fn fpu_save(area: &mut XSaveArea, mask: u64) {
        unsafe { instructions::fpu_save(area, mask) }
    }

    /// Restores the FPU state components selected by `mask` from `area`, using
    /// FXRSTOR when `mask` is zero.
    ///
    /// # Safety
    ///
    /// `area` must hold a state that is valid for `mask`.
    unsafe fn fpu_restore(area: &XSaveArea, mask: u64) {
        unsafe { instructions::fpu_restore(area, mask) }
    }

    /// # Safety
    ///
    /// Must be paired with [`SvmVCpuHal::stgi`].
    unsafe fn clgi() {
        unsafe { instructions::clgi() }
    }

    /// # Safety
    ///
    /// Must only follow [`SvmVCpuHal::clgi`].
    unsafe fn stgi() {
        unsafe { instructions::stgi() }
    }

    /// Enters the guest described by the VMCB at `vmcb`, with the GPRs not
    /// held in the VMCB taken from and written back to `gprs`. The host's
    /// VMSAVE state is parked in the page at `host_save` meanwhile.
    ///
    /// # Safety
    ///
    /// Must run with GIF cleared, on a CPU with SVM enabled, with both pages
    /// valid for the duration of the call.
    unsafe fn vmrun(vmcb: HostPhysAddr, host_save: HostPhysAddr, gprs: &mut GeneralRegisters) {
        unsafe {
            instructions::svm_vmrun(vmcb.as_usize() as u64, host_save.as_usize() as u64, gprs)
        }
    }
}
