//! Identification of the SVM implementation and the settings shared by every
//! machine running on it.

use alloc::sync::Arc;
use core::marker::PhantomData;

use axerrno::{AxResult, ax_err};
use raw_cpuid::{CpuId, CpuIdReader, CpuIdResult};
use tock_registers::fields::FieldValue;

use super::asid::{AsidAllocator, MAX_ASIDS};
use super::cpuid::CPUID_SLOTS;
use super::vmcb::VmcbTlbControl;
use crate::hal::SvmVCpuHal;
use crate::msr::Msr;
use crate::xstate::{XAvailable, XCR0_SSE, XCR0_X87, host_mxcsr_mask};

/// VM_CR.SVMDIS: SVME cannot be set.
const VM_CR_SVMDIS: u64 = 1 << 4;
/// VM_CR.LOCK: SVMDIS is read-only.
const VM_CR_LOCK: u64 = 1 << 3;

/// Routes raw-cpuid queries through the HAL.
struct HalCpuid<H>(PhantomData<H>);

impl<H> Clone for HalCpuid<H> {
    fn clone(&self) -> Self {
        Self(PhantomData)
    }
}

impl<H: SvmVCpuHal> CpuIdReader for HalCpuid<H> {
    fn cpuid2(&self, eax: u32, ecx: u32) -> CpuIdResult {
        H::cpuid(eax, ecx)
    }
}

fn cpuid<H: SvmVCpuHal>() -> CpuId<HalCpuid<H>> {
    CpuId::with_cpuid_reader(HalCpuid(PhantomData))
}

/// Whether the processor implements AMD-SVM at all.
pub fn has_hardware_support<H: SvmVCpuHal>() -> bool {
    cpuid::<H>()
        .get_extended_processor_and_feature_identifiers()
        .is_some_and(|ext| ext.has_svm())
}

/// Tunables applied when the platform is brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmConfig {
    /// Highest basic CPUID leaf exposed to guests.
    pub cpuid_max_basic: u32,
    /// Highest extended CPUID leaf exposed to guests.
    pub cpuid_max_extended: u32,
    /// Upper bound on the ASID table.
    pub max_asids: u32,
    /// XCR0 components guests may enable, if the host supports them.
    pub xcr0_allowed: u64,
}

impl Default for SvmConfig {
    fn default() -> Self {
        Self {
            cpuid_max_basic: 0xd,
            cpuid_max_extended: 0x8000_001f,
            max_asids: MAX_ASIDS,
            xcr0_allowed: XCR0_X87 | XCR0_SSE,
        }
    }
}

/// What the engine offers to guests on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmCapability {
    pub xcr0_mask: u64,
    pub mxcsr_mask: u32,
    /// Number of CPUID overrides a vCPU can hold.
    pub cpuid_slots: usize,
    /// `VcpuConfig::Cpuid` is supported.
    pub conf_cpuid: bool,
    /// `VcpuConfig::Tpr` is supported.
    pub conf_tpr: bool,
}

/// The SVM implementation of the host, probed once.
#[derive(Debug)]
pub struct SvmPlatform {
    pub(crate) asids: Arc<AsidAllocator>,
    pub(crate) xcr0_mask: u64,
    pub(crate) mxcsr_mask: u32,
    pub(crate) cpuid_max_basic: u32,
    pub(crate) cpuid_max_extended: u32,
    pub(crate) flush_by_asid: bool,
    pub(crate) decode_assist: bool,
}

impl SvmPlatform {
    /// Identifies the processor and computes the global SVM settings.
    pub fn new<H: SvmVCpuHal>(config: SvmConfig) -> AxResult<Self> {
        let cpuid = cpuid::<H>();

        if !cpuid
            .get_vendor_info()
            .is_some_and(|vendor| vendor.as_str() == "AuthenticAMD")
        {
            return ax_err!(Unsupported, "not an AMD processor");
        }
        if !has_hardware_support::<H>() {
            return ax_err!(Unsupported, "CPU does not support AMD-SVM");
        }
        let Some(svm) = cpuid.get_svm_info() else {
            return ax_err!(Unsupported, "CPUID leaf 0x8000000a not available");
        };
        if svm.revision() < 1 {
            return ax_err!(Unsupported, "SVM revision not supported");
        }
        if !svm.has_nested_paging() {
            return ax_err!(Unsupported, "SVM nested paging not supported");
        }
        if !svm.has_nrip() {
            return ax_err!(Unsupported, "SVM NRIP save not supported");
        }

        let vm_cr = Msr::AMD_VM_CR.read::<H>();
        if vm_cr & VM_CR_SVMDIS != 0 && vm_cr & VM_CR_LOCK != 0 {
            return ax_err!(Unsupported, "SVM disabled by firmware");
        }

        let asid_count = svm.supported_asids().min(config.max_asids);
        let xavail = XAvailable::new::<H>();
        let xcr0_mask = if xavail.xsave {
            config.xcr0_allowed & xavail.xcr0_supported
        } else {
            0
        };

        let cpuid_max_basic = H::cpuid(0, 0).eax.min(config.cpuid_max_basic);
        let cpuid_max_extended = H::cpuid(0x8000_0000, 0)
            .eax
            .min(config.cpuid_max_extended);

        let platform = Self {
            asids: Arc::new(AsidAllocator::new(asid_count)),
            xcr0_mask,
            mxcsr_mask: host_mxcsr_mask::<H>(),
            cpuid_max_basic,
            cpuid_max_extended,
            flush_by_asid: svm.has_flush_by_asid(),
            decode_assist: svm.has_decode_assists(),
        };
        info!(
            "[SVM] platform ready: {} ASIDs, xcr0 mask {:#x}, decode assists {}",
            platform.asids.size(),
            platform.xcr0_mask,
            platform.decode_assist
        );
        Ok(platform)
    }

    pub fn capability(&self) -> SvmCapability {
        SvmCapability {
            xcr0_mask: self.xcr0_mask,
            mxcsr_mask: self.mxcsr_mask,
            cpuid_slots: CPUID_SLOTS,
            conf_cpuid: true,
            conf_tpr: false,
        }
    }

    /// The TLB_CONTROL command that flushes a guest's TLB entries.
    pub(crate) fn tlb_flush(&self) -> FieldValue<u8, VmcbTlbControl::Register> {
        if self.flush_by_asid {
            VmcbTlbControl::CONTROL::FlushGuestTlb
        } else {
            VmcbTlbControl::CONTROL::FlushAllOnVmrun
        }
    }

    pub fn asids(&self) -> &Arc<AsidAllocator> {
        &self.asids
    }

    pub fn xcr0_mask(&self) -> u64 {
        self.xcr0_mask
    }
}
