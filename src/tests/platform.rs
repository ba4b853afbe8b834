//! Platform probing and per-CPU SVM enablement on the mock processor.

use axerrno::AxError;
use raw_cpuid::CpuIdResult;

use super::mock::{self, MockHal, with};
use crate::msr::Msr;
use crate::svm::vmcb::VmcbTlbControl;
use crate::svm::{SvmConfig, SvmPerCpuState, SvmPlatform, has_hardware_support};

const EFER_SVME: u64 = 1 << 12;
const VM_CR_LOCK: u64 = 1 << 3;
const VM_CR_SVMDIS: u64 = 1 << 4;

fn patch_cpuid(leaf: u32, f: impl FnOnce(&mut CpuIdResult)) {
    with(|s| {
        let res = s.cpuid.get_mut(&(leaf, 0)).unwrap();
        f(res);
    });
}

fn probe() -> Result<SvmPlatform, AxError> {
    SvmPlatform::new::<MockHal>(SvmConfig::default())
}

#[test]
fn probe_capabilities() {
    mock::reset();
    let platform = probe().unwrap();
    let cap = platform.capability();
    assert_eq!(cap.xcr0_mask, 0x3);
    assert_eq!(cap.mxcsr_mask, mock::HOST_MXCSR_MASK);
    assert_eq!(cap.cpuid_slots, 32);
    assert!(cap.conf_cpuid);
    assert!(!cap.conf_tpr);

    assert_eq!(platform.asids().size(), mock::SVM_ASIDS);
    assert_eq!(platform.cpuid_max_basic, 0xd);
    assert_eq!(platform.cpuid_max_extended, 0x8000_001f);
    assert!(platform.decode_assist);
    assert_eq!(
        platform.tlb_flush().value,
        VmcbTlbControl::CONTROL::FlushGuestTlb.value
    );
}

#[test]
fn probe_honours_config() {
    mock::reset();
    let config = SvmConfig {
        max_asids: 4,
        xcr0_allowed: 0x1,
        ..SvmConfig::default()
    };
    let platform = SvmPlatform::new::<MockHal>(config).unwrap();
    assert_eq!(platform.asids().size(), 4);
    assert_eq!(platform.xcr0_mask(), 0x1);
}

#[test]
fn probe_without_optional_features() {
    mock::reset();
    // No FlushByAsid, no DecodeAssists.
    patch_cpuid(0x8000_000a, |r| r.edx = (1 << 0) | (1 << 3));
    // No XSAVE.
    patch_cpuid(1, |r| r.ecx = 0);

    let platform = probe().unwrap();
    assert!(!platform.decode_assist);
    assert_eq!(platform.xcr0_mask(), 0);
    assert_eq!(
        platform.tlb_flush().value,
        VmcbTlbControl::CONTROL::FlushAllOnVmrun.value
    );
}

#[test]
fn probe_rejects_unsuitable_cpus() {
    mock::reset();
    patch_cpuid(0, |r| r.ebx = u32::from_le_bytes(*b"Genu"));
    assert_eq!(probe().unwrap_err(), AxError::Unsupported);

    mock::reset();
    patch_cpuid(0x8000_0001, |r| r.ecx = 0);
    assert!(!has_hardware_support::<MockHal>());
    assert_eq!(probe().unwrap_err(), AxError::Unsupported);

    mock::reset();
    patch_cpuid(0x8000_000a, |r| r.edx &= !1);
    assert_eq!(probe().unwrap_err(), AxError::Unsupported);

    mock::reset();
    patch_cpuid(0x8000_000a, |r| r.edx &= !(1 << 3));
    assert_eq!(probe().unwrap_err(), AxError::Unsupported);

    mock::reset();
    patch_cpuid(0x8000_000a, |r| r.eax = 0);
    assert_eq!(probe().unwrap_err(), AxError::Unsupported);

    mock::reset();
    with(|s| s.msrs.insert(Msr::AMD_VM_CR as u32, VM_CR_SVMDIS | VM_CR_LOCK));
    assert_eq!(probe().unwrap_err(), AxError::Unsupported);

    // Disabled but unlocked: per-CPU enablement clears SVMDIS.
    mock::reset();
    with(|s| s.msrs.insert(Msr::AMD_VM_CR as u32, VM_CR_SVMDIS));
    assert!(probe().is_ok());
}

#[test]
fn enable_and_disable() {
    mock::reset();
    let mut percpu = SvmPerCpuState::<MockHal>::new(0);
    assert!(!percpu.is_enabled());
    assert_eq!(percpu.hardware_disable().unwrap_err(), AxError::BadState);

    percpu.hardware_enable().unwrap();
    assert!(percpu.is_enabled());
    let hsave = with(|s| s.msrs[&(Msr::AMD_VM_HSAVE_PA as u32)]);
    assert_ne!(hsave, 0);
    assert_eq!(hsave % 0x1000, 0);
    assert_eq!(with(|s| s.frames), 1);
    assert_eq!(percpu.hardware_enable().unwrap_err(), AxError::BadState);

    percpu.hardware_disable().unwrap();
    assert!(!percpu.is_enabled());
    with(|s| {
        assert_eq!(s.msrs[&(Msr::IA32_EFER as u32)] & EFER_SVME, 0);
        assert_eq!(s.msrs[&(Msr::AMD_VM_HSAVE_PA as u32)], 0);
        assert_eq!(s.frames, 0);
    });
}

#[test]
fn enable_clears_unlocked_svmdis() {
    mock::reset();
    with(|s| s.msrs.insert(Msr::AMD_VM_CR as u32, VM_CR_SVMDIS));
    let mut percpu = SvmPerCpuState::<MockHal>::new(1);
    percpu.hardware_enable().unwrap();
    assert_eq!(with(|s| s.msrs[&(Msr::AMD_VM_CR as u32)]), 0);
    // The host save page belongs to this mock CPU; return it before the reset.
    percpu.hardware_disable().unwrap();
    assert_eq!(with(|s| s.frames), 0);

    mock::reset();
    with(|s| s.msrs.insert(Msr::AMD_VM_CR as u32, VM_CR_SVMDIS | VM_CR_LOCK));
    let mut percpu = SvmPerCpuState::<MockHal>::new(1);
    assert_eq!(percpu.hardware_enable().unwrap_err(), AxError::Unsupported);
    assert_eq!(with(|s| s.frames), 0);

    mock::reset();
    patch_cpuid(0x8000_0001, |r| r.ecx = 0);
    let mut percpu = SvmPerCpuState::<MockHal>::new(1);
    assert_eq!(percpu.hardware_enable().unwrap_err(), AxError::Unsupported);
}
