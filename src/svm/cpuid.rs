//! CPUID virtualization.
//!
//! Guests see the host's CPUID filtered through per-leaf allow-masks, with
//! leaf ranges capped and topology rewritten to describe the virtual machine.
//! Each vCPU may further edit single leaves, or have them exit to the caller.

use axerrno::{AxResult, ax_err};
use raw_cpuid::CpuIdResult;

use crate::hal::SvmVCpuHal;
use crate::xstate::{XCR0_X87, xsave_size};

/// Number of per-vCPU CPUID overrides.
pub const CPUID_SLOTS: usize = 32;

/// Highest hypervisor leaf.
pub const CPUID_MAX_HYPERVISOR: u32 = 0x4000_0000;

/// Upper bound on vCPUs per machine, as advertised in leaf 0x80000008.
pub const MAX_VCPUS: u32 = 128;

const HYPERVISOR_SIGNATURE: &[u8; 12] = b"SVMVCPU SVMV";

/// One bit mask per output register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidMask {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidMask {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }

    const fn overlaps(&self, other: &Self) -> bool {
        (self.eax & other.eax) | (self.ebx & other.ebx) | (self.ecx & other.ecx) | (self.edx & other.edx)
            != 0
    }

    fn apply(&self, res: &mut CpuIdResult) {
        res.eax &= self.eax;
        res.ebx &= self.ebx;
        res.ecx &= self.ecx;
        res.edx &= self.edx;
    }
}

mod leaf1 {
    pub const EBX_HTT_CORES: u32 = 0xff << 16;
    pub const EBX_LOCAL_APIC_ID: u32 = 0xff << 24;

    pub const ECX_SSE3: u32 = 1 << 0;
    pub const ECX_PCLMULQDQ: u32 = 1 << 1;
    pub const ECX_SSSE3: u32 = 1 << 9;
    pub const ECX_CX16: u32 = 1 << 13;
    pub const ECX_SSE41: u32 = 1 << 19;
    pub const ECX_SSE42: u32 = 1 << 20;
    pub const ECX_MOVBE: u32 = 1 << 22;
    pub const ECX_POPCNT: u32 = 1 << 23;
    pub const ECX_AESNI: u32 = 1 << 25;
    pub const ECX_XSAVE: u32 = 1 << 26;
    pub const ECX_OSXSAVE: u32 = 1 << 27;
    pub const ECX_RDRAND: u32 = 1 << 30;
    /// Reserved for use by hypervisors.
    pub const ECX_RAZ: u32 = 1 << 31;

    pub const EDX_FPU: u32 = 1 << 0;
    pub const EDX_VME: u32 = 1 << 1;
    pub const EDX_DE: u32 = 1 << 2;
    pub const EDX_PSE: u32 = 1 << 3;
    pub const EDX_TSC: u32 = 1 << 4;
    pub const EDX_MSR: u32 = 1 << 5;
    pub const EDX_PAE: u32 = 1 << 6;
    pub const EDX_CX8: u32 = 1 << 8;
    pub const EDX_APIC: u32 = 1 << 9;
    pub const EDX_SEP: u32 = 1 << 11;
    pub const EDX_MTRR: u32 = 1 << 12;
    pub const EDX_PGE: u32 = 1 << 13;
    pub const EDX_CMOV: u32 = 1 << 15;
    pub const EDX_PAT: u32 = 1 << 16;
    pub const EDX_PSE36: u32 = 1 << 17;
    pub const EDX_CLFSH: u32 = 1 << 19;
    pub const EDX_MMX: u32 = 1 << 23;
    pub const EDX_FXSR: u32 = 1 << 24;
    pub const EDX_SSE: u32 = 1 << 25;
    pub const EDX_SSE2: u32 = 1 << 26;
    pub const EDX_SS: u32 = 1 << 27;
    pub const EDX_HTT: u32 = 1 << 28;
}

mod leaf7 {
    pub const EBX_FSGSBASE: u32 = 1 << 0;
    pub const EBX_BMI1: u32 = 1 << 3;
    pub const EBX_SMEP: u32 = 1 << 7;
    pub const EBX_BMI2: u32 = 1 << 8;
    pub const EBX_ERMS: u32 = 1 << 9;
    pub const EBX_RDSEED: u32 = 1 << 18;
    pub const EBX_ADX: u32 = 1 << 19;
    pub const EBX_SMAP: u32 = 1 << 20;
    pub const EBX_CLFLUSHOPT: u32 = 1 << 23;
    pub const EBX_CLWB: u32 = 1 << 24;
    pub const EBX_SHA: u32 = 1 << 29;
}

mod leaf_d {
    pub const ECX1_EAX_XSAVEOPT: u32 = 1 << 0;
    pub const ECX1_EAX_XSAVEC: u32 = 1 << 1;
    pub const ECX1_EAX_XGETBV: u32 = 1 << 2;
}

mod ext1 {
    pub const ECX_LAHF: u32 = 1 << 0;
    pub const ECX_ABM: u32 = 1 << 5;
    pub const ECX_SSE4A: u32 = 1 << 6;
    pub const ECX_MISALIGNSSE: u32 = 1 << 7;
    pub const ECX_PREFETCHW: u32 = 1 << 8;

    pub const EDX_SYSCALL: u32 = 1 << 11;
    pub const EDX_NX: u32 = 1 << 20;
    pub const EDX_MMXEXT: u32 = 1 << 22;
    pub const EDX_FFXSR: u32 = 1 << 25;
    pub const EDX_PAGE1GB: u32 = 1 << 26;
    pub const EDX_LM: u32 = 1 << 29;
}

mod ext7 {
    pub const EDX_INVARIANT_TSC: u32 = 1 << 8;
}

mod ext8 {
    pub const ECX_NC: u32 = 0xff;
    pub const ECX_APIC_ID_SIZE_SHIFT: u32 = 12;
}

pub const CPUID_00000001: CpuidMask = {
    use leaf1::*;
    CpuidMask::new(
        !0,
        !0,
        ECX_SSE3
            | ECX_PCLMULQDQ
            | ECX_SSSE3
            | ECX_CX16
            | ECX_SSE41
            | ECX_SSE42
            | ECX_MOVBE
            | ECX_POPCNT
            | ECX_AESNI
            | ECX_XSAVE
            | ECX_OSXSAVE
            | ECX_RDRAND,
        EDX_FPU
            | EDX_VME
            | EDX_DE
            | EDX_PSE
            | EDX_TSC
            | EDX_MSR
            | EDX_PAE
            | EDX_CX8
            | EDX_APIC
            | EDX_SEP
            | EDX_MTRR
            | EDX_PGE
            | EDX_CMOV
            | EDX_PAT
            | EDX_PSE36
            | EDX_CLFSH
            | EDX_MMX
            | EDX_FXSR
            | EDX_SSE
            | EDX_SSE2
            | EDX_SS
            | EDX_HTT,
    )
};

pub const CPUID_00000007: CpuidMask = {
    use leaf7::*;
    CpuidMask::new(
        0,
        EBX_FSGSBASE
            | EBX_BMI1
            | EBX_SMEP
            | EBX_BMI2
            | EBX_ERMS
            | EBX_RDSEED
            | EBX_ADX
            | EBX_SMAP
            | EBX_CLFLUSHOPT
            | EBX_CLWB
            | EBX_SHA,
        0,
        0,
    )
};

pub const CPUID_0000000D_1: CpuidMask = {
    use leaf_d::*;
    CpuidMask::new(ECX1_EAX_XSAVEOPT | ECX1_EAX_XSAVEC | ECX1_EAX_XGETBV, 0, 0, 0)
};

pub const CPUID_80000001: CpuidMask = {
    use ext1::*;
    CpuidMask::new(
        !0,
        !0,
        ECX_LAHF | ECX_ABM | ECX_SSE4A | ECX_MISALIGNSSE | ECX_PREFETCHW,
        EDX_SYSCALL | EDX_NX | EDX_MMXEXT | EDX_FFXSR | EDX_PAGE1GB | EDX_LM,
    )
};

pub const CPUID_80000007: CpuidMask = CpuidMask::new(0, 0, 0, ext7::EDX_INVARIANT_TSC);

/// Address sizes stay visible; the core count is rewritten.
pub const CPUID_80000008: CpuidMask = CpuidMask::new(!0, 0, 0, 0);

/// Everything CPUID virtualization needs to know about the vCPU.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CpuidContext {
    pub max_basic: u32,
    pub max_extended: u32,
    pub xcr0_mask: u64,
    pub guest_xcr0: u64,
    pub guest_cr4_osxsave: bool,
    pub vcpu_id: u32,
    pub ncpus: u32,
}

const ZERO: CpuIdResult = CpuIdResult {
    eax: 0,
    ebx: 0,
    ecx: 0,
    edx: 0,
};

/// The result a guest gets for CPUID(`leaf`, `subleaf`) before per-vCPU
/// overrides.
pub(crate) fn virtualize<H: SvmVCpuHal>(ctx: &CpuidContext, leaf: u32, subleaf: u32) -> CpuIdResult {
    let mut leaf = leaf;
    let cap = if leaf < CPUID_MAX_HYPERVISOR {
        ctx.max_basic
    } else if leaf < 0x8000_0000 {
        CPUID_MAX_HYPERVISOR
    } else {
        ctx.max_extended
    };
    // Like the hardware, out-of-range leaves return the highest basic leaf.
    if leaf > cap {
        leaf = ctx.max_basic;
    }
    let mut res = H::cpuid(leaf, subleaf);

    match leaf {
        0x0000_0000 => res.eax = ctx.max_basic,
        0x0000_0001 => {
            CPUID_00000001.apply(&mut res);
            res.ebx &= !(leaf1::EBX_LOCAL_APIC_ID | leaf1::EBX_HTT_CORES);
            res.ebx |= (ctx.vcpu_id << 24) & leaf1::EBX_LOCAL_APIC_ID;
            res.ebx |= (ctx.ncpus << 16) & leaf1::EBX_HTT_CORES;
            res.ecx |= leaf1::ECX_RAZ;
            if !ctx.guest_cr4_osxsave {
                res.ecx &= !leaf1::ECX_OSXSAVE;
            }
        }
        0x0000_0002..=0x0000_0006 => res = ZERO,
        0x0000_0007 => match subleaf {
            0 => CPUID_00000007.apply(&mut res),
            _ => res = ZERO,
        },
        0x0000_0008..=0x0000_000c => res = ZERO,
        0x0000_000d if ctx.xcr0_mask != 0 => match subleaf {
            0 => {
                res.eax = ctx.xcr0_mask as u32;
                res.edx = (ctx.xcr0_mask >> 32) as u32;
                res.ebx = xsave_size::<H>(ctx.guest_xcr0);
                res.ecx = xsave_size::<H>(ctx.xcr0_mask);
            }
            1 => CPUID_0000000D_1.apply(&mut res),
            _ => res = ZERO,
        },
        CPUID_MAX_HYPERVISOR => {
            let sig = |i: usize| {
                u32::from_le_bytes([
                    HYPERVISOR_SIGNATURE[i],
                    HYPERVISOR_SIGNATURE[i + 1],
                    HYPERVISOR_SIGNATURE[i + 2],
                    HYPERVISOR_SIGNATURE[i + 3],
                ])
            };
            res = CpuIdResult {
                eax: CPUID_MAX_HYPERVISOR,
                ebx: sig(0),
                ecx: sig(4),
                edx: sig(8),
            };
        }
        0x8000_0000 => res.eax = ctx.max_extended,
        0x8000_0001 => CPUID_80000001.apply(&mut res),
        0x8000_0007 => CPUID_80000007.apply(&mut res),
        0x8000_0008 => {
            CPUID_80000008.apply(&mut res);
            res.ecx = (ctx.ncpus.saturating_sub(1) & ext8::ECX_NC)
                | (MAX_VCPUS.ilog2() << ext8::ECX_APIC_ID_SIZE_SHIFT);
        }
        0x8000_0009..=0x8000_0018 | 0x8000_001b | 0x8000_001c | 0x8000_001f => res = ZERO,
        _ => {}
    }
    res
}

/// Edits to one CPUID leaf, or a request to exit on it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidConf {
    pub leaf: u32,
    /// Apply `del` then `set` to the virtualized result.
    pub mask: bool,
    /// Report CPUID of this leaf to the caller.
    pub exit: bool,
    pub set: CpuidMask,
    pub del: CpuidMask,
}

/// Per-vCPU configuration operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuConfig {
    Cpuid(CpuidConf),
    /// Drop the override of `leaf`, restoring the default result.
    CpuidRemove { leaf: u32 },
    /// Exit on guest TPR changes. Not available on SVM.
    Tpr { exit_changes: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CpuidOverride {
    Mask { set: CpuidMask, del: CpuidMask },
    Exit,
}

/// What to do with a guest CPUID once the default result is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CpuidAction {
    Complete,
    Exit,
}

/// The per-vCPU CPUID overrides.
#[derive(Debug, Clone)]
pub(crate) struct CpuidTable {
    slots: [Option<(u32, CpuidOverride)>; CPUID_SLOTS],
}

impl CpuidTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; CPUID_SLOTS],
        }
    }

    /// Installs or replaces the override of `conf.leaf`.
    pub fn set(&mut self, conf: &CpuidConf) -> AxResult {
        if conf.mask == conf.exit {
            return ax_err!(InvalidInput, "CPUID override must either mask or exit");
        }
        if conf.set.overlaps(&conf.del) {
            return ax_err!(InvalidInput, "CPUID override sets and deletes the same bits");
        }
        let entry = if conf.exit {
            CpuidOverride::Exit
        } else {
            CpuidOverride::Mask {
                set: conf.set,
                del: conf.del,
            }
        };

        let slot = match self.slots.iter().position(|s| matches!(s, Some((leaf, _)) if *leaf == conf.leaf)) {
            Some(i) => i,
            None => match self.slots.iter().position(Option::is_none) {
                Some(i) => i,
                None => return ax_err!(StorageFull, "no free CPUID override slot"),
            },
        };
        self.slots[slot] = Some((conf.leaf, entry));
        debug!("[SVM] CPUID leaf {:#x} override: {:?}", conf.leaf, entry);
        Ok(())
    }

    pub fn remove(&mut self, leaf: u32) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some((l, _)) if *l == leaf) {
                *slot = None;
                debug!("[SVM] CPUID leaf {:#x} override removed", leaf);
            }
        }
    }

    /// Applies the override of `leaf` to `res`.
    pub fn apply(&self, leaf: u32, res: &mut CpuIdResult) -> CpuidAction {
        let Some((_, entry)) = self.slots.iter().flatten().find(|(l, _)| *l == leaf) else {
            return CpuidAction::Complete;
        };
        match entry {
            CpuidOverride::Exit => CpuidAction::Exit,
            CpuidOverride::Mask { set, del } => {
                res.eax = (res.eax & !del.eax) | set.eax;
                res.ebx = (res.ebx & !del.ebx) | set.ebx;
                res.ecx = (res.ecx & !del.ecx) | set.ecx;
                res.edx = (res.edx & !del.edx) | set.edx;
                CpuidAction::Complete
            }
        }
    }
}

/// XCR0 the guest may load: within the mask and with x87 enabled.
pub(crate) fn valid_guest_xcr0(value: u64, xcr0_mask: u64) -> bool {
    value & !xcr0_mask == 0 && value & XCR0_X87 != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    fn mask_conf(leaf: u32, set: CpuidMask, del: CpuidMask) -> CpuidConf {
        CpuidConf {
            leaf,
            mask: true,
            exit: false,
            set,
            del,
        }
    }

    #[test]
    fn conf_needs_exactly_one_mode() {
        let mut table = CpuidTable::new();
        let both = CpuidConf {
            leaf: 1,
            mask: true,
            exit: true,
            ..Default::default()
        };
        let none = CpuidConf {
            leaf: 1,
            ..Default::default()
        };
        assert_eq!(table.set(&both), Err(AxError::InvalidInput));
        assert_eq!(table.set(&none), Err(AxError::InvalidInput));
    }

    #[test]
    fn set_and_del_must_not_overlap() {
        let mut table = CpuidTable::new();
        let bits = CpuidMask::new(0, 0, 1 << 5, 0);
        assert_eq!(table.set(&mask_conf(1, bits, bits)), Err(AxError::InvalidInput));
    }

    #[test]
    fn mask_applies_del_then_set() {
        let mut table = CpuidTable::new();
        table
            .set(&mask_conf(
                7,
                CpuidMask::new(0, 0x10, 0, 0),
                CpuidMask::new(0, 0x3, 0, 0),
            ))
            .unwrap();
        let mut res = CpuIdResult {
            eax: 1,
            ebx: 0xf,
            ecx: 2,
            edx: 3,
        };
        assert_eq!(table.apply(7, &mut res), CpuidAction::Complete);
        assert_eq!(res.ebx, 0x1c);
        assert_eq!((res.eax, res.ecx, res.edx), (1, 2, 3));
    }

    #[test]
    fn replace_and_remove() {
        let mut table = CpuidTable::new();
        table
            .set(&CpuidConf {
                leaf: 1,
                exit: true,
                ..Default::default()
            })
            .unwrap();
        table.set(&mask_conf(1, CpuidMask::default(), CpuidMask::default())).unwrap();
        let mut res = ZERO;
        assert_eq!(table.apply(1, &mut res), CpuidAction::Complete);

        table.remove(1);
        table.remove(1);
        assert_eq!(table.slots.iter().flatten().count(), 0);
    }

    #[test]
    fn table_full() {
        let mut table = CpuidTable::new();
        let conf = |leaf| CpuidConf {
            leaf,
            exit: true,
            ..Default::default()
        };
        for leaf in 0..CPUID_SLOTS as u32 {
            table.set(&conf(leaf)).unwrap();
        }
        assert_eq!(table.set(&conf(0x100)), Err(AxError::StorageFull));
        // Replacing an existing leaf still works.
        assert!(table.set(&conf(3)).is_ok());
        let mut res = ZERO;
        assert_eq!(table.apply(0x100, &mut res), CpuidAction::Complete);
    }

    #[test]
    fn guest_xcr0_rules() {
        let mask = XCR0_X87 | 0x2;
        assert!(valid_guest_xcr0(0x3, mask));
        assert!(valid_guest_xcr0(0x1, mask));
        assert!(!valid_guest_xcr0(0x2, mask));
        assert!(!valid_guest_xcr0(0x7, mask));
    }
}
