use crate::hal::SvmVCpuHal;

numeric_enum_macro::numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(non_camel_case_types)]
/// MSRs the SVM engine touches or virtualizes.
pub enum Msr {
    IA32_TSC = 0x10,
    UCODE_AMD_PATCHLEVEL = 0x8b,

    IA32_SYSENTER_CS = 0x174,
    IA32_SYSENTER_ESP = 0x175,
    IA32_SYSENTER_EIP = 0x176,

    IA32_PAT = 0x277,

    IA32_EFER = 0xc000_0080,
    IA32_STAR = 0xc000_0081,
    IA32_LSTAR = 0xc000_0082,
    IA32_CSTAR = 0xc000_0083,
    IA32_FMASK = 0xc000_0084,

    IA32_FS_BASE = 0xc000_0100,
    IA32_GS_BASE = 0xc000_0101,
    IA32_KERNEL_GSBASE = 0xc000_0102,

    AMD_NB_CFG = 0xc001_001f,
    AMD_CMPHALT = 0xc001_0055,
    AMD_VM_CR = 0xc001_0114,
    AMD_VM_HSAVE_PA = 0xc001_0117,
    AMD_IC_CFG = 0xc001_1021,
    AMD_DE_CFG = 0xc001_1029,
}
}

impl Msr {
    /// Read 64 bits msr register.
    #[inline(always)]
    pub fn read<H: SvmVCpuHal>(self) -> u64 {
        H::rdmsr(self as u32)
    }

    /// Write 64 bits to msr register.
    ///
    /// # Safety
    ///
    /// The caller must ensure that this write operation has no unsafe side
    /// effects.
    #[inline(always)]
    pub unsafe fn write<H: SvmVCpuHal>(self, value: u64) {
        unsafe { H::wrmsr(self as u32, value) }
    }
}
