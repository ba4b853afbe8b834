//! Exit codes and intercepts of AMD-SVM (APM Vol-2, Appendix C).

numeric_enum_macro::numeric_enum! {
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
/// #VMEXIT codes the engine knows about. CR, DR and exception intercepts are
/// never enabled, so their codes are not listed and decode as unknown.
pub enum SvmExitCode {
    INTR = 0x60,
    NMI = 0x61,
    SMI = 0x62,
    INIT = 0x63,
    VINTR = 0x64,
    CR0_SEL_WRITE = 0x65,
    IDTR_READ = 0x66,
    GDTR_READ = 0x67,
    LDTR_READ = 0x68,
    TR_READ = 0x69,
    IDTR_WRITE = 0x6a,
    GDTR_WRITE = 0x6b,
    LDTR_WRITE = 0x6c,
    TR_WRITE = 0x6d,
    RDTSC = 0x6e,
    RDPMC = 0x6f,
    PUSHF = 0x70,
    POPF = 0x71,
    CPUID = 0x72,
    RSM = 0x73,
    IRET = 0x74,
    SWINT = 0x75,
    INVD = 0x76,
    PAUSE = 0x77,
    HLT = 0x78,
    INVLPG = 0x79,
    INVLPGA = 0x7a,
    IOIO = 0x7b,
    MSR = 0x7c,
    TASK_SWITCH = 0x7d,
    FERR_FREEZE = 0x7e,
    SHUTDOWN = 0x7f,
    VMRUN = 0x80,
    VMMCALL = 0x81,
    VMLOAD = 0x82,
    VMSAVE = 0x83,
    STGI = 0x84,
    CLGI = 0x85,
    SKINIT = 0x86,
    RDTSCP = 0x87,
    ICEBP = 0x88,
    WBINVD = 0x89,
    MONITOR = 0x8a,
    MWAIT = 0x8b,
    MWAIT_CONDITIONAL = 0x8c,
    XSETBV = 0x8d,
    RDPRU = 0x8e,
    EFER_WRITE_TRAP = 0x8f,
    INVLPGB = 0xa0,
    INVLPGB_ILLEGAL = 0xa1,
    INVPCID = 0xa2,
    MCOMMIT = 0xa3,
    TLBSYNC = 0xa4,
    NPF = 0x400,
    AVIC_INCOMPLETE_IPI = 0x401,
    AVIC_NOACCEL = 0x402,
    VMGEXIT = 0x403,
    BUSY = 0xffff_ffff_ffff_fffe,
    INVALID = 0xffff_ffff_ffff_ffff,
}
}

/// Intercepts in vectors 3 to 5 of the VMCB control area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum SvmIntercept {
    // Vector 3
    INTR,
    NMI,
    SMI,
    INIT,
    VINTR,
    CR0_SEL_WRITE,
    IDTR_READ,
    GDTR_READ,
    LDTR_READ,
    TR_READ,
    IDTR_WRITE,
    GDTR_WRITE,
    LDTR_WRITE,
    TR_WRITE,
    RDTSC,
    RDPMC,
    PUSHF,
    POPF,
    CPUID,
    RSM,
    IRET,
    SWINT,
    INVD,
    PAUSE,
    HLT,
    INVLPG,
    INVLPGA,
    IOIO_PROT,
    MSR_PROT,
    TASK_SWITCH,
    FERR_FREEZE,
    SHUTDOWN,
    // Vector 4
    VMRUN,
    VMMCALL,
    VMLOAD,
    VMSAVE,
    STGI,
    CLGI,
    SKINIT,
    RDTSCP,
    ICEBP,
    WBINVD,
    MONITOR,
    MWAIT,
    MWAIT_CONDITIONAL,
    XSETBV,
    RDPRU,
    EFER_WRITE_TRAP,
    // Vector 5
    INVLPGB,
    INVLPGB_ILLEGAL,
    INVPCID,
    MCOMMIT,
    TLBSYNC,
}

/// Intercepts every vCPU starts with.
pub const DEFAULT_INTERCEPTS: &[SvmIntercept] = {
    use SvmIntercept::*;
    &[
        INTR, NMI, INIT, RDPMC, CPUID, RSM, INVD, HLT, INVLPGA, IOIO_PROT, MSR_PROT, FERR_FREEZE,
        SHUTDOWN, VMRUN, VMMCALL, VMLOAD, VMSAVE, STGI, CLGI, SKINIT, RDTSCP, MONITOR, MWAIT,
        XSETBV, RDPRU, INVLPGB, INVLPGB_ILLEGAL, INVPCID, MCOMMIT, TLBSYNC,
    ]
};
