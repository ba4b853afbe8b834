//! #VMEXIT handling.
//!
//! Every exit code maps to one handler. A handler either completes the
//! instruction in the kernel and returns [`SvmExitReason::None`], or builds
//! the exit record the caller has to act on.

use tock_registers::LocalRegisterCopy;
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::Cr4Flags;
use x86_64::registers::model_specific::EferFlags;
use x86_64::registers::rflags::RFlags;

use super::cpuid::{CpuidAction, CpuidContext, valid_guest_xcr0, virtualize};
use super::definitions::SvmExitCode;
use super::machine::NestedPagingContext;
use super::sync::{EFER_SVME, EFER_TLB_BITS};
use super::vcpu::SvmVcpu;
use super::vmcb::{IntState, IoExitInfo, NpfExitInfo, SvmExitInfo, VmcbCleanBits};
use crate::event::{VcpuEvent, vector};
use crate::exit::{IoExit, MemoryAccess, MemoryExit, MsrExit, SvmExitReason};
use crate::hal::SvmVCpuHal;
use crate::msr::Msr;
use crate::state::StateGroups;

type ExitHandler<H, M> = fn(&mut SvmVcpu<H, M>, &SvmExitInfo) -> SvmExitReason;

/// Read as zero, writes dropped.
const MSR_IGNORED: [Msr; 4] = [
    Msr::AMD_CMPHALT,
    Msr::AMD_DE_CFG,
    Msr::AMD_IC_CFG,
    Msr::UCODE_AMD_PATCHLEVEL,
];

/// NB_CFG.InitApicIdCpuIdLo
const NB_CFG_INIT_APIC_ID_CPUID_LO: u64 = 1 << 54;

/// EFER bits a guest may set.
const EFER_VALID: EferFlags = EferFlags::SYSTEM_CALL_EXTENSIONS
    .union(EferFlags::LONG_MODE_ENABLE)
    .union(EferFlags::LONG_MODE_ACTIVE)
    .union(EferFlags::NO_EXECUTE_ENABLE)
    .union(EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE)
    .union(EferFlags::FAST_FXSAVE_FXRSTOR)
    .union(EferFlags::TRANSLATION_CACHE_EXTENSION);

/// The state most caller-side instruction emulation needs.
const EMULATION_STATE: StateGroups = StateGroups::GPRS
    .union(StateGroups::SEGS)
    .union(StateGroups::CRS)
    .union(StateGroups::MSRS);

impl<H: SvmVCpuHal, M: NestedPagingContext> SvmVcpu<H, M> {
    fn exit_handler(code: Result<SvmExitCode, u64>) -> ExitHandler<H, M> {
        use SvmExitCode::*;

        match code {
            Ok(INTR | NMI) => Self::handle_host_interrupt,
            Ok(VINTR) => Self::handle_vintr,
            Ok(IRET) => Self::handle_iret,
            Ok(CPUID) => Self::handle_cpuid,
            Ok(HLT) => Self::handle_hlt,
            Ok(IOIO) => Self::handle_io,
            Ok(MSR) => Self::handle_msr,
            Ok(SHUTDOWN) => Self::handle_shutdown,
            Ok(RDPMC | RSM | INVLPGA | VMRUN | VMMCALL | VMLOAD | VMSAVE | STGI | CLGI | SKINIT
            | RDTSCP | RDPRU | INVLPGB | INVLPGB_ILLEGAL | INVPCID | MCOMMIT | TLBSYNC) => {
                Self::handle_undefined
            }
            Ok(MONITOR) => Self::handle_monitor,
            Ok(MWAIT | MWAIT_CONDITIONAL) => Self::handle_mwait,
            Ok(XSETBV) => Self::handle_xsetbv,
            Ok(NPF) => Self::handle_npf,
            _ => Self::handle_invalid,
        }
    }

    /// Handles the exit that just happened.
    pub(super) fn dispatch(&mut self) -> SvmExitReason {
        let info = self.vmcb().exit_info();
        trace!("VM exit: {:#x?}", info);

        let handler = Self::exit_handler(info.exit_code);
        #[cfg(feature = "tracing")]
        let regs = self.regs;

        let reason = handler(self, &info);

        #[cfg(feature = "tracing")]
        {
            let diff = crate::regs::GeneralRegistersDiff::new(regs, self.regs);
            if reason == SvmExitReason::None && !diff.is_same() {
                trace!("[SVM] vCPU {} exit handled in kernel: {:?}", self.id, diff);
            }
        }
        reason
    }

    /// Completes the intercepted instruction.
    fn advance(&self) {
        let vmcb = self.vmcb();
        let st = &vmcb.state;
        st.rip.set(vmcb.control.next_rip.get());
        st.rflags.set(st.rflags.get() & !RFlags::RESUME_FLAG.bits());
        vmcb.control
            .int_state
            .modify(IntState::INTERRUPT_SHADOW::CLEAR);
    }

    /// Raises #UD or #GP in the guest.
    fn inject_fault(&mut self, vector: u8) {
        warn!(
            "[SVM] vCPU {}: injecting exception {} at {:#x}",
            self.id,
            vector,
            self.vmcb().state.rip.get()
        );
        if let Ok(event) = VcpuEvent::exception(vector, 0).encode() {
            self.deliver_event(event);
        }
    }

    fn cpuid_context(&self) -> CpuidContext {
        let platform = self.machine.platform();
        CpuidContext {
            max_basic: platform.cpuid_max_basic,
            max_extended: platform.cpuid_max_extended,
            xcr0_mask: platform.xcr0_mask,
            guest_xcr0: self.gxcr0,
            guest_cr4_osxsave: self.vmcb().state.cr4.get() & Cr4Flags::OSXSAVE.bits() != 0,
            vcpu_id: self.id,
            ncpus: self.machine.vcpu_count() as u32,
        }
    }

    fn handle_host_interrupt(&mut self, _info: &SvmExitInfo) -> SvmExitReason {
        SvmExitReason::None
    }

    fn handle_vintr(&mut self, _info: &SvmExitInfo) -> SvmExitReason {
        self.set_int_window(false);
        SvmExitReason::IntReady
    }

    fn handle_iret(&mut self, _info: &SvmExitInfo) -> SvmExitReason {
        self.set_nmi_window(false);
        SvmExitReason::NmiReady
    }

    fn handle_cpuid(&mut self, info: &SvmExitInfo) -> SvmExitReason {
        let leaf = self.regs.eax();
        let subleaf = self.regs.ecx();
        let ctx = self.cpuid_context();

        let mut res = virtualize::<H>(&ctx, leaf, subleaf);
        let action = self.cpuid.apply(leaf, &mut res);
        trace!("VM exit: CPUID({:#x}, {:#x}): {:?}", leaf, subleaf, res);

        self.regs.rax = res.eax as _;
        self.regs.rbx = res.ebx as _;
        self.regs.rcx = res.ecx as _;
        self.regs.rdx = res.edx as _;

        match action {
            CpuidAction::Complete => {
                self.advance();
                SvmExitReason::None
            }
            CpuidAction::Exit => {
                self.provide(StateGroups::GPRS);
                SvmExitReason::Cpuid {
                    npc: info.guest_next_rip,
                }
            }
        }
    }

    fn handle_hlt(&mut self, _info: &SvmExitInfo) -> SvmExitReason {
        let rflags = self.vmcb().state.rflags.get();
        if self.int_window_exit && rflags & RFlags::INTERRUPT_FLAG.bits() != 0 {
            self.set_int_window(false);
        }
        self.advance();
        SvmExitReason::Halted
    }

    fn handle_io(&mut self, info: &SvmExitInfo) -> SvmExitReason {
        let io = LocalRegisterCopy::<u64, IoExitInfo::Register>::new(info.exit_info_1);

        let address_size = if io.is_set(IoExitInfo::A64) {
            8
        } else if io.is_set(IoExitInfo::A32) {
            4
        } else if io.is_set(IoExitInfo::A16) {
            2
        } else {
            0
        };
        let operand_size = if io.is_set(IoExitInfo::SZ32) {
            4
        } else if io.is_set(IoExitInfo::SZ16) {
            2
        } else if io.is_set(IoExitInfo::SZ8) {
            1
        } else {
            0
        };
        let seg = self
            .machine
            .platform()
            .decode_assist
            .then(|| io.read(IoExitInfo::SEG) as u8);

        let exit = IoExit {
            port: io.read(IoExitInfo::PORT) as u16,
            is_in: io.is_set(IoExitInfo::IN),
            seg,
            address_size,
            operand_size,
            rep: io.is_set(IoExitInfo::REP),
            str: io.is_set(IoExitInfo::STR),
            npc: info.exit_info_2,
        };
        trace!("VM exit: IO {:#x?}", exit);

        self.provide(EMULATION_STATE);
        SvmExitReason::Io(exit)
    }

    fn handle_msr(&mut self, info: &SvmExitInfo) -> SvmExitReason {
        let msr = self.regs.ecx();
        if info.exit_info_1 == 0 {
            self.handle_rdmsr(msr, info)
        } else {
            self.handle_wrmsr(msr, info)
        }
    }

    fn handle_rdmsr(&mut self, msr: u32, info: &SvmExitInfo) -> SvmExitReason {
        let val = match Msr::try_from(msr) {
            Ok(Msr::IA32_EFER) => Some(self.vmcb().state.efer.get() & !EFER_SVME),
            Ok(Msr::AMD_NB_CFG) => Some(NB_CFG_INIT_APIC_ID_CPUID_LO),
            Ok(msr) if MSR_IGNORED.contains(&msr) => Some(0),
            _ => None,
        };

        match val {
            Some(val) => {
                trace!("VM exit: RDMSR({:#x}) -> {:#x}", msr, val);
                self.regs.set_edx_eax(val);
                self.advance();
                SvmExitReason::None
            }
            None => {
                self.provide(StateGroups::GPRS);
                SvmExitReason::Rdmsr(MsrExit {
                    msr,
                    val: 0,
                    npc: info.guest_next_rip,
                })
            }
        }
    }

    fn handle_wrmsr(&mut self, msr: u32, info: &SvmExitInfo) -> SvmExitReason {
        let val = self.regs.get_edx_eax();

        match Msr::try_from(msr) {
            Ok(Msr::IA32_EFER) => {
                if val & !EFER_VALID.bits() != 0 {
                    self.inject_fault(vector::GP);
                    return SvmExitReason::None;
                }
                let vmcb = self.vmcb.as_vmcb();
                if (vmcb.state.efer.get() ^ val) & EFER_TLB_BITS.bits() != 0 {
                    self.gtlb_want_flush = true;
                }
                vmcb.state.efer.set(val | EFER_SVME);
                vmcb.control.mark_dirty(VmcbCleanBits::CRX);
            }
            Ok(Msr::IA32_TSC) => {
                self.gtsc_offset = val.wrapping_sub(H::rdtsc());
                self.gtsc_want_update = true;
            }
            Ok(msr) if MSR_IGNORED.contains(&msr) => {}
            _ => {
                self.provide(StateGroups::GPRS);
                return SvmExitReason::Wrmsr(MsrExit {
                    msr,
                    val,
                    npc: info.guest_next_rip,
                });
            }
        }

        trace!("VM exit: WRMSR({:#x}) <- {:#x}", msr, val);
        self.advance();
        SvmExitReason::None
    }

    fn handle_shutdown(&mut self, _info: &SvmExitInfo) -> SvmExitReason {
        SvmExitReason::Shutdown
    }

    /// SVM and other instructions the guest is not offered.
    fn handle_undefined(&mut self, _info: &SvmExitInfo) -> SvmExitReason {
        self.inject_fault(vector::UD);
        SvmExitReason::None
    }

    fn handle_monitor(&mut self, info: &SvmExitInfo) -> SvmExitReason {
        SvmExitReason::Monitor {
            npc: info.guest_next_rip,
        }
    }

    fn handle_mwait(&mut self, info: &SvmExitInfo) -> SvmExitReason {
        SvmExitReason::Mwait {
            npc: info.guest_next_rip,
        }
    }

    fn handle_xsetbv(&mut self, _info: &SvmExitInfo) -> SvmExitReason {
        const XCR_XCR0: u32 = 0;

        let index = self.regs.ecx();
        let value = self.regs.get_edx_eax();
        let cpl = self.vmcb().state.cpl.get();
        let xcr0_mask = self.machine.platform().xcr0_mask;

        if index != XCR_XCR0 || cpl != 0 || !valid_guest_xcr0(value, xcr0_mask) {
            self.inject_fault(vector::GP);
            return SvmExitReason::None;
        }

        trace!("VM exit: XSETBV({:#x}, {:#x})", index, value);
        self.gxcr0 = value;
        self.advance();
        SvmExitReason::None
    }

    fn handle_npf(&mut self, info: &SvmExitInfo) -> SvmExitReason {
        let fault = LocalRegisterCopy::<u64, NpfExitInfo::Register>::new(info.exit_info_1);
        let access = if fault.is_set(NpfExitInfo::W) {
            MemoryAccess::Write
        } else if fault.is_set(NpfExitInfo::ID) {
            MemoryAccess::Exec
        } else {
            MemoryAccess::Read
        };
        let (inst_len, inst_bytes) = self.vmcb().insn_bytes();

        let exit = MemoryExit {
            gpa: info.exit_info_2,
            access,
            inst_len,
            inst_bytes,
        };
        trace!("VM exit: NPF {:#x?}", exit);

        self.provide(EMULATION_STATE);
        SvmExitReason::Memory(exit)
    }

    fn handle_invalid(&mut self, info: &SvmExitInfo) -> SvmExitReason {
        let hwcode = match info.exit_code {
            Ok(code) => code as u64,
            Err(raw) => raw,
        };
        warn!("[SVM] vCPU {}: unhandled exit {:#x}: {:#x?}", self.id, hwcode, self);
        SvmExitReason::Invalid { hwcode }
    }
}
