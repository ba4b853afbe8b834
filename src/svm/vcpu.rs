use alloc::sync::Arc;
use core::fmt::{Debug, Formatter, Result};
use core::ops::{Deref, DerefMut};

use axerrno::{AxResult, ax_err};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::rflags::RFlags;

use super::asid::Asid;
use super::cpuid::{CpuidTable, VcpuConfig};
use super::definitions::{DEFAULT_INTERCEPTS, SvmExitCode, SvmIntercept};
use super::machine::{NestedPagingContext, SvmMachine};
use super::structs::{IOPm, MSRPm, VmcbFrame};
use super::vmcb::{
    EventInj, IntState, NestedCtl, VIntr, VmcbCleanBits, VmcbStruct, VmcbTlbControl,
};
use crate::event::{EncodedEvent, VcpuEvent};
use crate::exit::{ExitState, SvmExitReason, SvmVcpuExit};
use crate::hal::SvmVCpuHal;
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::state::{GuestState, StateGroups};
use crate::xstate::XState;

/// MSRs the guest reads and writes without exiting.
const PASSTHROUGH_MSRS: &[Msr] = &[
    Msr::IA32_STAR,
    Msr::IA32_LSTAR,
    Msr::IA32_CSTAR,
    Msr::IA32_FMASK,
    Msr::IA32_KERNEL_GSBASE,
    Msr::IA32_SYSENTER_CS,
    Msr::IA32_SYSENTER_ESP,
    Msr::IA32_SYSENTER_EIP,
    Msr::IA32_FS_BASE,
    Msr::IA32_GS_BASE,
    Msr::IA32_PAT,
];

/// A virtual CPU running on AMD-SVM.
pub struct SvmVcpu<H: SvmVCpuHal, M: NestedPagingContext> {
    pub(super) id: u32,
    pub(super) machine: Arc<SvmMachine<H, M>>,
    pub(super) vmcb: VmcbFrame<H>,
    /// Where VMSAVE parks the host's FS/GS/TR/LDTR/SYSCALL state around VMRUN.
    host_save: VmcbFrame<H>,
    iopm: IOPm<H>,
    msrpm: MSRPm<H>,
    asid: Asid,

    /// Guest GPRs. RAX is mirrored into the VMCB around VMRUN.
    pub(super) regs: GeneralRegisters,
    /// Guest DR0-DR3; DR6 and DR7 live in the VMCB.
    pub(super) drs: [u64; 4],
    pub(super) xstate: XState,
    pub(super) gxcr0: u64,
    pub(super) cpuid: CpuidTable,

    /// State handed out by `get_state`, valid for the groups in `cached`.
    pub(super) state: GuestState,
    pub(super) cached: StateGroups,

    queued_event: Option<EncodedEvent>,
    /// EVENTINJ holds an event the guest has not taken yet.
    pub(super) evt_pending: bool,
    pub(super) int_window_exit: bool,
    pub(super) nmi_window_exit: bool,

    pub(super) gtlb_want_flush: bool,
    htlb_want_flush: bool,
    vcpu_htlb_gen: u64,
    hcpu_last: Option<usize>,

    pub(super) gtsc_want_update: bool,
    pub(super) gtsc_offset: u64,
    /// Last TSC reported by `get_state`.
    pub(super) gtsc_match: u64,
}

impl<H: SvmVCpuHal, M: NestedPagingContext> SvmVcpu<H, M> {
    /// Creates vCPU `id` of `machine`, in the power-on state.
    pub fn new(machine: Arc<SvmMachine<H, M>>, id: u32) -> AxResult<Self> {
        let vmcb = VmcbFrame::new()?;
        let host_save = VmcbFrame::new()?;
        let iopm = IOPm::intercept_all()?;
        let msrpm = MSRPm::intercept_all()?;
        let asid = machine.platform().asids().acquire();

        let mut vcpu = Self {
            id,
            machine,
            vmcb,
            host_save,
            iopm,
            msrpm,
            asid,
            regs: GeneralRegisters::default(),
            drs: [0; 4],
            xstate: XState::new(),
            gxcr0: 0,
            cpuid: CpuidTable::new(),
            state: GuestState::reset(),
            cached: StateGroups::empty(),
            queued_event: None,
            evt_pending: false,
            int_window_exit: false,
            nmi_window_exit: false,
            gtlb_want_flush: false,
            htlb_want_flush: false,
            vcpu_htlb_gen: 0,
            hcpu_last: None,
            gtsc_want_update: false,
            gtsc_offset: 0,
            gtsc_match: 0,
        };
        vcpu.machine.vcpu_created();
        vcpu.setup_vmcb();
        vcpu.set_state(StateGroups::all(), &GuestState::reset());

        info!(
            "[SVM] created vCPU {} (vmcb: {:#x}, asid: {})",
            vcpu.id,
            vcpu.vmcb.phys_addr(),
            vcpu.asid.tag
        );
        Ok(vcpu)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn machine(&self) -> &Arc<SvmMachine<H, M>> {
        &self.machine
    }

    /// Applies a per-vCPU configuration operation. On error nothing changes.
    pub fn configure(&mut self, conf: VcpuConfig) -> AxResult {
        match conf {
            VcpuConfig::Cpuid(conf) => self.cpuid.set(&conf),
            VcpuConfig::CpuidRemove { leaf } => {
                self.cpuid.remove(leaf);
                Ok(())
            }
            VcpuConfig::Tpr { .. } => ax_err!(InvalidInput, "TPR exits are not supported on SVM"),
        }
    }

    /// Queues `event` for delivery on the next guest entry.
    ///
    /// Only one event can be outstanding: this fails with `ResourceBusy` while
    /// an earlier one is queued or still waiting in EVENTINJ.
    pub fn inject(&mut self, event: VcpuEvent) -> AxResult {
        let encoded = event.encode()?;
        if self.queued_event.is_some() || self.vmcb().control.event_pending() {
            return ax_err!(ResourceBusy, "an event is already pending");
        }
        debug!("[SVM] vCPU {} queued {:?}", self.id, event);
        self.queued_event = Some(encoded);
        Ok(())
    }

    /// Runs the guest until something needs the caller.
    pub fn run(&mut self) -> AxResult<SvmVcpuExit> {
        if H::return_needed() {
            self.cached = StateGroups::empty();
            return Ok(self.exit_record(SvmExitReason::None));
        }
        loop {
            let exit = self.run_guest()?;
            match exit.reason {
                SvmExitReason::Memory(mem)
                    if !H::return_needed()
                        && self.machine.memory().resolve_fault(mem.gpa, mem.access) =>
                {
                    continue;
                }
                _ => return Ok(exit),
            }
        }
    }

    pub(crate) fn vmcb(&self) -> &VmcbStruct {
        self.vmcb.as_vmcb()
    }

    fn event_pending(&self) -> bool {
        self.evt_pending || self.queued_event.is_some()
    }

    /// Enables or disables the exit on the guest becoming interruptible.
    pub(super) fn set_int_window(&mut self, enable: bool) {
        let ctl = &self.vmcb.as_vmcb().control;
        ctl.set_intercept(SvmIntercept::VINTR, enable);
        if enable {
            ctl.int_control
                .modify(VIntr::V_IRQ::SET + VIntr::V_IGN_TPR::SET);
        } else {
            ctl.int_control
                .modify(VIntr::V_IRQ::CLEAR + VIntr::V_IGN_TPR::CLEAR);
        }
        ctl.mark_dirty(VmcbCleanBits::INTERCEPTS | VmcbCleanBits::TPR);
        self.int_window_exit = enable;
    }

    /// Enables or disables the exit on the guest leaving its NMI handler.
    pub(super) fn set_nmi_window(&mut self, enable: bool) {
        let ctl = &self.vmcb.as_vmcb().control;
        ctl.set_intercept(SvmIntercept::IRET, enable);
        ctl.mark_dirty(VmcbCleanBits::INTERCEPTS);
        self.nmi_window_exit = enable;
    }

    /// Writes a validated event into EVENTINJ.
    pub(super) fn deliver_event(&mut self, event: EncodedEvent) {
        let vmcb = self.vmcb.as_vmcb();
        vmcb.control.set_event_injection(event.eventinj);
        if event.sets_rf {
            let st = &vmcb.state;
            st.rflags.set(st.rflags.get() | RFlags::RESUME_FLAG.bits());
        }
        if event.nmi {
            self.set_nmi_window(true);
        }
        self.evt_pending = true;
    }

    fn setup_vmcb(&mut self) {
        let vmcb = self.vmcb.as_vmcb();
        let ctl = &vmcb.control;

        ctl.intercept_cr.set(0);
        ctl.intercept_dr.set(0);
        ctl.intercept_exceptions.set(0);
        for &intc in DEFAULT_INTERCEPTS {
            ctl.set_intercept(intc, true);
        }

        for &msr in PASSTHROUGH_MSRS {
            self.msrpm.passthrough(msr as u32);
        }
        self.msrpm.passthrough_read(Msr::IA32_TSC as u32);
        ctl.iopm_base_pa.set(self.iopm.phys_addr().as_usize() as u64);
        ctl.msrpm_base_pa.set(self.msrpm.phys_addr().as_usize() as u64);

        ctl.guest_asid.set(self.asid.tag);
        ctl.set_tlb_control(VmcbTlbControl::CONTROL::DoNothing);
        ctl.int_control.write(VIntr::V_INTR_MASKING::SET);
        ctl.nested_ctl.write(NestedCtl::NP_ENABLE::SET);
        ctl.nested_cr3
            .set(self.machine.memory().nested_root().as_usize() as u64);

        let xcr0_mask = self.machine.platform().xcr0_mask();
        self.xstate.guest.header[0] = xcr0_mask;
        ctl.flush_clean();
    }

    fn exit_record(&self, reason: SvmExitReason) -> SvmVcpuExit {
        let vmcb = self.vmcb();
        SvmVcpuExit {
            reason,
            state: ExitState {
                rflags: vmcb.state.rflags.get(),
                cr8: vmcb.control.int_control.read(VIntr::V_TPR),
                int_shadow: vmcb.control.int_state.is_set(IntState::INTERRUPT_SHADOW),
                int_window_exiting: self.int_window_exit,
                nmi_window_exiting: self.nmi_window_exit,
                evt_pending: self.event_pending(),
            },
            provided: self.cached,
        }
    }

    /// One pass through the guest: enter, handle exits in the kernel, and
    /// stop at the first one the caller has to see.
    fn run_guest(&mut self) -> AxResult<SvmVcpuExit> {
        self.cached = StateGroups::empty();

        H::preempt_disable();
        let hcpu = H::current_cpu_id();

        let result = HostContext::enter(self).run_loop(hcpu);
        H::preempt_enable();
        result
    }

    fn run_loop(&mut self, hcpu: usize) -> AxResult<SvmVcpuExit> {
        loop {
            let migrated = self.hcpu_last != Some(hcpu);
            if migrated || self.asid.shared {
                self.gtlb_want_flush = true;
                self.vmcb().control.flush_clean();
            }
            if migrated {
                self.gtsc_want_update = true;
            }

            let ctl = &self.vmcb.as_vmcb().control;
            if self.gtlb_want_flush || self.htlb_want_flush {
                ctl.set_tlb_control(self.machine.platform().tlb_flush());
            } else {
                ctl.set_tlb_control(VmcbTlbControl::CONTROL::DoNothing);
            }
            if self.gtsc_want_update {
                ctl.tsc_offset.set(self.gtsc_offset);
                ctl.mark_dirty(VmcbCleanBits::INTERCEPTS);
            }

            let exit_code = {
                let mut guest = GuestWindow::enter(self);
                let machgen = guest.htlb_catchup();
                if H::host_event_pending() {
                    return ax_err!(WouldBlock, "host event pending");
                }
                guest.commit_event();
                guest.vmrun();
                let exit_code = guest.vmcb().control.exit_code.get();
                if exit_code != SvmExitCode::INVALID as u64 {
                    guest.vcpu_htlb_gen = machgen;
                    guest.htlb_want_flush = false;
                }
                exit_code
            };

            let vmcb = self.vmcb.as_vmcb();
            vmcb.control.reset_clean();
            let entered = exit_code != SvmExitCode::INVALID as u64;
            if entered {
                self.gtlb_want_flush = false;
                self.gtsc_want_update = false;
                self.hcpu_last = Some(hcpu);
                self.rearm_event();
            }

            let reason = self.dispatch();
            if H::return_needed() || reason != SvmExitReason::None {
                return Ok(self.exit_record(reason));
            }
        }
    }

    /// Whether the machine's nested page tables changed since the last
    /// flush. Returns the generation to acknowledge once the guest ran.
    fn htlb_catchup(&mut self) -> u64 {
        let machgen = self.machine.tlb_generation();
        if machgen != self.vcpu_htlb_gen {
            self.htlb_want_flush = true;
            self.vmcb()
                .control
                .set_tlb_control(self.machine.platform().tlb_flush());
        }
        machgen
    }

    /// Moves the queued event into EVENTINJ, unless the VMCB still holds one.
    fn commit_event(&mut self) {
        if self.vmcb().control.event_pending() {
            return;
        }
        if let Some(event) = self.queued_event.take() {
            self.deliver_event(event);
        }
    }

    fn vmrun(&mut self) {
        let vmcb = self.vmcb.as_vmcb();
        vmcb.state.rax.set(self.regs.rax);
        unsafe {
            H::vmrun(
                self.vmcb.phys_addr(),
                self.host_save.phys_addr(),
                &mut self.regs,
            );
        }
        self.regs.rax = vmcb.state.rax.get();
    }

    /// An event interrupted by the exit goes back into EVENTINJ.
    fn rearm_event(&mut self) {
        let ctl = &self.vmcb.as_vmcb().control;
        let info = ctl.exit_int_info.get();
        if ctl.exit_int_info.is_set(EventInj::VALID) {
            ctl.set_event_injection(info);
            self.evt_pending = true;
        } else {
            ctl.set_event_injection(0);
            self.evt_pending = false;
        }
    }
}

#[cfg(test)]
impl<H: SvmVCpuHal, M: NestedPagingContext> SvmVcpu<H, M> {
    pub(crate) fn asid(&self) -> Asid {
        self.asid
    }

    pub(crate) fn iopm(&self) -> &IOPm<H> {
        &self.iopm
    }

    pub(crate) fn msrpm(&self) -> &MSRPm<H> {
        &self.msrpm
    }

    pub(crate) fn tlb_flush_wanted(&self) -> bool {
        self.gtlb_want_flush
    }

    pub(crate) fn acked_tlb_generation(&self) -> u64 {
        self.vcpu_htlb_gen
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> Drop for SvmVcpu<H, M> {
    fn drop(&mut self) {
        self.machine.platform().asids().release(self.asid);
        self.machine.vcpu_destroyed();
        info!("[SVM] destroyed vCPU {}", self.id);
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> Debug for SvmVcpu<H, M> {
    fn fmt(&self, f: &mut Formatter) -> Result {
        let st = &self.vmcb().state;
        f.debug_struct("SvmVcpu")
            .field("id", &self.id)
            .field("asid", &self.asid)
            .field("regs", &self.regs)
            .field("rip", &st.rip.get())
            .field("rsp", &st.rsp.get())
            .field("rflags", &st.rflags.get())
            .field("cr0", &st.cr0.get())
            .field("cr3", &st.cr3.get())
            .field("cr4", &st.cr4.get())
            .field("efer", &st.efer.get())
            .field("cs", &st.cs.get())
            .field("evt_pending", &self.evt_pending)
            .field("hcpu_last", &self.hcpu_last)
            .finish()
    }
}

/// Host debug registers, replaced by the guest's while the vCPU runs.
struct HostContext<'a, H: SvmVCpuHal, M: NestedPagingContext> {
    vcpu: &'a mut SvmVcpu<H, M>,
    /// DR0-DR3, DR6, DR7.
    drs: [u64; 6],
}

const HOST_DRS: [u8; 6] = [0, 1, 2, 3, 6, 7];

impl<'a, H: SvmVCpuHal, M: NestedPagingContext> HostContext<'a, H, M> {
    fn enter(vcpu: &'a mut SvmVcpu<H, M>) -> Self {
        let drs = HOST_DRS.map(H::read_dr);
        unsafe {
            H::write_dr(7, 0);
            for (i, &val) in vcpu.drs.iter().enumerate() {
                H::write_dr(i as u8, val);
            }
        }
        Self { vcpu, drs }
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> Drop for HostContext<'_, H, M> {
    fn drop(&mut self) {
        for (i, dr) in self.vcpu.drs.iter_mut().enumerate() {
            *dr = H::read_dr(i as u8);
        }
        unsafe {
            for (&index, &val) in HOST_DRS.iter().zip(self.drs.iter()) {
                H::write_dr(index, val);
            }
        }
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> Deref for HostContext<'_, H, M> {
    type Target = SvmVcpu<H, M>;

    fn deref(&self) -> &Self::Target {
        self.vcpu
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> DerefMut for HostContext<'_, H, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.vcpu
    }
}

/// The stretch around VMRUN with GIF cleared and the guest FPU loaded.
struct GuestWindow<'a, H: SvmVCpuHal, M: NestedPagingContext> {
    vcpu: &'a mut SvmVcpu<H, M>,
    xcr0_mask: u64,
}

impl<'a, H: SvmVCpuHal, M: NestedPagingContext> GuestWindow<'a, H, M> {
    fn enter(vcpu: &'a mut SvmVcpu<H, M>) -> Self {
        let xcr0_mask = vcpu.machine.platform().xcr0_mask();
        unsafe { H::clgi() };
        vcpu.xstate.switch_to_guest::<H>(xcr0_mask, vcpu.gxcr0);
        Self { vcpu, xcr0_mask }
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> Drop for GuestWindow<'_, H, M> {
    fn drop(&mut self) {
        self.vcpu.xstate.switch_to_host::<H>(self.xcr0_mask);
        unsafe { H::stgi() };
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> Deref for GuestWindow<'_, H, M> {
    type Target = SvmVcpu<H, M>;

    fn deref(&self) -> &Self::Target {
        self.vcpu
    }
}

impl<H: SvmVCpuHal, M: NestedPagingContext> DerefMut for GuestWindow<'_, H, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.vcpu
    }
}
