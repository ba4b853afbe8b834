//! Moving guest state between the caller's [`GuestState`] and the VMCB.

use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;

use super::machine::NestedPagingContext;
use super::vcpu::SvmVcpu;
use super::vmcb::{IntState, VIntr, VmcbCleanBits, VmcbStruct};
use crate::hal::SvmVCpuHal;
use crate::state::{GuestState, StateGroups};
use crate::xstate::XCR0_X87;

const CR0_TLB_BITS: Cr0Flags = Cr0Flags::PAGING
    .union(Cr0Flags::WRITE_PROTECT)
    .union(Cr0Flags::CACHE_DISABLE)
    .union(Cr0Flags::NOT_WRITE_THROUGH);

const CR4_TLB_BITS: Cr4Flags = Cr4Flags::PAGE_SIZE_EXTENSION
    .union(Cr4Flags::PHYSICAL_ADDRESS_EXTENSION)
    .union(Cr4Flags::PAGE_GLOBAL)
    .union(Cr4Flags::PCID)
    .union(Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION);

pub(super) const EFER_TLB_BITS: EferFlags = EferFlags::NO_EXECUTE_ENABLE
    .union(EferFlags::LONG_MODE_ACTIVE)
    .union(EferFlags::LONG_MODE_ENABLE);

pub(super) const EFER_SVME: u64 = EferFlags::SECURE_VIRTUAL_MACHINE_ENABLE.bits();

/// Whether loading `state` changes how the guest translates addresses.
fn changes_translation(vmcb: &VmcbStruct, groups: StateGroups, state: &GuestState) -> bool {
    let st = &vmcb.state;
    if groups.contains(StateGroups::CRS) {
        let crs = &state.crs;
        if (st.cr0.get() ^ crs.cr0) & CR0_TLB_BITS.bits() != 0
            || st.cr3.get() != crs.cr3
            || (st.cr4.get() ^ crs.cr4) & CR4_TLB_BITS.bits() != 0
        {
            return true;
        }
    }
    groups.contains(StateGroups::MSRS)
        && (st.efer.get() ^ state.msrs.efer) & EFER_TLB_BITS.bits() != 0
}

impl<H: SvmVCpuHal, M: NestedPagingContext> SvmVcpu<H, M> {
    /// Loads the `groups` of `state` into the vCPU.
    ///
    /// Values are clamped to what the guest may hold: EFER keeps SVME
    /// internally, XCR0 is masked with the platform's XCR0 mask and always
    /// has x87, and the MXCSR is masked with the host's MXCSR mask.
    pub fn set_state(&mut self, groups: StateGroups, state: &GuestState) {
        let vmcb = self.vmcb.as_vmcb();
        let st = &vmcb.state;
        let ctl = &vmcb.control;
        let platform = self.machine.platform();

        if changes_translation(vmcb, groups, state) {
            self.gtlb_want_flush = true;
        }

        if groups.contains(StateGroups::SEGS) {
            let segs = &state.segs;
            st.cs.set(&segs.cs);
            st.ds.set(&segs.ds);
            st.es.set(&segs.es);
            st.fs.set(&segs.fs);
            st.gs.set(&segs.gs);
            st.ss.set(&segs.ss);
            st.gdtr.set(&segs.gdt);
            st.idtr.set(&segs.idt);
            st.ldtr.set(&segs.ldt);
            st.tr.set(&segs.tr);
            st.cpl.set(segs.ss.attrib.dpl);
            ctl.mark_dirty(VmcbCleanBits::SEG | VmcbCleanBits::DT);
        }

        if groups.contains(StateGroups::GPRS) {
            let gprs = &state.gprs;
            self.regs = gprs.regs;
            st.rax.set(gprs.regs.rax);
            st.rsp.set(gprs.rsp);
            st.rip.set(gprs.rip);
            st.rflags.set(gprs.rflags);
        }

        if groups.contains(StateGroups::CRS) {
            let crs = &state.crs;
            st.cr0.set(crs.cr0);
            st.cr2.set(crs.cr2);
            st.cr3.set(crs.cr3);
            st.cr4.set(crs.cr4);
            ctl.int_control.modify(VIntr::V_TPR.val(crs.cr8 & 0xf));
            if platform.xcr0_mask != 0 {
                self.gxcr0 = (crs.xcr0 & platform.xcr0_mask) | XCR0_X87;
            }
            ctl.mark_dirty(VmcbCleanBits::CRX | VmcbCleanBits::CR2 | VmcbCleanBits::TPR);
        }

        if groups.contains(StateGroups::DRS) {
            let drs = &state.drs;
            self.drs = [drs.dr0, drs.dr1, drs.dr2, drs.dr3];
            st.dr6.set(drs.dr6);
            st.dr7.set(drs.dr7);
            ctl.mark_dirty(VmcbCleanBits::DRX);
        }

        if groups.contains(StateGroups::MSRS) {
            let msrs = &state.msrs;
            st.efer.set(msrs.efer | EFER_SVME);
            st.star.set(msrs.star);
            st.lstar.set(msrs.lstar);
            st.cstar.set(msrs.cstar);
            st.sfmask.set(msrs.sfmask);
            st.kernel_gs_base.set(msrs.kernel_gs_base);
            st.sysenter_cs.set(msrs.sysenter_cs);
            st.sysenter_esp.set(msrs.sysenter_esp);
            st.sysenter_eip.set(msrs.sysenter_eip);
            st.g_pat.set(msrs.pat);
            // A TSC handed back unchanged from get_state is left alone.
            if msrs.tsc != 0 && msrs.tsc != self.gtsc_match {
                self.gtsc_offset = msrs.tsc.wrapping_sub(H::rdtsc());
                self.gtsc_want_update = true;
            }
            ctl.mark_dirty(VmcbCleanBits::CRX | VmcbCleanBits::NP);
        }

        if groups.contains(StateGroups::INTR) {
            let intr = &state.intr;
            if intr.int_shadow {
                ctl.int_state.modify(IntState::INTERRUPT_SHADOW::SET);
            } else {
                ctl.int_state.modify(IntState::INTERRUPT_SHADOW::CLEAR);
            }
            self.set_int_window(intr.int_window_exiting);
            self.set_nmi_window(intr.nmi_window_exiting);
        }

        if groups.contains(StateGroups::FPU) {
            let xcr0_mask = self.machine.platform().xcr0_mask;
            let mxcsr_mask = self.machine.platform().mxcsr_mask;
            let fpu = &mut self.xstate.guest.legacy;
            *fpu = state.fpu;
            // A zero mask stands for the host's, as with FXSAVE.
            fpu.fx_mxcsr_mask = match fpu.fx_mxcsr_mask {
                0 => mxcsr_mask,
                mask => mask & mxcsr_mask,
            };
            fpu.fx_mxcsr &= fpu.fx_mxcsr_mask;
            if xcr0_mask != 0 {
                // XSTATE_BV: XRSTOR loads every enabled component.
                self.xstate.guest.header[0] = xcr0_mask;
            }
        }

        self.cached.remove(groups);
    }

    /// Returns the vCPU state, with at least `groups` up to date.
    ///
    /// Groups already fetched since the last [`SvmVcpu::run`] are not read
    /// again.
    pub fn get_state(&mut self, groups: StateGroups) -> &GuestState {
        let wanted = groups.difference(self.cached);
        let vmcb = self.vmcb.as_vmcb();
        let st = &vmcb.state;
        let ctl = &vmcb.control;
        let out = &mut self.state;

        if wanted.contains(StateGroups::SEGS) {
            let segs = &mut out.segs;
            segs.cs = st.cs.get();
            segs.ds = st.ds.get();
            segs.es = st.es.get();
            segs.fs = st.fs.get();
            segs.gs = st.gs.get();
            segs.ss = st.ss.get();
            segs.gdt = st.gdtr.get();
            segs.idt = st.idtr.get();
            segs.ldt = st.ldtr.get();
            segs.tr = st.tr.get();
            segs.ss.attrib.dpl = st.cpl.get();
        }

        if wanted.contains(StateGroups::GPRS) {
            let gprs = &mut out.gprs;
            gprs.regs = self.regs;
            gprs.rsp = st.rsp.get();
            gprs.rip = st.rip.get();
            gprs.rflags = st.rflags.get();
        }

        if wanted.contains(StateGroups::CRS) {
            let crs = &mut out.crs;
            crs.cr0 = st.cr0.get();
            crs.cr2 = st.cr2.get();
            crs.cr3 = st.cr3.get();
            crs.cr4 = st.cr4.get();
            crs.cr8 = ctl.int_control.read(VIntr::V_TPR);
            crs.xcr0 = self.gxcr0;
        }

        if wanted.contains(StateGroups::DRS) {
            let drs = &mut out.drs;
            [drs.dr0, drs.dr1, drs.dr2, drs.dr3] = self.drs;
            drs.dr6 = st.dr6.get();
            drs.dr7 = st.dr7.get();
        }

        if wanted.contains(StateGroups::MSRS) {
            let msrs = &mut out.msrs;
            msrs.efer = st.efer.get() & !EFER_SVME;
            msrs.star = st.star.get();
            msrs.lstar = st.lstar.get();
            msrs.cstar = st.cstar.get();
            msrs.sfmask = st.sfmask.get();
            msrs.kernel_gs_base = st.kernel_gs_base.get();
            msrs.sysenter_cs = st.sysenter_cs.get();
            msrs.sysenter_esp = st.sysenter_esp.get();
            msrs.sysenter_eip = st.sysenter_eip.get();
            msrs.pat = st.g_pat.get();
            msrs.tsc = H::rdtsc().wrapping_add(self.gtsc_offset);
            self.gtsc_match = msrs.tsc;
        }

        if wanted.contains(StateGroups::INTR) {
            let intr = &mut out.intr;
            intr.int_shadow = ctl.int_state.is_set(IntState::INTERRUPT_SHADOW);
            intr.int_window_exiting = self.int_window_exit;
            intr.nmi_window_exiting = self.nmi_window_exit;
            intr.evt_pending = self.evt_pending;
        }

        if wanted.contains(StateGroups::FPU) {
            out.fpu = self.xstate.guest.legacy;
        }

        self.cached.insert(wanted);
        &self.state
    }

    /// Fetches `groups` ahead of an exit the caller will most likely
    /// handle with them.
    pub(super) fn provide(&mut self, groups: StateGroups) {
        self.get_state(groups);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tlb_bit_sets() {
        assert_eq!(CR0_TLB_BITS.bits(), (1 << 31) | (1 << 16) | (1 << 30) | (1 << 29));
        assert_eq!(EFER_TLB_BITS.bits(), (1 << 11) | (1 << 10) | (1 << 8));
        assert_eq!(EFER_SVME, 1 << 12);
        assert_eq!(
            CR4_TLB_BITS.bits(),
            (1 << 4) | (1 << 5) | (1 << 7) | (1 << 17) | (1 << 20)
        );
    }
}
