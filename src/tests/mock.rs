//! A software host for driving the engine without SVM hardware.
//!
//! The host state lives in a thread local, so each test owns its own CPU.
//! VMRUN pops the next scripted exit and applies it to the VMCB.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use std::alloc::{Layout, alloc_zeroed, dealloc};

use raw_cpuid::CpuIdResult;
use tock_registers::interfaces::{Readable, Writeable};

use crate::exit::MemoryAccess;
use crate::hal::{HostPhysAddr, HostVirtAddr, SvmVCpuHal};
use crate::regs::GeneralRegisters;
use crate::state::FpuState;
use crate::svm::vmcb::VmcbStruct;
use crate::svm::{
    GuestPhysAddr, NestedPagingContext, SvmConfig, SvmExitCode, SvmMachine, SvmPlatform, SvmVcpu,
};
use crate::xstate::XSaveArea;

const PAGE_SIZE: usize = 0x1000;

pub const HOST_MXCSR_MASK: u32 = 0xffbf;
pub const HOST_XCR0: u64 = 0x7;
pub const SVM_ASIDS: u32 = 16;

/// Leaves whose output depends on ECX. The rest ignore it, as on hardware.
const INDEXED_LEAVES: [u32; 2] = [0x7, 0xd];

pub type Script = Box<dyn FnMut(&VmcbStruct, &mut GeneralRegisters)>;

/// The VMCB as the mock processor found it on VMRUN.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub tlb_control: u8,
    pub event_inj: u64,
    pub clean_bits: u32,
    pub tsc_offset: u64,
    pub rax: u64,
    pub rip: u64,
    pub xcr0: u64,
    pub dr: [u64; 8],
}

pub struct MockState {
    pub cpu_id: usize,
    pub tsc: u64,
    pub host_event_pending: bool,
    pub return_needed: bool,
    pub kicks: usize,
    pub dr: [u64; 8],
    pub xcr0: u64,
    /// The FPU registers of the mock CPU.
    pub fpu: FpuState,
    pub gif: bool,
    pub preempt_depth: i32,
    pub frames: usize,
    pub msrs: BTreeMap<u32, u64>,
    pub cpuid: BTreeMap<(u32, u32), CpuIdResult>,
    pub scripts: VecDeque<Script>,
    pub entries: Vec<Entry>,
}

fn leaf(eax: u32, ebx: u32, ecx: u32, edx: u32) -> CpuIdResult {
    CpuIdResult { eax, ebx, ecx, edx }
}

impl MockState {
    fn new() -> Self {
        let mut cpuid = BTreeMap::new();
        // "AuthenticAMD"
        cpuid.insert((0, 0), leaf(0x10, 0x6874_7541, 0x444d_4163, 0x6974_6e65));
        cpuid.insert((1, 0), leaf(0x00a2_0f10, 0x0010_0800, 1 << 26, 0x178b_fbff));
        cpuid.insert((7, 0), leaf(0, 0x219c_91a9, 0, 0));
        cpuid.insert((0xd, 0), leaf(0x7, 0x340, 0x340, 0));
        cpuid.insert((0xd, 1), leaf(0xf, 0, 0, 0));
        cpuid.insert((0xd, 2), leaf(0x100, 0x240, 0, 0));
        cpuid.insert((0x8000_0000, 0), leaf(0x8000_0021, 0x6874_7541, 0x444d_4163, 0x6974_6e65));
        // SVM, LAHF
        cpuid.insert((0x8000_0001, 0), leaf(0, 0, (1 << 2) | 1, 1 << 29));
        // NP, NRIPS, FlushByAsid, DecodeAssists
        cpuid.insert(
            (0x8000_000a, 0),
            leaf(1, SVM_ASIDS, 0, (1 << 0) | (1 << 3) | (1 << 6) | (1 << 7)),
        );

        let mut fpu = FpuState::default();
        fpu.fx_cw = 0x037f;
        fpu.fx_mxcsr = 0x1f80;

        let mut dr = [0; 8];
        dr[6] = 0xffff_0ff0;
        dr[7] = 0x400;

        Self {
            cpu_id: 0,
            tsc: 0,
            host_event_pending: false,
            return_needed: false,
            kicks: 0,
            dr,
            xcr0: HOST_XCR0,
            fpu,
            gif: true,
            preempt_depth: 0,
            frames: 0,
            msrs: BTreeMap::new(),
            cpuid,
            scripts: VecDeque::new(),
            entries: Vec::new(),
        }
    }
}

std::thread_local! {
    static STATE: RefCell<MockState> = RefCell::new(MockState::new());
}

pub fn with<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
    STATE.with(|s| f(&mut s.borrow_mut()))
}

/// Puts the mock CPU back into its power-on state.
pub fn reset() {
    with(|s| *s = MockState::new());
}

pub fn entries() -> Vec<Entry> {
    with(|s| s.entries.clone())
}

/// Queues a raw VMRUN behaviour.
pub fn push(script: impl FnMut(&VmcbStruct, &mut GeneralRegisters) + 'static) {
    with(|s| s.scripts.push_back(Box::new(script)));
}

/// Queues the #VMEXIT `exit`.
pub fn push_exit(exit: Exit) {
    push(move |vmcb, _| exit.apply(vmcb));
}

/// A #VMEXIT as the processor reports it.
#[derive(Debug, Clone, Copy)]
pub struct Exit {
    code: u64,
    info1: u64,
    info2: u64,
    int_info: u64,
    insn_len: u64,
}

impl Exit {
    pub fn new(code: SvmExitCode) -> Self {
        Self::raw(code as u64)
    }

    pub fn raw(code: u64) -> Self {
        Self {
            code,
            info1: 0,
            info2: 0,
            int_info: 0,
            insn_len: 0,
        }
    }

    pub fn info(mut self, info1: u64, info2: u64) -> Self {
        self.info1 = info1;
        self.info2 = info2;
        self
    }

    pub fn int_info(mut self, int_info: u64) -> Self {
        self.int_info = int_info;
        self
    }

    /// Length of the intercepted instruction, for NRIP.
    pub fn insn(mut self, len: u64) -> Self {
        self.insn_len = len;
        self
    }

    pub fn apply(&self, vmcb: &VmcbStruct) {
        let ctl = &vmcb.control;
        ctl.exit_code.set(self.code);
        ctl.exit_info_1.set(self.info1);
        ctl.exit_info_2.set(self.info2);
        ctl.exit_int_info.set(self.int_info);
        ctl.next_rip.set(vmcb.state.rip.get() + self.insn_len);
    }
}

pub struct MockHal;

impl SvmVCpuHal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        Self::alloc_contiguous_frames(1)
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        Self::dealloc_contiguous_frames(paddr, 1)
    }

    fn alloc_contiguous_frames(num: usize) -> Option<HostPhysAddr> {
        let layout = Layout::from_size_align(num * PAGE_SIZE, PAGE_SIZE).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        with(|s| s.frames += num);
        Some(HostPhysAddr::from(ptr as usize))
    }

    fn dealloc_contiguous_frames(paddr: HostPhysAddr, num: usize) {
        let layout = Layout::from_size_align(num * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { dealloc(paddr.as_usize() as *mut u8, layout) };
        with(|s| s.frames -= num);
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn current_cpu_id() -> usize {
        with(|s| s.cpu_id)
    }

    fn preempt_disable() {
        with(|s| s.preempt_depth += 1);
    }

    fn preempt_enable() {
        with(|s| s.preempt_depth -= 1);
    }

    fn host_event_pending() -> bool {
        with(|s| s.host_event_pending)
    }

    fn return_needed() -> bool {
        with(|s| s.return_needed)
    }

    fn kick_all_cpus() {
        with(|s| s.kicks += 1);
    }

    fn cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
        with(|s| {
            s.cpuid
                .get(&(leaf, if INDEXED_LEAVES.contains(&leaf) { subleaf } else { 0 }))
                .copied()
                .unwrap_or(CpuIdResult {
                    eax: 0,
                    ebx: 0,
                    ecx: 0,
                    edx: 0,
                })
        })
    }

    fn rdtsc() -> u64 {
        with(|s| s.tsc)
    }

    fn rdmsr(msr: u32) -> u64 {
        with(|s| s.msrs.get(&msr).copied().unwrap_or(0))
    }

    unsafe fn wrmsr(msr: u32, value: u64) {
        with(|s| s.msrs.insert(msr, value));
    }

    fn read_xcr0() -> u64 {
        with(|s| s.xcr0)
    }

    unsafe fn write_xcr0(value: u64) {
        with(|s| s.xcr0 = value);
    }

    fn read_dr(index: u8) -> u64 {
        with(|s| s.dr[index as usize])
    }

    unsafe fn write_dr(index: u8, value: u64) {
        with(|s| s.dr[index as usize] = value);
    }

    unsafe fn fpu_save(area: &mut XSaveArea, _mask: u64) {
        with(|s| {
            area.legacy = s.fpu;
            area.legacy.fx_mxcsr_mask = HOST_MXCSR_MASK;
        });
    }

    unsafe fn fpu_restore(area: &XSaveArea, _mask: u64) {
        with(|s| s.fpu = area.legacy);
    }

    unsafe fn clgi() {
        with(|s| s.gif = false);
    }

    unsafe fn stgi() {
        with(|s| s.gif = true);
    }

    unsafe fn vmrun(vmcb: HostPhysAddr, _host_save: HostPhysAddr, gprs: &mut GeneralRegisters) {
        let vmcb = unsafe { &*(vmcb.as_usize() as *const VmcbStruct) };
        let script = with(|s| {
            assert!(!s.gif, "VMRUN with GIF set");
            assert!(s.preempt_depth > 0, "VMRUN with preemption enabled");
            let ctl = &vmcb.control;
            s.entries.push(Entry {
                tlb_control: ctl.tlb_control.get(),
                event_inj: ctl.event_inj.get(),
                clean_bits: ctl.clean_bits.get(),
                tsc_offset: ctl.tsc_offset.get(),
                rax: vmcb.state.rax.get(),
                rip: vmcb.state.rip.get(),
                xcr0: s.xcr0,
                dr: s.dr,
            });
            s.scripts.pop_front()
        });
        let mut script = script.expect("unexpected VMRUN");
        script(vmcb, gprs);
    }
}

/// Nested paging backed by nothing; faults are recorded.
#[derive(Debug)]
pub struct MockMemory {
    pub root: HostPhysAddr,
    /// Whether `resolve_fault` succeeds.
    pub resolve: Cell<bool>,
    pub faults: RefCell<Vec<(GuestPhysAddr, MemoryAccess)>>,
}

pub const NESTED_ROOT: usize = 0x1234_5000;

impl MockMemory {
    pub fn new() -> Self {
        Self {
            root: HostPhysAddr::from(NESTED_ROOT),
            resolve: Cell::new(false),
            faults: RefCell::new(Vec::new()),
        }
    }
}

impl NestedPagingContext for MockMemory {
    fn nested_root(&self) -> HostPhysAddr {
        self.root
    }

    fn resolve_fault(&self, gpa: GuestPhysAddr, access: MemoryAccess) -> bool {
        self.faults.borrow_mut().push((gpa, access));
        self.resolve.get()
    }
}

pub type TestMachine = SvmMachine<MockHal, MockMemory>;
pub type TestVcpu = SvmVcpu<MockHal, MockMemory>;

pub fn platform() -> Arc<SvmPlatform> {
    Arc::new(SvmPlatform::new::<MockHal>(SvmConfig::default()).unwrap())
}

/// Resets the mock CPU and creates an empty machine on it.
pub fn machine() -> Arc<TestMachine> {
    reset();
    Arc::new(SvmMachine::new(platform(), MockMemory::new()))
}

/// A fresh machine with vCPU 0.
pub fn vcpu() -> (Arc<TestMachine>, TestVcpu) {
    let machine = machine();
    let vcpu = SvmVcpu::new(machine.clone(), 0).unwrap();
    (machine, vcpu)
}
