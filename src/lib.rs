//! A virtual CPU execution engine for AMD-SVM.
//!
//! [`SvmPlatform`] probes the processor once, [`SvmPerCpuState`] turns SVM on
//! for each physical CPU, an [`SvmMachine`] groups the vCPUs sharing one
//! nested address space, and [`SvmVcpu`] runs the guest until it needs the
//! caller, reporting why in an [`SvmVcpuExit`].
//!
//! Everything the engine needs from the host kernel goes through
//! [`SvmVCpuHal`].

#![no_std]

#[macro_use]
extern crate log;

extern crate alloc;

#[cfg(test)]
extern crate std;

mod event;
mod exit;
mod frame;
mod hal;
pub(crate) mod msr;
#[macro_use]
pub(crate) mod regs;
mod state;
mod svm;
mod xstate;

#[cfg(test)]
mod tests;

pub use event::{EventKind, VcpuEvent, exception_has_error, exception_sets_rf, vector};
pub use exit::{ExitState, IoExit, MemoryAccess, MemoryExit, MsrExit, SvmExitReason, SvmVcpuExit};
pub use hal::{HostPhysAddr, HostVirtAddr, SvmVCpuHal};
pub use regs::{GeneralRegisters, GeneralRegistersDiff};
pub use state::{
    CrState, DrState, FpuState, GprState, GuestState, IntrState, MsrState, Segment,
    SegmentAttributes, SegmentState, StateGroups,
};
pub use svm::*;
pub use xstate::{XCR0_SSE, XCR0_X87, XSaveArea};
