//! What `run()` reports back to the caller.

use crate::state::StateGroups;

/// The kind of access that caused a nested page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccess {
    Read,
    Write,
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryExit {
    pub gpa: u64,
    pub access: MemoryAccess,
    /// Number of valid bytes in `inst_bytes`; zero without decode assists.
    pub inst_len: u8,
    pub inst_bytes: [u8; 15],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoExit {
    pub port: u16,
    pub is_in: bool,
    /// Segment of a string operation, only known with decode assists.
    pub seg: Option<u8>,
    /// Address size in bytes.
    pub address_size: u8,
    /// Operand size in bytes.
    pub operand_size: u8,
    pub rep: bool,
    pub str: bool,
    /// RIP of the next instruction.
    pub npc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrExit {
    pub msr: u32,
    /// The value written; zero for reads.
    pub val: u64,
    pub npc: u64,
}

/// Why the guest stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvmExitReason {
    /// Nothing for the caller; the run was interrupted on the host side.
    None,
    Memory(MemoryExit),
    Io(IoExit),
    Rdmsr(MsrExit),
    Wrmsr(MsrExit),
    /// The guest can take an external interrupt now.
    IntReady,
    /// The guest can take an NMI now.
    NmiReady,
    Halted,
    /// Triple fault.
    Shutdown,
    /// CPUID of a leaf configured to exit; the registers hold the
    /// virtualized result.
    Cpuid { npc: u64 },
    Monitor { npc: u64 },
    Mwait { npc: u64 },
    /// An exit the engine does not know how to handle.
    Invalid { hwcode: u64 },
}

/// Guest state worth knowing after every exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    pub rflags: u64,
    pub cr8: u64,
    pub int_shadow: bool,
    pub int_window_exiting: bool,
    pub nmi_window_exiting: bool,
    pub evt_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmVcpuExit {
    pub reason: SvmExitReason,
    pub state: ExitState,
    /// State groups already fetched into the vCPU's state cache.
    pub provided: StateGroups,
}
