//! The AMD-SVM engine: platform bring-up, per-CPU enablement, machines and
//! their vCPUs.

mod asid;
mod cpuid;
mod definitions;
mod exits;
pub(crate) mod instructions;
mod machine;
mod percpu;
mod platform;
mod structs;
mod sync;
mod vcpu;
pub mod vmcb;

pub use self::asid::{Asid, AsidAllocator, MAX_ASIDS};
pub use self::cpuid::{CPUID_SLOTS, CpuidConf, CpuidMask, VcpuConfig};
pub use self::definitions::{SvmExitCode, SvmIntercept};
pub use self::machine::{GuestPhysAddr, NestedPagingContext, SvmMachine};
pub use self::percpu::SvmPerCpuState;
pub use self::platform::{SvmCapability, SvmConfig, SvmPlatform, has_hardware_support};
pub use self::vcpu::SvmVcpu;
