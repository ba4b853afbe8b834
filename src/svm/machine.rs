use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::platform::SvmPlatform;
use crate::exit::MemoryAccess;
use crate::hal::{HostPhysAddr, SvmVCpuHal};

/// Guest physical address.
pub type GuestPhysAddr = u64;

/// The host page tables backing a machine's guest physical memory.
pub trait NestedPagingContext {
    /// Physical address of the nested page table root.
    fn nested_root(&self) -> HostPhysAddr;

    /// Attempts to make `gpa` accessible for `access`. Returns `true` when
    /// the guest can simply be re-entered.
    fn resolve_fault(&self, gpa: GuestPhysAddr, access: MemoryAccess) -> bool {
        let _ = (gpa, access);
        false
    }
}

/// State shared by all vCPUs of one virtual machine.
#[derive(Debug)]
pub struct SvmMachine<H: SvmVCpuHal, M: NestedPagingContext> {
    platform: Arc<SvmPlatform>,
    mem: M,
    htlb_gen: AtomicU64,
    ncpus: AtomicUsize,
    _marker: PhantomData<H>,
}

impl<H: SvmVCpuHal, M: NestedPagingContext> SvmMachine<H, M> {
    pub fn new(platform: Arc<SvmPlatform>, mem: M) -> Self {
        Self {
            platform,
            mem,
            // Every vCPU starts with a host TLB flush.
            htlb_gen: AtomicU64::new(1),
            ncpus: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    pub fn platform(&self) -> &Arc<SvmPlatform> {
        &self.platform
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    /// Number of vCPUs currently alive.
    pub fn vcpu_count(&self) -> usize {
        self.ncpus.load(Ordering::Acquire)
    }

    pub fn tlb_generation(&self) -> u64 {
        self.htlb_gen.load(Ordering::Acquire)
    }

    /// Invalidates the cached guest translations of every vCPU after the
    /// nested page tables changed.
    ///
    /// Running vCPUs are kicked out of the guest and flush before their next
    /// entry.
    pub fn flush_guest_tlbs(&self) {
        self.htlb_gen.fetch_add(1, Ordering::AcqRel);
        H::kick_all_cpus();
    }

    pub(crate) fn vcpu_created(&self) {
        self.ncpus.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn vcpu_destroyed(&self) {
        self.ncpus.fetch_sub(1, Ordering::AcqRel);
    }
}
