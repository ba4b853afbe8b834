//! Address Space Identifier allocation.
//!
//! Every vCPU gets its own ASID so that its guest TLB entries survive a
//! #VMEXIT. When the table runs dry, the last tag is handed out to every
//! further vCPU; those share it and have to flush on each entry.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

/// Upper bound on the number of ASIDs the allocator tracks.
pub const MAX_ASIDS: u32 = 8192;

/// An ASID handed out by [`AsidAllocator::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Asid {
    pub tag: u32,
    /// The tag is the overflow tag, used by more than one vCPU.
    pub shared: bool,
}

/// Bitmap of used ASIDs.
#[derive(Debug)]
pub struct AsidAllocator {
    size: u32,
    map: Mutex<Vec<u8>>,
}

impl AsidAllocator {
    /// Creates an allocator for a processor supporting `hw_count` ASIDs.
    ///
    /// ASID 0 belongs to the host and the last one is the overflow tag;
    /// neither is ever returned as a unique tag.
    pub fn new(hw_count: u32) -> Self {
        let size = hw_count.clamp(3, MAX_ASIDS);
        let mut map = vec![0u8; size.div_ceil(8) as usize];
        for tag in [0, size - 1] {
            map[(tag / 8) as usize] |= 1 << (tag % 8);
        }
        Self {
            size,
            map: Mutex::new(map),
        }
    }

    /// Number of tags in the table, reserved ones included.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The tag shared by vCPUs created after the table ran out.
    pub fn overflow_tag(&self) -> u32 {
        self.size - 1
    }

    pub fn acquire(&self) -> Asid {
        let mut map = self.map.lock();
        for tag in 1..self.overflow_tag() {
            let (oct, bit) = ((tag / 8) as usize, tag % 8);
            if map[oct] & (1 << bit) == 0 {
                map[oct] |= 1 << bit;
                debug!("[SVM] acquired ASID {}", tag);
                return Asid { tag, shared: false };
            }
        }
        debug!("[SVM] ASIDs exhausted, sharing ASID {}", self.overflow_tag());
        Asid {
            tag: self.overflow_tag(),
            shared: true,
        }
    }

    pub fn release(&self, asid: Asid) {
        if asid.shared || asid.tag == 0 || asid.tag >= self.overflow_tag() {
            return;
        }
        let (oct, bit) = ((asid.tag / 8) as usize, asid.tag % 8);
        self.map.lock()[oct] &= !(1 << bit);
        debug!("[SVM] released ASID {}", asid.tag);
    }
}
