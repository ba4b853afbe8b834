// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::fmt::{Debug, Formatter, Result};

use super::GeneralRegisters;

/// Encodings of the registers held in [`GeneralRegisters`]; RSP lives in the
/// VMCB.
const GPR_INDEXES: [u8; 15] = [0, 1, 2, 3, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

/// The GPRs an exit handler changed, for tracing in-kernel emulation.
pub struct GeneralRegistersDiff {
    before: GeneralRegisters,
    after: GeneralRegisters,
}

impl GeneralRegistersDiff {
    pub fn new(before: GeneralRegisters, after: GeneralRegisters) -> Self {
        Self { before, after }
    }

    pub fn is_same(&self) -> bool {
        self.changes().next().is_none()
    }

    /// `(index, before, after)` of every register that changed.
    pub fn changes(&self) -> impl Iterator<Item = (u8, u64, u64)> + '_ {
        GPR_INDEXES.iter().filter_map(|&i| {
            let (before, after) = (self.before.get_reg_of_index(i), self.after.get_reg_of_index(i));
            (before != after).then_some((i, before, after))
        })
    }
}

struct Change(u64, u64);

impl Debug for Change {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(f, "{:#x} -> {:#x}", self.0, self.1)
    }
}

impl Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut Formatter) -> Result {
        f.debug_map()
            .entries(
                self.changes()
                    .map(|(i, before, after)| (GeneralRegisters::register_name(i), Change(before, after))),
            )
            .finish()
    }
}
