use axerrno::{AxResult, ax_err};
use tock_registers::LocalRegisterCopy;

use crate::svm::vmcb::EventInj;

/// Exception vectors.
pub mod vector {
    pub const DE: u8 = 0;
    pub const DB: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BP: u8 = 3;
    pub const OF: u8 = 4;
    pub const UD: u8 = 6;
    pub const DF: u8 = 8;
    pub const TS: u8 = 10;
    pub const NP: u8 = 11;
    pub const SS: u8 = 12;
    pub const GP: u8 = 13;
    pub const PF: u8 = 14;
    pub const AC: u8 = 17;
    pub const MC: u8 = 18;
    pub const CP: u8 = 21;
    pub const SX: u8 = 30;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Exception,
    /// An external interrupt; vector 2 is delivered as an NMI.
    Interrupt,
}

/// An event to deliver on the next guest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuEvent {
    pub kind: EventKind,
    pub vector: u8,
    /// Pushed only for exceptions that carry an error code.
    pub error_code: u32,
}

impl VcpuEvent {
    pub const fn exception(vector: u8, error_code: u32) -> Self {
        Self {
            kind: EventKind::Exception,
            vector,
            error_code,
        }
    }

    pub const fn interrupt(vector: u8) -> Self {
        Self {
            kind: EventKind::Interrupt,
            vector,
            error_code: 0,
        }
    }

    /// Checks the event and builds its EVENTINJ encoding.
    pub(crate) fn encode(&self) -> AxResult<EncodedEvent> {
        let mut inj = LocalRegisterCopy::<u64, EventInj::Register>::new(0);
        let mut sets_rf = false;
        let mut nmi = false;

        match self.kind {
            EventKind::Exception => {
                if matches!(self.vector, vector::DE | vector::NMI | vector::BP)
                    || self.vector >= 32
                {
                    return ax_err!(InvalidInput, "exception vector cannot be injected");
                }
                sets_rf = exception_sets_rf(self.vector);
                inj.write(EventInj::TYPE::Exception);
                if exception_has_error(self.vector) {
                    inj.modify(EventInj::EV::SET + EventInj::ERROR_CODE.val(self.error_code as u64));
                }
            }
            EventKind::Interrupt if self.vector == vector::NMI => {
                nmi = true;
                inj.write(EventInj::TYPE::Nmi);
            }
            EventKind::Interrupt => inj.write(EventInj::TYPE::External),
        }
        inj.modify(EventInj::VECTOR.val(self.vector as u64) + EventInj::VALID::SET);

        Ok(EncodedEvent {
            eventinj: inj.get(),
            sets_rf,
            nmi,
        })
    }
}

/// A validated event, ready for EVENTINJ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EncodedEvent {
    pub eventinj: u64,
    /// RFLAGS.RF must be set when the event is delivered.
    pub sets_rf: bool,
    /// The event is an NMI, so the NMI window has to be watched.
    pub nmi: bool,
}

/// Faults push an error code for these vectors.
pub fn exception_has_error(vector: u8) -> bool {
    matches!(
        vector,
        vector::DF
            | vector::TS
            | vector::NP
            | vector::SS
            | vector::GP
            | vector::PF
            | vector::AC
            | vector::CP
            | vector::SX
    )
}

/// Traps and aborts leave RFLAGS.RF alone; every other exception sets it.
pub fn exception_sets_rf(vector: u8) -> bool {
    !matches!(vector, vector::DB | vector::OF | vector::DF | vector::MC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    #[test]
    fn reject_reserved_vectors() {
        for v in [0u8, 2, 3, 32, 255] {
            assert_eq!(
                VcpuEvent::exception(v, 0).encode().unwrap_err(),
                AxError::InvalidInput
            );
        }
    }

    #[test]
    fn page_fault_carries_error_code() {
        let ev = VcpuEvent::exception(vector::PF, 0x6).encode().unwrap();
        let inj = LocalRegisterCopy::<u64, EventInj::Register>::new(ev.eventinj);
        assert_eq!(inj.read(EventInj::VECTOR), 14);
        assert_eq!(inj.read(EventInj::TYPE), 3);
        assert!(inj.is_set(EventInj::EV));
        assert!(inj.is_set(EventInj::VALID));
        assert_eq!(inj.read(EventInj::ERROR_CODE), 0x6);
        assert!(ev.sets_rf);
        assert!(!ev.nmi);
    }

    #[test]
    fn undefined_opcode_has_no_error_code() {
        let ev = VcpuEvent::exception(vector::UD, 0xdead).encode().unwrap();
        let inj = LocalRegisterCopy::<u64, EventInj::Register>::new(ev.eventinj);
        assert!(!inj.is_set(EventInj::EV));
        assert_eq!(inj.read(EventInj::ERROR_CODE), 0);
    }

    #[test]
    fn interrupt_vector_two_is_nmi() {
        let ev = VcpuEvent::interrupt(2).encode().unwrap();
        let inj = LocalRegisterCopy::<u64, EventInj::Register>::new(ev.eventinj);
        assert_eq!(inj.read(EventInj::TYPE), 2);
        assert!(ev.nmi);

        let ev = VcpuEvent::interrupt(0x20).encode().unwrap();
        let inj = LocalRegisterCopy::<u64, EventInj::Register>::new(ev.eventinj);
        assert_eq!(inj.read(EventInj::TYPE), 0);
        assert_eq!(inj.read(EventInj::VECTOR), 0x20);
        assert!(!ev.nmi && !ev.sets_rf);
    }

    #[test]
    fn rf_exceptions() {
        assert!(!exception_sets_rf(vector::DB));
        assert!(!exception_sets_rf(vector::MC));
        assert!(exception_sets_rf(vector::GP));
        assert!(exception_sets_rf(vector::UD));
    }
}
