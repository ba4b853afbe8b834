//! Unit tests for the svm_vcpu crate.
//!
//! The engine runs on [`mock::MockHal`], a software processor that scripts
//! every #VMEXIT.

mod general_registers;
mod mock;
mod platform;
