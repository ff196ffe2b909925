//! Deterministic, pure logic shared by the control core.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod flag_rules;
pub mod self_check;
pub mod step_id;
pub mod transitions;
pub mod types;
