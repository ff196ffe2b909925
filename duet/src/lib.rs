//! Deterministic file-based control loop for an implementer/reviewer pair.
//!
//! Each step of work moves through propose, review, execute, and verify. The
//! workers are opaque external processes; every routing decision is made
//! here, from persisted state and a closed transition table. The crate keeps
//! a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (transition table, flag checks,
//!   step successors). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (state store, lock, process
//!   supervision, escalation sinks). Behind traits where tests need fakes.
//!
//! Orchestration modules ([`tick`], [`correct`], [`status`], [`validate`],
//! [`watch`]) coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod correct;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tick;
pub mod validate;
pub mod watch;
