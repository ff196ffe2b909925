//! Stable exit codes for duet CLI commands.

/// Command succeeded; for `tick`, the loop progressed or is waiting.
pub const OK: i32 = 0;
/// Invalid layout, config, or corrupt state, or any other fatal error.
pub const INVALID: i32 = 1;
/// A completion record failed validation.
pub const REJECTED: i32 = 2;
/// The loop is on hold until `duet correct` releases it.
pub const HELD: i32 = 3;
