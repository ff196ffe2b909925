//! Filesystem and process side effects for duet commands.

pub mod atomic;
pub mod config;
pub mod escalation;
pub mod flag;
pub mod history;
pub mod init;
pub mod layout;
pub mod ledger;
pub mod lock;
pub mod mandate;
pub mod process;
pub mod prompt;
pub mod state_store;
pub mod supervisor;
