//! Side-effecting operations: filesystem, process execution, state files.
//! Isolated behind traits where orchestration needs mocking in tests.

pub mod artifacts;
pub mod chunks;
pub mod config;
pub mod control;
pub mod conversation;
pub mod dispatch;
pub mod init;
pub mod process;
pub mod prompt;
pub mod questions;
pub mod state;
pub mod store;
pub mod verify;
pub mod worker;
