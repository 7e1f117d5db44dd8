//! This crate provides a default implementation of a debugger backend (to be
//! used with `procbreak-watcher`).
//!
//! The backend emulates a Windows kernel debugging session: a flat address
//! space, kernel symbols and structure layouts, per-process handle tables,
//! and threads executing a scripted sequence of steps. Breakpoints are
//! reported whenever a scripted execution reaches them.
//!
//! <div class="warning">
//!
//! *This crate is not meant to be used on its own! It merely implements the
//! interface (traits) provided by `procbreak-watcher`, so that the watcher
//! can be exercised without a live kernel debugger.*
//!
//! </div>
//!
//! # Scenarios
//!
//! [KernelScenario] lays out everything a call to `nt!NtCreateUserProcess`
//! leaves behind on a real target (caller stack, process parameters, handles,
//! thread objects), and schedules the executions the watcher expects.

mod common;
mod error;
mod scenario;

pub use self::common::breakpoint::BreakpointManager;
pub use self::common::memory::Memory;
pub use self::common::session::{Session, Step};
pub use self::common::thread::{EmulatedRegisters, StoppedThread};
pub use self::error::{Error, Result};
pub use self::scenario::{CreatedProcess, KernelScenario, PreparedCreation, ProcessCreation};
