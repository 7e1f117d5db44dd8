//! This crate allows to break on the initial thread of processes created on a
//! Windows target under kernel debugging.
//!
//! Two main components are provided:
//! - A [watcher](self::watcher::ProcessCreationWatcher), intercepting calls to
//!   `nt!NtCreateUserProcess` and chaining one-shot breakpoints until the new
//!   process's initial thread reaches its start address.
//! - A few traits to implement a custom debugger backend, responsible for
//!   placing breakpoints and inspecting the debuggee when they are hit.
//!
//! # Watching process creations
//!
//! This is the main use case of this crate.
//!
//! ```no_run
//! use procbreak_emulator::KernelScenario;
//!
//! use procbreak_watcher::filter::{WatchFilter, WatchOptions};
//! use procbreak_watcher::watcher::{WatchStop, WatchTask};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut scenario = KernelScenario::new();
//!     scenario.create_user_process("C:\\Windows\\System32\\cmd.exe", "cmd.exe /c echo hi")
//!         .unwrap();
//!
//!     let mut task = WatchTask::new(scenario.into_session());
//!
//!     // break on the initial thread of new `cmd.exe` processes
//!     task.arm(WatchFilter::new("cmd.exe"), WatchOptions::default())
//!         .unwrap();
//!
//!     while let WatchStop::InitialThread { thread, .. } = task.wait_stop().await.unwrap() {
//!         //
//!         // inspect the new process while it is halted
//!         //
//!
//!         task.resume(thread).unwrap();
//!     }
//! }
//! ```
//!
//! # Implementing a custom debugger backend
//!
//! The [DebugBackend](self::debugger::DebugBackend) trait allows to plug the
//! watcher onto any kernel debugger (e.g., `dbgeng`, a VM introspection
//! library). The watcher only relies on breakpoints, register and memory
//! reads, typed structure layouts and handle table lookups.
//!
//! The default backend provided by `procbreak-emulator` emulates a kernel
//! target, which is mostly useful for testing.

/// Module containing traits for implementing a custom debugger backend.
pub mod debugger;

mod error;

/// Module containing the process creation filter.
pub mod filter;

/// Module describing the target kernel's calling convention and structures.
pub mod nt;

/// Module implementing the process creation watcher.
pub mod watcher;

pub use self::error::{DebuggerError, Error, LayoutMismatch, Result};
