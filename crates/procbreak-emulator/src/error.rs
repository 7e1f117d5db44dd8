use procbreak_watcher::debugger::BreakpointId;

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Memory access outside of any mapped region.
    #[error("memory at {addr:#x} ({len} bytes) is not mapped")]
    UnmappedMemory {
        /// Start address of the access.
        addr: u64,

        /// Length of the access.
        len: usize,
    },

    /// Mapped regions cannot overlap.
    #[error("memory at {0:#x} is already mapped")]
    AlreadyMapped(u64),

    /// The thread was never added to the session.
    #[error("untracked thread {0:#x}")]
    UntrackedThread(u64),

    /// The breakpoint doesn't exist (anymore).
    #[error("unknown breakpoint {0}")]
    UnknownBreakpoint(BreakpointId),

    /// A stopped thread must be resumed before waiting for the next event.
    #[error("thread {0:#x} was not resumed")]
    ThreadNotResumed(u64),

    /// Only a stopped thread can be resumed.
    #[error("thread {0:#x} is not stopped")]
    ThreadNotStopped(u64),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, Error>;
