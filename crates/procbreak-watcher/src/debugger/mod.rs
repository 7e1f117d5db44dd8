mod layout;
mod thread;

use std::fmt;
use std::future::Future;

pub use self::layout::{FieldKind, FieldLayout, TypeLayout, TypedObject};
pub use self::thread::Thread;

/// Trait implementing the instrumentation logic of a kernel debugger.
///
/// Every function is called while the debuggee is halted, except for
/// [wait_event](Self::wait_event) which returns once it halts again.
pub trait DebugBackend {
    /// Type of the register state of a stopped thread.
    type Registers: Registers;

    /// Type of a debuggee's stopped thread.
    type StoppedThread: Thread;

    /// Error returned by this trait.
    type Error: std::error::Error;

    /// Returns the next debug event.
    fn wait_event(&mut self) -> impl Future<Output = Result<DebugEvent<Self>, Self::Error>>;

    /// Returns the address of the given symbol from the given module.
    fn resolve_symbol(&self, module: &str, symbol: &str) -> Result<Option<u64>, Self::Error>;

    /// Returns the layout of the given structure type from the given module.
    fn type_layout(&self, module: &str, type_name: &str)
    -> Result<Option<TypeLayout>, Self::Error>;

    /// Reads data from the debuggee's address space.
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Retrieves registers of the given stopped thread.
    fn get_registers(
        &mut self,
        thread: &Self::StoppedThread,
    ) -> Result<Self::Registers, Self::Error>;

    /// Computes the return addresses of the stack frames of the given stopped
    /// thread, innermost first.
    ///
    /// At most `depth` return addresses are returned.
    fn compute_backtrace(
        &mut self,
        thread: &Self::StoppedThread,
        depth: usize,
    ) -> Result<Vec<u64>, Self::Error>;

    /// Looks up the given handle in the handle table of the process owning
    /// the stopped thread.
    ///
    /// On success, returns the address of the underlying kernel object, or
    /// `None` if the handle table has no (or a freed) entry for it.
    fn resolve_handle(
        &self,
        thread: &Self::StoppedThread,
        handle: u64,
    ) -> Result<Option<u64>, Self::Error>;

    /// Adds a breakpoint described by `request`.
    ///
    /// # Note
    ///
    /// If the breakpoint is scoped to a process or a thread and is triggered
    /// outside of that scope, the implementor makes sure that it is silently
    /// resumed (e.g., not reported by a call to `wait_event`).
    ///
    /// A one-shot breakpoint is removed by the implementor right before it
    /// is reported.
    fn add_breakpoint(&mut self, request: BreakpointRequest) -> Result<BreakpointId, Self::Error>;

    /// Removes a breakpoint previously added.
    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Self::Error>;

    /// Resumes the thread's execution.
    fn resume(&mut self, thread: Self::StoppedThread) -> Result<(), Self::Error>;

    /// Writes a line to the debugger's output, visible by the operator.
    fn write_line(&mut self, line: fmt::Arguments<'_>);
}

/// Trait for implementing the register state of a stopped thread.
pub trait Registers {
    /// Returns the instruction address.
    fn instr_addr(&self) -> u64;

    /// Returns the stack pointer.
    fn stack_ptr(&self) -> u64;

    /// Returns the value of the register carrying the integer argument at
    /// the given index, if the calling convention passes it in a register.
    fn int_arg(&self, index: usize) -> Option<u64>;
}

/// Identifier of a breakpoint, allocated by the debugger backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u64);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Description of a breakpoint to add.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointRequest {
    /// Address of the breakpoint.
    pub addr: u64,

    /// Whether the breakpoint is removed once triggered.
    pub one_shot: bool,

    /// Process scope (address of the process object), if any.
    pub process: Option<u64>,

    /// Thread scope (address of the thread object), if any.
    pub thread: Option<u64>,
}

impl BreakpointRequest {
    /// Creates a persistent breakpoint request at the given address, without
    /// any scope.
    pub const fn at(addr: u64) -> Self {
        Self {
            addr,
            one_shot: false,
            process: None,
            thread: None,
        }
    }

    /// Makes the breakpoint one-shot.
    pub const fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Restricts the breakpoint to the given process and thread.
    pub const fn scoped(mut self, process: u64, thread: u64) -> Self {
        self.process = Some(process);
        self.thread = Some(thread);
        self
    }
}

/// Event describing some action taking place within the debuggee.
pub enum DebugEvent<S: DebugBackend + ?Sized> {
    /// A thread has stopped by triggering a breakpoint.
    Breakpoint {
        /// The triggered breakpoint.
        id: BreakpointId,

        /// The stopped thread.
        thread: S::StoppedThread,
    },

    /// The debugging session has ended (e.g., target detached).
    SessionEnded,
}
