use std::collections::{HashMap, VecDeque};
use std::fmt;

use procbreak_watcher::debugger::{BreakpointId, BreakpointRequest, DebugBackend, DebugEvent};
use procbreak_watcher::debugger::{Thread, TypeLayout};

use super::breakpoint::BreakpointManager;
use super::memory::Memory;
use super::thread::{EmulatedRegisters, StoppedThread, ThreadManager};

/// Scripted step performed by the emulated target while it runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// A thread reaches `regs.rip`.
    Execute {
        /// Address of the thread object.
        thread: u64,

        /// Register state of the thread.
        regs: EmulatedRegisters,

        /// Return addresses of the thread's stack frames, innermost first.
        backtrace: Vec<u64>,
    },

    /// Some code writes memory.
    WriteMemory {
        /// Destination address.
        addr: u64,

        /// Written bytes.
        data: Vec<u8>,
    },

    /// A handle is inserted in the handle table of a process.
    InsertHandle {
        /// Address of the process object.
        process: u64,

        /// Handle table index.
        handle: u64,

        /// Address of the referenced object.
        object: u64,
    },

    /// A handle is closed in the handle table of a process.
    CloseHandle {
        /// Address of the process object.
        process: u64,

        /// Handle table index.
        handle: u64,
    },

    /// A thread is created.
    CreateThread {
        /// Address of the new thread object.
        thread: u64,

        /// Address of the owning process object.
        process: u64,
    },
}

/// Emulated kernel debugging session.
pub struct Session {
    /// Flat address space of the target.
    memory: Memory,

    /// Symbols, by module and name.
    symbols: HashMap<(String, String), u64>,

    /// Structure layouts, by module and name.
    layouts: HashMap<(String, String), TypeLayout>,

    /// Handle tables, by process object.
    handle_tables: HashMap<u64, HashMap<u64, u64>>,

    /// Breakpoint manager.
    breakpoint_manager: BreakpointManager,

    /// Thread manager.
    thread_manager: ThreadManager,

    /// Steps left to run.
    steps: VecDeque<Step>,

    /// Breakpoints triggered by the last execution, not reported yet.
    triggered: VecDeque<(BreakpointId, u64)>,

    /// Lines written to the debugger's output.
    output: Vec<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self {
            memory: Memory::new(),
            symbols: HashMap::new(),
            layouts: HashMap::new(),
            handle_tables: HashMap::new(),
            breakpoint_manager: BreakpointManager::new(),
            thread_manager: ThreadManager::new(),
            steps: VecDeque::new(),
            triggered: VecDeque::new(),
            output: Vec::new(),
        }
    }

    /// Address space of the target.
    pub const fn memory(&self) -> &Memory {
        &self.memory
    }

    /// Address space of the target.
    pub const fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    /// Breakpoints currently placed.
    pub const fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoint_manager
    }

    /// Lines written to the debugger's output so far.
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Takes the lines written to the debugger's output so far.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    /// Adds a symbol.
    pub fn add_symbol(&mut self, module: impl Into<String>, name: impl Into<String>, addr: u64) {
        self.symbols.insert((module.into(), name.into()), addr);
    }

    /// Adds (or replaces) a structure layout.
    pub fn add_type_layout(&mut self, module: impl Into<String>, layout: TypeLayout) {
        self.layouts
            .insert((module.into(), layout.name().to_owned()), layout);
    }

    /// Removes a structure layout.
    pub fn remove_type_layout(&mut self, module: &str, name: &str) -> Option<TypeLayout> {
        self.layouts.remove(&(module.to_owned(), name.to_owned()))
    }

    /// Adds a thread owned by the given process.
    pub fn add_thread(&mut self, thread: u64, process: u64) {
        self.thread_manager.register_thread_create(thread, process);
    }

    /// Inserts a handle in the handle table of a process.
    pub fn insert_handle(&mut self, process: u64, handle: u64, object: u64) {
        self.handle_tables
            .entry(process)
            .or_default()
            .insert(handle, object);
    }

    /// Closes a handle in the handle table of a process.
    ///
    /// Returns the address of the object it referenced, if any.
    pub fn close_handle(&mut self, process: u64, handle: u64) -> Option<u64> {
        self.handle_tables
            .get_mut(&process)
            .and_then(|table| table.remove(&handle))
    }

    /// Schedules a step, after all the already scheduled ones.
    pub fn push_step(&mut self, step: Step) {
        self.steps.push_back(step);
    }

    /// Number of steps left to run.
    pub fn remaining_steps(&self) -> usize {
        self.steps.len()
    }

    /// Runs a single step.
    fn run_step(&mut self, step: Step) -> crate::Result<()> {
        match step {
            Step::Execute {
                thread,
                regs,
                backtrace,
            } => {
                let process = self
                    .thread_manager
                    .register_thread_exec(thread, regs, backtrace)?;

                let triggered = self
                    .breakpoint_manager
                    .triggered_by(regs.rip, process, thread);

                self.triggered
                    .extend(triggered.into_iter().map(|id| (id, thread)));
            }
            Step::WriteMemory { addr, data } => self.memory.write(addr, &data)?,
            Step::InsertHandle {
                process,
                handle,
                object,
            } => self.insert_handle(process, handle, object),
            Step::CloseHandle { process, handle } => {
                self.close_handle(process, handle);
            }
            Step::CreateThread { thread, process } => self.add_thread(thread, process),
        }

        Ok(())
    }

    /// Reports the next triggered breakpoint which still exists.
    fn next_triggered(&mut self) -> crate::Result<Option<DebugEvent<Self>>> {
        while let Some((id, thread_id)) = self.triggered.pop_front() {
            let Some(bk) = self.breakpoint_manager.get_breakpoint(id) else {
                continue;
            };

            if bk.one_shot {
                self.breakpoint_manager.remove_breakpoint(id)?;
            }

            let thread = self.thread_manager.register_thread_stop(thread_id)?;

            tracing::debug!(
                bp = %id,
                tid = format_args!("{thread_id:#x}"),
                addr = format_args!("{:#x}", thread.instr_addr()),
                "breakpoint hit"
            );

            return Ok(Some(DebugEvent::Breakpoint { id, thread }));
        }

        Ok(None)
    }
}

impl DebugBackend for Session {
    type Registers = EmulatedRegisters;
    type StoppedThread = StoppedThread;
    type Error = crate::Error;

    async fn wait_event(&mut self) -> Result<DebugEvent<Self>, Self::Error> {
        if let Some(thread_id) = self.thread_manager.stopped_thread() {
            return Err(crate::Error::ThreadNotResumed(thread_id));
        }

        loop {
            if let Some(event) = self.next_triggered()? {
                return Ok(event);
            }

            let Some(step) = self.steps.pop_front() else {
                return Ok(DebugEvent::SessionEnded);
            };

            self.run_step(step)?;
        }
    }

    fn resolve_symbol(&self, module: &str, symbol: &str) -> Result<Option<u64>, Self::Error> {
        Ok(self
            .symbols
            .get(&(module.to_owned(), symbol.to_owned()))
            .copied())
    }

    fn type_layout(
        &self,
        module: &str,
        type_name: &str,
    ) -> Result<Option<TypeLayout>, Self::Error> {
        Ok(self
            .layouts
            .get(&(module.to_owned(), type_name.to_owned()))
            .cloned())
    }

    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.memory.read(addr, buf)
    }

    fn get_registers(
        &mut self,
        thread: &Self::StoppedThread,
    ) -> Result<Self::Registers, Self::Error> {
        self.thread_manager.registers(thread.id())
    }

    fn compute_backtrace(
        &mut self,
        thread: &Self::StoppedThread,
        depth: usize,
    ) -> Result<Vec<u64>, Self::Error> {
        let backtrace = self.thread_manager.backtrace(thread.id())?;
        Ok(backtrace.iter().take(depth).copied().collect())
    }

    fn resolve_handle(
        &self,
        thread: &Self::StoppedThread,
        handle: u64,
    ) -> Result<Option<u64>, Self::Error> {
        Ok(self
            .handle_tables
            .get(&thread.process_id())
            .and_then(|table| table.get(&handle))
            .copied())
    }

    fn add_breakpoint(&mut self, request: BreakpointRequest) -> Result<BreakpointId, Self::Error> {
        let addr = request.addr;
        let id = self.breakpoint_manager.add_breakpoint(request);

        tracing::debug!(bp = %id, addr = format_args!("{addr:#x}"), "breakpoint added");

        Ok(id)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), Self::Error> {
        self.breakpoint_manager.remove_breakpoint(id)?;
        Ok(())
    }

    fn resume(&mut self, thread: Self::StoppedThread) -> Result<(), Self::Error> {
        self.thread_manager.register_thread_resume(thread.id())
    }

    fn write_line(&mut self, line: fmt::Arguments<'_>) {
        let line = line.to_string();
        tracing::info!(target: "procbreak::output", "{line}");
        self.output.push(line);
    }
}

#[cfg(test)]
mod tests {
    use procbreak_watcher::debugger::{BreakpointRequest, DebugBackend, DebugEvent, Thread};

    use super::{Session, Step};
    use crate::EmulatedRegisters;

    fn exec(thread: u64, rip: u64) -> Step {
        Step::Execute {
            thread,
            regs: EmulatedRegisters {
                rip,
                ..Default::default()
            },
            backtrace: vec![],
        }
    }

    #[tokio::test]
    async fn one_shot_breakpoint_is_reported_once() {
        let mut session = Session::new();
        session.add_thread(0x10, 0x1);

        let id = session
            .add_breakpoint(BreakpointRequest::at(0x1000).one_shot())
            .unwrap();

        session.push_step(exec(0x10, 0x1000));
        session.push_step(exec(0x10, 0x1000));

        let DebugEvent::Breakpoint { id: hit, thread } = session.wait_event().await.unwrap() else {
            panic!("expected breakpoint");
        };

        assert_eq!(hit, id);
        assert_eq!(thread.id(), 0x10);
        assert_eq!(thread.process_id(), 0x1);
        assert!(session.breakpoints().get_breakpoint(id).is_none());

        session.resume(thread).unwrap();

        assert!(matches!(
            session.wait_event().await.unwrap(),
            DebugEvent::SessionEnded
        ));
    }

    #[tokio::test]
    async fn stopped_thread_must_be_resumed() {
        let mut session = Session::new();
        session.add_thread(0x10, 0x1);
        session
            .add_breakpoint(BreakpointRequest::at(0x1000))
            .unwrap();

        session.push_step(exec(0x10, 0x1000));

        let _event = session.wait_event().await.unwrap();

        assert!(matches!(
            session.wait_event().await,
            Err(crate::Error::ThreadNotResumed(0x10))
        ));
    }

    #[tokio::test]
    async fn out_of_scope_breakpoint_is_silent() {
        let mut session = Session::new();
        session.add_thread(0x10, 0x1);
        session.add_thread(0x20, 0x2);

        let id = session
            .add_breakpoint(BreakpointRequest::at(0x1000).one_shot().scoped(0x2, 0x20))
            .unwrap();

        session.push_step(exec(0x10, 0x1000));
        session.push_step(exec(0x20, 0x1000));

        let DebugEvent::Breakpoint { id: hit, thread } = session.wait_event().await.unwrap() else {
            panic!("expected breakpoint");
        };

        assert_eq!(hit, id);
        assert_eq!(thread.id(), 0x20);
    }
}
