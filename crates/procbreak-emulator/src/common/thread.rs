use std::collections::HashMap;

use procbreak_watcher::debugger::{Registers, Thread};

/// Register state of an emulated x64 thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmulatedRegisters {
    /// Instruction pointer.
    pub rip: u64,

    /// Stack pointer.
    pub rsp: u64,

    /// Return value.
    pub rax: u64,

    /// First integer argument.
    pub rcx: u64,

    /// Second integer argument.
    pub rdx: u64,

    /// Third integer argument.
    pub r8: u64,

    /// Fourth integer argument.
    pub r9: u64,
}

impl Registers for EmulatedRegisters {
    fn instr_addr(&self) -> u64 {
        self.rip
    }

    fn stack_ptr(&self) -> u64 {
        self.rsp
    }

    fn int_arg(&self, index: usize) -> Option<u64> {
        match index {
            0 => Some(self.rcx),
            1 => Some(self.rdx),
            2 => Some(self.r8),
            3 => Some(self.r9),
            _ => None,
        }
    }
}

pub struct ThreadManager {
    threads: HashMap<u64, ThreadState>,

    /// Thread reported by the last debug event, until it is resumed.
    stopped: Option<u64>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
            stopped: None,
        }
    }

    pub fn register_thread_create(&mut self, thread_id: u64, process_id: u64) {
        self.threads.insert(
            thread_id,
            ThreadState {
                process_id,
                regs: EmulatedRegisters::default(),
                backtrace: Vec::new(),
            },
        );
    }

    /// Updates the context of a thread about to execute `regs.rip`.
    ///
    /// On success, returns the ID of the thread's process.
    pub fn register_thread_exec(
        &mut self,
        thread_id: u64,
        regs: EmulatedRegisters,
        backtrace: Vec<u64>,
    ) -> crate::Result<u64> {
        let state = self
            .threads
            .get_mut(&thread_id)
            .ok_or(crate::Error::UntrackedThread(thread_id))?;

        state.regs = regs;
        state.backtrace = backtrace;

        Ok(state.process_id)
    }

    pub fn register_thread_stop(&mut self, thread_id: u64) -> crate::Result<StoppedThread> {
        let state = self
            .threads
            .get(&thread_id)
            .ok_or(crate::Error::UntrackedThread(thread_id))?;

        self.stopped = Some(thread_id);

        Ok(StoppedThread {
            id: thread_id,
            process_id: state.process_id,
            instr_addr: state.regs.rip,
        })
    }

    pub fn register_thread_resume(&mut self, thread_id: u64) -> crate::Result<()> {
        if self.stopped != Some(thread_id) {
            return Err(crate::Error::ThreadNotStopped(thread_id));
        }

        self.stopped = None;

        Ok(())
    }

    pub const fn stopped_thread(&self) -> Option<u64> {
        self.stopped
    }

    pub fn registers(&self, thread_id: u64) -> crate::Result<EmulatedRegisters> {
        self.threads
            .get(&thread_id)
            .map(|state| state.regs)
            .ok_or(crate::Error::UntrackedThread(thread_id))
    }

    pub fn backtrace(&self, thread_id: u64) -> crate::Result<&[u64]> {
        self.threads
            .get(&thread_id)
            .map(|state| state.backtrace.as_slice())
            .ok_or(crate::Error::UntrackedThread(thread_id))
    }
}

struct ThreadState {
    /// Process owning the thread.
    process_id: u64,

    /// Registers at the last scripted execution.
    regs: EmulatedRegisters,

    /// Return addresses at the last scripted execution, innermost first.
    backtrace: Vec<u64>,
}

/// Stopped thread of the debuggee.
#[derive(Debug)]
pub struct StoppedThread {
    /// Address of the thread object.
    id: u64,

    /// Address of the process object.
    process_id: u64,

    /// Thread's instruction address.
    instr_addr: u64,
}

impl Thread for StoppedThread {
    fn id(&self) -> u64 {
        self.id
    }

    fn process_id(&self) -> u64 {
        self.process_id
    }

    fn instr_addr(&self) -> u64 {
        self.instr_addr
    }
}
