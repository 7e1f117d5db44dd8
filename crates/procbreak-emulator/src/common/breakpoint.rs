use indexmap::IndexMap;
use procbreak_watcher::debugger::{BreakpointId, BreakpointRequest};

/// Breakpoints placed within the debuggee.
#[derive(Default)]
pub struct BreakpointManager {
    bks: IndexMap<BreakpointId, BreakpointRequest>,
    next_id: u64,
}

impl BreakpointManager {
    /// Creates a manager without any breakpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a breakpoint, returning its newly allocated ID.
    pub fn add_breakpoint(&mut self, request: BreakpointRequest) -> BreakpointId {
        let id = BreakpointId(self.next_id);
        self.next_id += 1;

        self.bks.insert(id, request);

        id
    }

    /// Removes a breakpoint.
    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> crate::Result<BreakpointRequest> {
        self.bks
            .shift_remove(&id)
            .ok_or(crate::Error::UnknownBreakpoint(id))
    }

    /// Returns the given breakpoint.
    pub fn get_breakpoint(&self, id: BreakpointId) -> Option<&BreakpointRequest> {
        self.bks.get(&id)
    }

    /// Iterates over the breakpoints, in creation order.
    pub fn breakpoints(&self) -> impl Iterator<Item = (BreakpointId, &BreakpointRequest)> {
        self.bks.iter().map(|(id, request)| (*id, request))
    }

    /// Returns the breakpoints triggered by the given thread executing
    /// `addr`, in creation order.
    ///
    /// Breakpoints scoped to another process or thread are not triggered.
    pub fn triggered_by(&self, addr: u64, process_id: u64, thread_id: u64) -> Vec<BreakpointId> {
        self.bks
            .iter()
            .filter(|(_, bk)| {
                bk.addr == addr
                    && bk.process.is_none_or(|pid| pid == process_id)
                    && bk.thread.is_none_or(|tid| tid == thread_id)
            })
            .map(|(id, _)| *id)
            .collect()
    }
}
