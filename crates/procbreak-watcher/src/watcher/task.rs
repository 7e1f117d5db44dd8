use std::fmt;

use indexmap::IndexMap;

use super::{ProcessCreationResult, ProcessCreationWatcher, StageOutcome};
use crate::debugger::{DebugBackend, DebugEvent, Thread};
use crate::error::DebuggerError;
use crate::filter::{WatchFilter, WatchOptions};

/// Identifier of a watch armed on a [WatchTask].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Reason why [WatchTask::wait_stop] returned.
pub enum WatchStop<S: DebugBackend> {
    /// The initial thread of a watched process reached its start address.
    ///
    /// The thread stays halted until it is [resumed](WatchTask::resume).
    InitialThread {
        /// Watch which armed the breakpoint.
        watch: WatchId,

        /// The halted initial thread.
        thread: S::StoppedThread,

        /// The created process and thread.
        result: ProcessCreationResult,
    },

    /// The debugging session has ended.
    Ended,
}

/// Watching task, dispatching breakpoint hits to the watches armed on a
/// debugging session.
pub struct WatchTask<S> {
    /// Debugging session over the target.
    session: S,

    /// Armed watches.
    watches: IndexMap<WatchId, ProcessCreationWatcher>,

    next_watch_id: u64,
}

impl<S: DebugBackend> WatchTask<S> {
    /// Creates a task without any watch.
    pub fn new(session: S) -> Self {
        Self {
            session,
            watches: IndexMap::new(),
            next_watch_id: 0,
        }
    }

    /// Arms a new watch on process creations.
    ///
    /// Watches are independent of each other: a process matching several
    /// watches makes each of them stop on its initial thread.
    pub fn arm(
        &mut self,
        filter: WatchFilter,
        options: WatchOptions,
    ) -> crate::Result<WatchId, S::Error> {
        let watcher = ProcessCreationWatcher::arm(&mut self.session, filter, options)?;

        let id = WatchId(self.next_watch_id);
        self.next_watch_id += 1;

        self.watches.insert(id, watcher);

        tracing::info!(watch = %id, "armed");

        Ok(id)
    }

    /// Disarms and forgets the given watch.
    ///
    /// Returns `false` if there was no such watch.
    pub fn disarm(&mut self, id: WatchId) -> crate::Result<bool, S::Error> {
        let Some(mut watcher) = self.watches.shift_remove(&id) else {
            return Ok(false);
        };

        watcher.disarm(&mut self.session)?;

        tracing::info!(watch = %id, "disarmed");

        Ok(true)
    }

    /// Returns the given watch.
    pub fn watch(&self, id: WatchId) -> Option<&ProcessCreationWatcher> {
        self.watches.get(&id)
    }

    /// Iterates over the armed watches.
    pub fn watches(&self) -> impl Iterator<Item = (WatchId, &ProcessCreationWatcher)> {
        self.watches.iter().map(|(id, watcher)| (*id, watcher))
    }

    /// Debugging session over the target.
    pub const fn session(&self) -> &S {
        &self.session
    }

    /// Debugging session over the target.
    pub const fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Consumes the task, returning the debugging session.
    ///
    /// # Note
    ///
    /// The breakpoints armed by the watches are left in place.
    pub fn into_session(self) -> S {
        self.session
    }

    /// Resumes a thread previously returned by [wait_stop](Self::wait_stop).
    pub fn resume(&mut self, thread: S::StoppedThread) -> crate::Result<(), S::Error> {
        self.session.resume(thread).map_err(DebuggerError)?;
        Ok(())
    }

    /// Lets the target run until the initial thread of a watched process
    /// starts, or until the session ends.
    ///
    /// Any other breakpoint hit is handled and resumed here. Errors occurring
    /// while handling a hit only drop the corresponding process creation:
    /// they are reported to the debugger's output, and the target is resumed.
    #[tracing::instrument(name = "Watch", skip_all, fields(watches = self.watches.len()))]
    pub async fn wait_stop(&mut self) -> crate::Result<WatchStop<S>, S::Error> {
        loop {
            let (id, thread) = match self.session.wait_event().await.map_err(DebuggerError)? {
                DebugEvent::Breakpoint { id, thread } => (id, thread),
                DebugEvent::SessionEnded => {
                    tracing::info!("session has ended");
                    break Ok(WatchStop::Ended);
                }
            };

            let Some((&watch_id, watcher)) =
                self.watches.iter_mut().find(|(_, watcher)| watcher.owns(id))
            else {
                tracing::debug!(bp = %id, tid = thread.id(), "foreign breakpoint");
                self.session.resume(thread).map_err(DebuggerError)?;
                continue;
            };

            match watcher.on_breakpoint(&mut self.session, id, &thread) {
                Ok(StageOutcome::Resume) => (),
                Ok(StageOutcome::InitialThread(result)) => {
                    break Ok(WatchStop::InitialThread {
                        watch: watch_id,
                        thread,
                        result,
                    });
                }
                Err(e) => {
                    tracing::warn!(watch = %watch_id, bp = %id, error = %e, "dropped event");

                    self.session
                        .write_line(format_args!("[-] Dropped process creation event: {e}"));
                }
            }

            self.session.resume(thread).map_err(DebuggerError)?;
        }
    }
}
