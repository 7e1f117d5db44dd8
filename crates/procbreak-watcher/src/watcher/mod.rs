mod event;
mod task;

use std::collections::HashMap;

pub use self::event::{ProcessCreationEvent, ProcessCreationResult};
pub use self::task::{WatchId, WatchStop, WatchTask};
use crate::debugger::{BreakpointId, BreakpointRequest, DebugBackend, FieldKind};
use crate::debugger::{Registers, Thread, TypeLayout, TypedObject};
use crate::error::{DebuggerError, LayoutMismatch};
use crate::filter::{WatchFilter, WatchOptions, file_name_from_image_path};
use crate::nt;

/// State of a watch.
///
/// ```text
/// Idle -> ArmedEntry -> [match] ArmedReturn -> [return] ArmedThreadStart -> [hit] ArmedEntry
///            ^    |
///            +----+ [no match]
/// ```
///
/// As the entry breakpoint stays armed, several process creations may be in
/// flight at once. The state then reports the most advanced one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchState {
    /// No breakpoint is armed.
    Idle,

    /// Waiting for `NtCreateUserProcess` to be called.
    ArmedEntry,

    /// Waiting for a matching `NtCreateUserProcess` call to return.
    ArmedReturn,

    /// Waiting for the initial thread of a matching process to start.
    ArmedThreadStart,
}

/// Action bound to a one-shot breakpoint armed by the watcher.
enum Continuation {
    ProcessCreationCompleted {
        process_handle_ptr: u64,
        thread_handle_ptr: u64,
    },
    InitialThreadStarted(ProcessCreationResult),
}

/// What to do once a breakpoint owned by a watcher was handled.
pub(crate) enum StageOutcome {
    Resume,
    InitialThread(ProcessCreationResult),
}

/// Watcher of process creations.
///
/// It chains three breakpoints:
/// 1. on the entry of `NtCreateUserProcess` (persistent), where new
///    processes are filtered,
/// 2. on the user-mode return of a matching call (one-shot), where the new
///    process and thread objects are resolved,
/// 3. on the start address of the new initial thread (one-shot).
pub struct ProcessCreationWatcher {
    filter: WatchFilter,
    options: WatchOptions,

    /// Validated layout of `_RTL_USER_PROCESS_PARAMETERS`.
    process_parameters_layout: TypeLayout,

    /// Validated layout of `_ETHREAD`.
    ethread_layout: TypeLayout,

    /// Breakpoint on `NtCreateUserProcess`.
    entry: Option<BreakpointId>,

    /// One-shot breakpoints armed for matching process creations.
    pending: HashMap<BreakpointId, Continuation>,
}

impl ProcessCreationWatcher {
    /// Arms a watch on new processes matching `filter`.
    ///
    /// The layouts of the kernel structures read by the watcher are checked
    /// beforehand, so that a mismatch is reported now rather than on every
    /// process creation.
    #[tracing::instrument(name = "Arm", skip_all, fields(name = %filter.process_name))]
    pub fn arm<S: DebugBackend>(
        session: &mut S,
        filter: WatchFilter,
        options: WatchOptions,
    ) -> crate::Result<Self, S::Error> {
        let entry_addr = session
            .resolve_symbol(nt::NT_MODULE, nt::NT_CREATE_USER_PROCESS)
            .map_err(DebuggerError)?
            .ok_or_else(|| {
                crate::Error::SymbolNotFound(
                    nt::NT_MODULE.to_owned(),
                    nt::NT_CREATE_USER_PROCESS.to_owned(),
                )
            })?;

        tracing::info!(addr = format_args!("{entry_addr:#x}"), "resolved");

        let process_parameters_layout = load_layout(
            session,
            nt::RTL_USER_PROCESS_PARAMETERS,
            nt::RTL_USER_PROCESS_PARAMETERS_FIELDS,
        )?;

        let ethread_layout = load_layout(session, nt::ETHREAD, nt::ETHREAD_FIELDS)?;

        let entry = session
            .add_breakpoint(BreakpointRequest::at(entry_addr))
            .map_err(DebuggerError)?;

        session.write_line(format_args!(
            "[+] Breaking in new '{}' processes",
            filter.process_name
        ));

        Ok(Self {
            filter,
            options,
            process_parameters_layout,
            ethread_layout,
            entry: Some(entry),
            pending: HashMap::new(),
        })
    }

    /// Removes every breakpoint armed by this watch.
    pub fn disarm<S: DebugBackend>(&mut self, session: &mut S) -> crate::Result<(), S::Error> {
        if let Some(id) = self.entry.take() {
            session.remove_breakpoint(id).map_err(DebuggerError)?;
        }

        for (id, _) in self.pending.drain() {
            session.remove_breakpoint(id).map_err(DebuggerError)?;
        }

        Ok(())
    }

    /// Filter of this watch.
    pub const fn filter(&self) -> &WatchFilter {
        &self.filter
    }

    /// Options of this watch.
    pub const fn options(&self) -> &WatchOptions {
        &self.options
    }

    /// Current state of this watch.
    pub fn state(&self) -> WatchState {
        if self.entry.is_none() {
            WatchState::Idle
        } else if self
            .pending
            .values()
            .any(|cont| matches!(cont, Continuation::InitialThreadStarted(_)))
        {
            WatchState::ArmedThreadStart
        } else if !self.pending.is_empty() {
            WatchState::ArmedReturn
        } else {
            WatchState::ArmedEntry
        }
    }

    /// Breakpoint placed on `NtCreateUserProcess`, unless disarmed.
    pub const fn entry_breakpoint(&self) -> Option<BreakpointId> {
        self.entry
    }

    /// One-shot breakpoints currently armed for matching process creations.
    pub fn pending_breakpoints(&self) -> impl Iterator<Item = BreakpointId> + '_ {
        self.pending.keys().copied()
    }

    /// Returns whether the given breakpoint was armed by this watch.
    pub fn owns(&self, id: BreakpointId) -> bool {
        self.entry == Some(id) || self.pending.contains_key(&id)
    }

    /// Handles a hit of a breakpoint owned by this watch.
    ///
    /// The bound continuation is consumed before it runs, so that an error
    /// drops the event.
    pub(crate) fn on_breakpoint<S: DebugBackend>(
        &mut self,
        session: &mut S,
        id: BreakpointId,
        thread: &S::StoppedThread,
    ) -> crate::Result<StageOutcome, S::Error> {
        if self.entry == Some(id) {
            // a match is handled by the chained breakpoint, never by halting here
            self.on_process_creation_attempt(session, thread)?;
            return Ok(StageOutcome::Resume);
        }

        match self.pending.remove(&id) {
            Some(Continuation::ProcessCreationCompleted {
                process_handle_ptr,
                thread_handle_ptr,
            }) => {
                self.on_process_creation_completed(
                    session,
                    thread,
                    process_handle_ptr,
                    thread_handle_ptr,
                )?;

                Ok(StageOutcome::Resume)
            }
            Some(Continuation::InitialThreadStarted(result)) => Ok(StageOutcome::InitialThread(
                self.on_initial_thread_started::<S>(thread, result),
            )),
            None => Ok(StageOutcome::Resume),
        }
    }

    /// Handles a thread stopped at the entry of `NtCreateUserProcess`.
    ///
    /// If the process to create matches the filter, a one-shot breakpoint is
    /// armed on the user-mode return of the call.
    ///
    /// Returns whether the debuggee should stay halted, which is never the
    /// case.
    #[tracing::instrument(name = "ProcessCreationAttempt", skip_all, fields(tid = thread.id()))]
    pub fn on_process_creation_attempt<S: DebugBackend>(
        &mut self,
        session: &mut S,
        thread: &S::StoppedThread,
    ) -> crate::Result<bool, S::Error> {
        let regs = session.get_registers(thread).map_err(DebuggerError)?;
        let event = self.read_creation_event(session, &regs)?;

        if !self.filter.matches_file_name(&event.file_name) {
            if self.options.log_skipped {
                session.write_line(format_args!("[+] New process: {}", event.file_name));
            }

            tracing::debug!(file_name = %event.file_name, "skipped");
            return Ok(false);
        }

        if !self.filter.matches_command_line(&event.command_line) {
            tracing::debug!(command_line = %event.command_line, "skipped");
            return Ok(false);
        }

        session.write_line(format_args!("[!] New process: {}", event.file_name));

        tracing::info!(
            file_name = %event.file_name,
            command_line = %event.command_line,
            "matched"
        );

        let process_handle_ptr = regs
            .int_arg(nt::PROCESS_HANDLE_ARG_INDEX)
            .ok_or(crate::Error::MissingArgument(nt::PROCESS_HANDLE_ARG_INDEX))?;

        let thread_handle_ptr = regs
            .int_arg(nt::THREAD_HANDLE_ARG_INDEX)
            .ok_or(crate::Error::MissingArgument(nt::THREAD_HANDLE_ARG_INDEX))?;

        let syscall_ret_addr = session
            .compute_backtrace(thread, nt::SYSCALL_RETURN_FRAME + 1)
            .map_err(DebuggerError)?
            .get(nt::SYSCALL_RETURN_FRAME)
            .copied()
            .ok_or(crate::Error::NoReturnAddress(nt::SYSCALL_RETURN_FRAME))?;

        let id = session
            .add_breakpoint(
                BreakpointRequest::at(syscall_ret_addr)
                    .one_shot()
                    .scoped(thread.process_id(), thread.id()),
            )
            .map_err(DebuggerError)?;

        tracing::info!(
            bp = %id,
            addr = format_args!("{syscall_ret_addr:#x}"),
            "armed on syscall return"
        );

        self.pending.insert(
            id,
            Continuation::ProcessCreationCompleted {
                process_handle_ptr,
                thread_handle_ptr,
            },
        );

        Ok(false)
    }

    /// Handles a thread stopped right after a matching `NtCreateUserProcess`
    /// call returned.
    ///
    /// The new process and thread are resolved from the handles written by
    /// the call, and a one-shot breakpoint is armed on the start address of
    /// the thread.
    ///
    /// # Note
    ///
    /// The handles may already be closed (e.g., short-lived process), in
    /// which case [StaleHandle](crate::Error::StaleHandle) is returned.
    #[tracing::instrument(name = "ProcessCreationCompleted", skip_all, fields(tid = thread.id()))]
    pub fn on_process_creation_completed<S: DebugBackend>(
        &mut self,
        session: &mut S,
        thread: &S::StoppedThread,
        process_handle_ptr: u64,
        thread_handle_ptr: u64,
    ) -> crate::Result<ProcessCreationResult, S::Error> {
        let process_handle = nt::mask_handle(nt::read_pointer(session, process_handle_ptr)?);
        let thread_handle = nt::mask_handle(nt::read_pointer(session, thread_handle_ptr)?);

        let process_object_addr = session
            .resolve_handle(thread, process_handle)
            .map_err(DebuggerError)?
            .ok_or(crate::Error::StaleHandle(process_handle))?;

        let thread_object_addr = session
            .resolve_handle(thread, thread_handle)
            .map_err(DebuggerError)?
            .ok_or(crate::Error::StaleHandle(thread_handle))?;

        session.write_line(format_args!(
            "[!] New process / thread: {process_handle:#x} ({process_object_addr:#x}) / {thread_handle:#x} ({thread_object_addr:#x})"
        ));

        let thread_start_addr = TypedObject::new(thread_object_addr, &self.ethread_layout)
            .read_pointer(session, "StartAddress")?;

        let id = session
            .add_breakpoint(
                BreakpointRequest::at(thread_start_addr)
                    .one_shot()
                    .scoped(process_object_addr, thread_object_addr),
            )
            .map_err(DebuggerError)?;

        tracing::info!(
            bp = %id,
            addr = format_args!("{thread_start_addr:#x}"),
            "armed on thread start"
        );

        let result = ProcessCreationResult {
            process_handle,
            thread_handle,
            process_object_addr,
            thread_object_addr,
            thread_start_addr,
        };

        self.pending
            .insert(id, Continuation::InitialThreadStarted(result.clone()));

        Ok(result)
    }

    /// Handles the initial thread of a matching process stopped at its start
    /// address.
    ///
    /// The one-shot breakpoint is gone by now, so the watch is back to
    /// waiting for the next process creation. The thread is meant to stay
    /// halted for the operator.
    #[tracing::instrument(name = "InitialThreadStarted", skip_all, fields(tid = thread.id()))]
    pub fn on_initial_thread_started<S: DebugBackend>(
        &self,
        thread: &S::StoppedThread,
        result: ProcessCreationResult,
    ) -> ProcessCreationResult {
        tracing::info!(
            process = format_args!("{:#x}", result.process_object_addr),
            addr = format_args!("{:#x}", thread.instr_addr()),
            "initial thread started"
        );

        result
    }

    /// Reads the process creation request of a thread stopped at the entry
    /// of `NtCreateUserProcess`.
    pub fn read_creation_event<S: DebugBackend>(
        &self,
        session: &S,
        regs: &S::Registers,
    ) -> crate::Result<ProcessCreationEvent, S::Error> {
        let slots = nt::read_stack_args(session, regs.stack_ptr())?;
        let process_parameters_addr = nt::stack_arg(&slots, nt::PROCESS_PARAMETERS_ARG_INDEX);

        let params = TypedObject::new(process_parameters_addr, &self.process_parameters_layout);
        let image_path_name = params.read_unicode_string(session, "ImagePathName")?;
        let command_line = params.read_unicode_string(session, "CommandLine")?;

        let file_name = file_name_from_image_path(&image_path_name).to_owned();

        Ok(ProcessCreationEvent {
            return_addr: slots[0],
            process_parameters_addr,
            image_path_name,
            command_line,
            file_name,
        })
    }
}

fn load_layout<S: DebugBackend>(
    session: &S,
    type_name: &str,
    fields: &[(&str, FieldKind)],
) -> crate::Result<TypeLayout, S::Error> {
    let layout = session
        .type_layout(nt::NT_MODULE, type_name)
        .map_err(DebuggerError)?
        .ok_or_else(|| crate::Error::type_layout(type_name, LayoutMismatch::UnknownType))?;

    layout
        .check_fields(fields)
        .map_err(|reason| crate::Error::type_layout(type_name, reason))?;

    tracing::debug!(ty = type_name, size = layout.size(), "layout checked");

    Ok(layout)
}
