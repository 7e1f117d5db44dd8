use byteorder::{ByteOrder, LittleEndian};
use procbreak_watcher::debugger::{FieldKind, TypeLayout};
use procbreak_watcher::nt;

use crate::{EmulatedRegisters, Session, Step};

/// Address of `nt!NtCreateUserProcess`.
pub const NT_CREATE_USER_PROCESS_ADDR: u64 = 0xffff_f801_2a4c_5d10;

/// Return address into `nt!KiSystemServiceCopyEnd`.
const KI_SYSTEM_SERVICE_COPY_END_RET: u64 = 0xffff_f801_2a61_a0f5;

/// Return address into `ntdll!NtCreateUserProcess`, after `syscall`.
const NTDLL_SYSCALL_STUB_RET: u64 = 0x7ffc_1e2a_d8f4;

/// Return address into `KERNELBASE!CreateProcessInternalW`.
const KERNELBASE_CREATE_PROCESS_RET: u64 = 0x7ffc_1bc3_f1e2;

/// Return address into `KERNEL32!CreateProcessW`.
const KERNEL32_CREATE_PROCESS_RET: u64 = 0x7ffc_1d81_2a07;

/// Address of `ntdll!RtlUserThreadStart`.
const RTL_USER_THREAD_START: u64 = 0x7ffc_1e28_c6f0;

/// Base address of the user-mode allocations of the creator.
const USER_ALLOC_BASE: u64 = 0x0000_00e5_a1f0_0000;

/// Base address of the kernel objects.
const KERNEL_ALLOC_BASE: u64 = 0xffff_c80f_3a20_0000;

/// Bits set on handles returned to the creator, on top of the table index.
const HANDLE_TAG: u64 = 0xffff_ffff_8000_0000;

/// First handle table index allocated to new handles.
const FIRST_HANDLE: u64 = 0x1f8;

const EPROCESS_SIZE: u64 = 0xa40;
const ETHREAD_SIZE: u64 = 0x898;
const ETHREAD_CREATE_TIME: u64 = 0x430;
const ETHREAD_START_ADDRESS: u64 = 0x450;
const ETHREAD_WIN32_START_ADDRESS: u64 = 0x4d0;
const PROCESS_PARAMETERS_SIZE: u64 = 0x440;
const PROCESS_PARAMETERS_IMAGE_PATH_NAME: u64 = 0x60;
const PROCESS_PARAMETERS_COMMAND_LINE: u64 = 0x70;
const STACK_SIZE: u64 = 0x200;

/// Parameters of a process creation to emulate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessCreation {
    /// Path of the executable image (`ImagePathName`).
    pub image_path: String,

    /// Full command line (`CommandLine`).
    pub command_line: String,

    /// Whether the creator closes both handles right after the call returns,
    /// before the user-mode code runs again.
    pub close_handles_early: bool,

    /// Thread of the creator process making the call, if not the initial
    /// one.
    pub creator_thread: Option<u64>,
}

impl ProcessCreation {
    /// Creates a process creation with the given image and command line.
    pub fn new(image_path: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            command_line: command_line.into(),
            close_handles_early: false,
            creator_thread: None,
        }
    }

    /// Makes the creator close the handles before they can be resolved.
    pub const fn close_handles_early(mut self) -> Self {
        self.close_handles_early = true;
        self
    }

    /// Makes the given creator thread perform the call.
    pub const fn by_thread(mut self, thread: u64) -> Self {
        self.creator_thread = Some(thread);
        self
    }
}

/// Objects left behind by an emulated process creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedProcess {
    /// Address of the process object.
    pub process_object: u64,

    /// Address of the initial thread object.
    pub thread_object: u64,

    /// Handle table index of the process handle, in the creator.
    pub process_handle: u64,

    /// Handle table index of the thread handle, in the creator.
    pub thread_handle: u64,

    /// Start address of the initial thread.
    pub start_addr: u64,

    /// Stack pointer of the creator at the entry of `NtCreateUserProcess`.
    pub stack_ptr: u64,

    /// Address of the `_RTL_USER_PROCESS_PARAMETERS` structure.
    pub process_parameters_addr: u64,
}

/// Process creation laid out in memory, whose steps are left to schedule.
#[derive(Clone, Debug)]
pub struct PreparedCreation {
    /// Objects left behind by the creation.
    pub created: CreatedProcess,

    /// The creator enters `NtCreateUserProcess`.
    pub entry: Step,

    /// The kernel creates the process and writes the handles, then the
    /// creator returns from the user-mode syscall stub.
    pub completion: Vec<Step>,

    /// The initial thread reaches its start address.
    pub thread_start: Step,
}

impl PreparedCreation {
    /// Steps of the creation, in execution order.
    pub fn into_steps(self) -> impl Iterator<Item = Step> {
        std::iter::once(self.entry)
            .chain(self.completion)
            .chain(std::iter::once(self.thread_start))
    }
}

/// Builder of an emulated session where a creator process calls
/// `nt!NtCreateUserProcess`.
pub struct KernelScenario {
    session: Session,

    /// Process object of the creator.
    creator_process: u64,

    /// Thread object of the creator.
    creator_thread: u64,

    next_user_addr: u64,
    next_kernel_addr: u64,
    next_handle: u64,
}

impl Default for KernelScenario {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelScenario {
    /// Creates a session with the `nt` symbols and structure layouts, and a
    /// creator process with a single thread.
    pub fn new() -> Self {
        let mut session = Session::new();

        session.add_symbol(
            nt::NT_MODULE,
            nt::NT_CREATE_USER_PROCESS,
            NT_CREATE_USER_PROCESS_ADDR,
        );

        for layout in Self::type_layouts() {
            session.add_type_layout(nt::NT_MODULE, layout);
        }

        let mut scenario = Self {
            session,
            creator_process: 0,
            creator_thread: 0,
            next_user_addr: USER_ALLOC_BASE,
            next_kernel_addr: KERNEL_ALLOC_BASE,
            next_handle: FIRST_HANDLE,
        };

        scenario.creator_process = scenario.alloc_kernel(EPROCESS_SIZE);
        scenario.creator_thread = scenario.alloc_kernel(ETHREAD_SIZE);

        scenario
            .session
            .add_thread(scenario.creator_thread, scenario.creator_process);

        scenario
    }

    /// Layouts of the `nt` structures known by the emulated target.
    pub fn type_layouts() -> [TypeLayout; 2] {
        [
            TypeLayout::new(nt::RTL_USER_PROCESS_PARAMETERS, PROCESS_PARAMETERS_SIZE)
                .with_field("MaximumLength", 0x0, FieldKind::U32)
                .with_field("Length", 0x4, FieldKind::U32)
                .with_field("Flags", 0x8, FieldKind::U32)
                .with_field(
                    "ImagePathName",
                    PROCESS_PARAMETERS_IMAGE_PATH_NAME,
                    FieldKind::UnicodeString,
                )
                .with_field(
                    "CommandLine",
                    PROCESS_PARAMETERS_COMMAND_LINE,
                    FieldKind::UnicodeString,
                ),
            TypeLayout::new(nt::ETHREAD, ETHREAD_SIZE)
                .with_field("CreateTime", ETHREAD_CREATE_TIME, FieldKind::U64)
                .with_field("StartAddress", ETHREAD_START_ADDRESS, FieldKind::Pointer)
                .with_field(
                    "Win32StartAddress",
                    ETHREAD_WIN32_START_ADDRESS,
                    FieldKind::Pointer,
                ),
        ]
    }

    /// Process object of the creator.
    pub const fn creator_process(&self) -> u64 {
        self.creator_process
    }

    /// Thread object of the creator.
    pub const fn creator_thread(&self) -> u64 {
        self.creator_thread
    }

    /// Emulated session.
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Emulated session.
    pub const fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Returns the emulated session, ready to run the scheduled steps.
    pub fn into_session(self) -> Session {
        self.session
    }

    /// Schedules a call to `NtCreateUserProcess` by the creator.
    pub fn create_user_process(
        &mut self,
        image_path: impl Into<String>,
        command_line: impl Into<String>,
    ) -> crate::Result<CreatedProcess> {
        self.create_user_process_with(ProcessCreation::new(image_path, command_line))
    }

    /// Schedules a call to `NtCreateUserProcess` by the creator, with the
    /// given parameters.
    ///
    /// Three executions are scheduled:
    /// 1. the creator enters `NtCreateUserProcess`,
    /// 2. the creator returns from the user-mode syscall stub, once the
    ///    handles are written,
    /// 3. the initial thread of the new process reaches its start address.
    pub fn create_user_process_with(
        &mut self,
        creation: ProcessCreation,
    ) -> crate::Result<CreatedProcess> {
        let prepared = self.prepare_user_process(creation)?;
        let created = prepared.created.clone();

        for step in prepared.into_steps() {
            self.session.push_step(step);
        }

        Ok(created)
    }

    /// Lays out a call to `NtCreateUserProcess` in memory, without
    /// scheduling anything.
    ///
    /// The returned steps can be scheduled in any order relative to other
    /// calls (e.g., two creator threads interleaving their calls).
    pub fn prepare_user_process(
        &mut self,
        creation: ProcessCreation,
    ) -> crate::Result<PreparedCreation> {
        let creator_process = self.creator_process;
        let creator_thread = creation.creator_thread.unwrap_or(self.creator_thread);

        let process_object = self.alloc_kernel(EPROCESS_SIZE);
        let thread_object = self.alloc_kernel(ETHREAD_SIZE);

        let image_entry = 0x7ff6_0000_0000 + (process_object & 0xffff_f000);

        let memory = self.session.memory_mut();
        memory.map(process_object, EPROCESS_SIZE as usize)?;
        memory.map(thread_object, ETHREAD_SIZE as usize)?;
        memory.write_u64(thread_object + ETHREAD_START_ADDRESS, RTL_USER_THREAD_START)?;
        memory.write_u64(thread_object + ETHREAD_WIN32_START_ADDRESS, image_entry)?;

        // creator's view of the call
        let process_parameters_addr = self.alloc_user(PROCESS_PARAMETERS_SIZE)?;
        self.write_unicode_string(
            process_parameters_addr + PROCESS_PARAMETERS_IMAGE_PATH_NAME,
            &creation.image_path,
        )?;
        self.write_unicode_string(
            process_parameters_addr + PROCESS_PARAMETERS_COMMAND_LINE,
            &creation.command_line,
        )?;

        let handle_slots = self.alloc_user(16)?;
        let process_handle_ptr = handle_slots;
        let thread_handle_ptr = handle_slots + 8;

        let stack_ptr = self.alloc_user(STACK_SIZE)?;

        let mut stack = [0u64; nt::NT_CREATE_USER_PROCESS_ARG_COUNT + 1];
        stack[0] = KI_SYSTEM_SERVICE_COPY_END_RET;
        stack[nt::PROCESS_HANDLE_ARG_INDEX + 1] = process_handle_ptr;
        stack[nt::THREAD_HANDLE_ARG_INDEX + 1] = thread_handle_ptr;
        stack[nt::PROCESS_PARAMETERS_ARG_INDEX + 1] = process_parameters_addr;

        let mut raw = vec![0u8; stack.len() * 8];
        LittleEndian::write_u64_into(&stack, &mut raw);
        self.session.memory_mut().write(stack_ptr, &raw)?;

        let process_handle = self.alloc_handle();
        let thread_handle = self.alloc_handle();

        let entry = Step::Execute {
            thread: creator_thread,
            regs: EmulatedRegisters {
                rip: NT_CREATE_USER_PROCESS_ADDR,
                rsp: stack_ptr,
                rcx: process_handle_ptr,
                rdx: thread_handle_ptr,
                r8: 0x1f_ffff,
                r9: 0x1f_ffff,
                ..Default::default()
            },
            backtrace: vec![
                KI_SYSTEM_SERVICE_COPY_END_RET,
                NTDLL_SYSCALL_STUB_RET,
                KERNELBASE_CREATE_PROCESS_RET,
                KERNEL32_CREATE_PROCESS_RET,
            ],
        };

        let mut completion = vec![Step::CreateThread {
            thread: thread_object,
            process: process_object,
        }];

        for (handle, object, ptr) in [
            (process_handle, process_object, process_handle_ptr),
            (thread_handle, thread_object, thread_handle_ptr),
        ] {
            completion.push(Step::InsertHandle {
                process: creator_process,
                handle,
                object,
            });

            completion.push(Step::WriteMemory {
                addr: ptr,
                data: (HANDLE_TAG | handle).to_le_bytes().to_vec(),
            });
        }

        if creation.close_handles_early {
            for handle in [process_handle, thread_handle] {
                completion.push(Step::CloseHandle {
                    process: creator_process,
                    handle,
                });
            }
        }

        completion.push(Step::Execute {
            thread: creator_thread,
            regs: EmulatedRegisters {
                rip: KERNELBASE_CREATE_PROCESS_RET,
                rsp: stack_ptr + 8 * 0x10,
                ..Default::default()
            },
            backtrace: vec![KERNEL32_CREATE_PROCESS_RET],
        });

        let thread_start = Step::Execute {
            thread: thread_object,
            regs: EmulatedRegisters {
                rip: RTL_USER_THREAD_START,
                rcx: image_entry,
                ..Default::default()
            },
            backtrace: vec![],
        };

        tracing::debug!(
            image_path = %creation.image_path,
            creator = format_args!("{creator_thread:#x}"),
            process = format_args!("{process_object:#x}"),
            thread = format_args!("{thread_object:#x}"),
            "prepared process creation"
        );

        Ok(PreparedCreation {
            created: CreatedProcess {
                process_object,
                thread_object,
                process_handle,
                thread_handle,
                start_addr: RTL_USER_THREAD_START,
                stack_ptr,
                process_parameters_addr,
            },
            entry,
            completion,
            thread_start,
        })
    }

    /// Adds a thread to the creator process, which can then make its own
    /// calls (see [ProcessCreation::by_thread]).
    ///
    /// Returns the address of the thread object.
    pub fn add_creator_thread(&mut self) -> u64 {
        let thread = self.alloc_kernel(ETHREAD_SIZE);
        self.session.add_thread(thread, self.creator_process);
        thread
    }

    /// Writes a `UNICODE_STRING` at `addr`.
    ///
    /// An empty text has no buffer.
    fn write_unicode_string(&mut self, addr: u64, text: &str) -> crate::Result<()> {
        if text.is_empty() {
            return self.session.memory_mut().write(addr, &[0u8; 16]);
        }

        let utf16 = text.encode_utf16().chain([0]).collect::<Vec<_>>();

        let mut raw = vec![0u8; utf16.len() * 2];
        LittleEndian::write_u16_into(&utf16, &mut raw);

        let buffer = self.alloc_user(raw.len() as u64)?;
        self.session.memory_mut().write(buffer, &raw)?;

        let len = (raw.len() - 2) as u16;

        let mut header = [0u8; 16];
        LittleEndian::write_u16(&mut header[..2], len);
        LittleEndian::write_u16(&mut header[2..4], len + 2);
        LittleEndian::write_u64(&mut header[8..], buffer);

        self.session.memory_mut().write(addr, &header)
    }

    /// Reserves the address of a kernel object, without mapping it.
    fn alloc_kernel(&mut self, size: u64) -> u64 {
        let addr = self.next_kernel_addr;
        self.next_kernel_addr = (addr + size + 0xf) & !0xf;
        addr
    }

    fn alloc_user(&mut self, size: u64) -> crate::Result<u64> {
        let addr = self.next_user_addr;
        self.next_user_addr = (addr + size + 0xf) & !0xf;

        self.session.memory_mut().map(addr, size as usize)?;

        Ok(addr)
    }

    fn alloc_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 4;
        handle
    }
}
