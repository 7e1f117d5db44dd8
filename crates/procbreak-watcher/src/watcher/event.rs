/// Process creation intercepted at the entry of `NtCreateUserProcess`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessCreationEvent {
    /// Return address of the intercepted call.
    pub return_addr: u64,

    /// Address of the `_RTL_USER_PROCESS_PARAMETERS` structure.
    pub process_parameters_addr: u64,

    /// Path of the executable image.
    pub image_path_name: String,

    /// Full command line of the process to create.
    pub command_line: String,

    /// Executable file name, extracted from the image path.
    pub file_name: String,
}

/// Process and initial thread created by a successful `NtCreateUserProcess`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessCreationResult {
    /// Handle of the new process (masked), in the creator's handle table.
    pub process_handle: u64,

    /// Handle of the initial thread (masked), in the creator's handle table.
    pub thread_handle: u64,

    /// Address of the new process object.
    pub process_object_addr: u64,

    /// Address of the initial thread object.
    pub thread_object_addr: u64,

    /// Start address of the initial thread.
    pub thread_start_addr: u64,
}
