//! The watcher depends on the x64 Windows calling convention: when a routine
//! is entered, `[rsp]` holds the return address and the argument at index
//! `i` is spilled (or homed) at `rsp + (i + 1) * 8`. The first four integer
//! arguments are also passed in `rcx`, `rdx`, `r8` and `r9`.
//!
//! If the signature of `NtCreateUserProcess` changes, the constants below
//! must be updated accordingly.

use byteorder::{ByteOrder, LittleEndian};

use crate::debugger::{DebugBackend, FieldKind};
use crate::error::DebuggerError;

/// Module exporting the kernel routines and structures.
pub const NT_MODULE: &str = "nt";

/// Kernel routine creating user-mode processes.
pub const NT_CREATE_USER_PROCESS: &str = "NtCreateUserProcess";

/// Number of declared parameters of `NtCreateUserProcess`.
pub const NT_CREATE_USER_PROCESS_ARG_COUNT: usize = 11;

/// Index of the `ProcessHandle` (`PHANDLE`) parameter.
pub const PROCESS_HANDLE_ARG_INDEX: usize = 0;

/// Index of the `ThreadHandle` (`PHANDLE`) parameter.
pub const THREAD_HANDLE_ARG_INDEX: usize = 1;

/// Index of the `ProcessParameters` (`PRTL_USER_PROCESS_PARAMETERS`)
/// parameter.
pub const PROCESS_PARAMETERS_ARG_INDEX: usize = 8;

/// Stack frame of the user-mode syscall stub (`ntdll!NtCreateUserProcess`),
/// below `KiSystemServiceCopyEnd`. Its return address is reached once the
/// call has returned to user mode and the handles are written.
pub const SYSCALL_RETURN_FRAME: usize = 2;

/// Size of a pointer on the target.
pub const POINTER_WIDTH: usize = 8;

/// Mask applied to handle values to obtain a handle table index.
///
/// Kernel handles have their high bit set, which must be discarded.
pub const HANDLE_INDEX_MASK: u64 = 0xFFFF;

/// Structure pointed to by the `ProcessParameters` parameter.
pub const RTL_USER_PROCESS_PARAMETERS: &str = "_RTL_USER_PROCESS_PARAMETERS";

/// Fields of [RTL_USER_PROCESS_PARAMETERS] read by the watcher.
pub const RTL_USER_PROCESS_PARAMETERS_FIELDS: &[(&str, FieldKind)] = &[
    ("ImagePathName", FieldKind::UnicodeString),
    ("CommandLine", FieldKind::UnicodeString),
];

/// Executive thread object.
pub const ETHREAD: &str = "_ETHREAD";

/// Fields of [ETHREAD] read by the watcher.
pub const ETHREAD_FIELDS: &[(&str, FieldKind)] = &[("StartAddress", FieldKind::Pointer)];

/// Masks a raw handle value into a handle table index.
pub const fn mask_handle(handle: u64) -> u64 {
    handle & HANDLE_INDEX_MASK
}

/// Reads the return address slot followed by the arguments of
/// `NtCreateUserProcess`, from the stack of a thread stopped at its entry.
pub fn read_stack_args<S: DebugBackend>(
    session: &S,
    stack_ptr: u64,
) -> crate::Result<[u64; NT_CREATE_USER_PROCESS_ARG_COUNT + 1], S::Error> {
    let mut raw = [0u8; (NT_CREATE_USER_PROCESS_ARG_COUNT + 1) * POINTER_WIDTH];
    session
        .read_memory(stack_ptr, &mut raw)
        .map_err(DebuggerError)?;

    let mut slots = [0u64; NT_CREATE_USER_PROCESS_ARG_COUNT + 1];
    LittleEndian::read_u64_into(&raw, &mut slots);

    Ok(slots)
}

/// Returns the argument at the given index from the stack slots returned by
/// [read_stack_args].
pub const fn stack_arg(slots: &[u64; NT_CREATE_USER_PROCESS_ARG_COUNT + 1], index: usize) -> u64 {
    // first slot is the return address
    slots[index + 1]
}

/// Reads a pointer-sized value from the debuggee's address space.
pub fn read_pointer<S: DebugBackend>(session: &S, addr: u64) -> crate::Result<u64, S::Error> {
    let mut buf = [0u8; POINTER_WIDTH];
    session.read_memory(addr, &mut buf).map_err(DebuggerError)?;

    Ok(LittleEndian::read_u64(&buf))
}

#[cfg(test)]
mod tests {
    use super::{HANDLE_INDEX_MASK, mask_handle};

    #[test]
    fn mask_handle_keeps_table_index() {
        assert_eq!(mask_handle(0xffff_ffff_8000_0a4c), 0x0a4c);
        assert_eq!(mask_handle(0x1f8), 0x1f8);
        assert_eq!(mask_handle(0), 0);
        assert_eq!(mask_handle(u64::MAX), HANDLE_INDEX_MASK);
    }

    #[test]
    fn mask_handle_is_idempotent() {
        for handle in [
            0u64,
            0x4,
            0xfffe,
            0x1_0000,
            0x8000_0000_0000_1234,
            0xdead_beef_cafe_f00d,
            u64::MAX,
        ] {
            let masked = mask_handle(handle);
            assert!(masked <= 0xffff);
            assert_eq!(mask_handle(masked), masked);
        }
    }
}
