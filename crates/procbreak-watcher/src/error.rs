use crate::debugger::FieldKind;

/// Debugger backend error.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct DebuggerError<E>(pub E);

/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum Error<E> {
    /// A debugger backend error occurred.
    #[error(transparent)]
    Debugger(#[from] DebuggerError<E>),

    /// A symbol wasn't found within a module.
    #[error("Symbol {1} not found in {0}")]
    SymbolNotFound(String, String),

    /// The layout of a kernel structure doesn't match what the watcher
    /// expects.
    #[error("Bad layout of {ty}: {reason}")]
    TypeLayout {
        /// Name of the structure.
        ty: String,

        /// What doesn't match.
        reason: LayoutMismatch,
    },

    /// A handle isn't (or is no longer) in the handle table.
    #[error("Handle {0:#x} not found in handle table")]
    StaleHandle(u64),

    /// The stack of a stopped thread has fewer frames than expected.
    #[error("No return address for stack frame #{0}")]
    NoReturnAddress(usize),

    /// An argument register is not available in the register state.
    #[error("Argument #{0} not available in registers")]
    MissingArgument(usize),
}

impl<E> Error<E> {
    pub(crate) fn type_layout(ty: impl Into<String>, reason: LayoutMismatch) -> Self {
        Self::TypeLayout {
            ty: ty.into(),
            reason,
        }
    }
}

/// Mismatch between a structure layout and the expected one.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutMismatch {
    /// The debugger has no type information for the structure.
    #[error("unknown type")]
    UnknownType,

    /// The structure has no such field.
    #[error("missing field {0}")]
    MissingField(String),

    /// The field exists with another kind.
    #[error("field {field} is {found:?} instead of {expected:?}")]
    WrongKind {
        /// Name of the field.
        field: String,

        /// Expected kind.
        expected: FieldKind,

        /// Kind reported by the debugger.
        found: FieldKind,
    },

    /// The field doesn't fit within the structure.
    #[error("field {field} at {offset:#x} overflows {size:#x} bytes")]
    OutOfBounds {
        /// Name of the field.
        field: String,

        /// Offset of the field.
        offset: u64,

        /// Size of the structure.
        size: u64,
    },
}

/// Result type of this crate.
pub type Result<T, E> = core::result::Result<T, Error<E>>;
