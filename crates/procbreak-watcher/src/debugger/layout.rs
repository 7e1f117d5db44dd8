use byteorder::{ByteOrder, LittleEndian};
use indexmap::IndexMap;

use super::DebugBackend;
use crate::error::{DebuggerError, LayoutMismatch};

/// Offset of `Buffer` within a 64-bit `UNICODE_STRING`.
const UNICODE_STRING_BUFFER_OFFSET: usize = 8;

/// Kind of a structure field, as far as the watcher is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// 64-bit pointer.
    Pointer,

    /// Counted UTF-16 string (`UNICODE_STRING`).
    UnicodeString,

    /// 32-bit integer.
    U32,

    /// 64-bit integer.
    U64,
}

impl FieldKind {
    /// Size of a field of this kind, in bytes.
    pub const fn size(self) -> u64 {
        match self {
            Self::Pointer | Self::U64 => 8,
            Self::UnicodeString => 16,
            Self::U32 => 4,
        }
    }
}

/// Layout of a structure field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldLayout {
    /// Offset from the start of the structure.
    pub offset: u64,

    /// Kind of the field.
    pub kind: FieldKind,
}

/// Layout of a structure, as described by the debugger's type information.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeLayout {
    name: String,
    size: u64,
    fields: IndexMap<String, FieldLayout>,
}

impl TypeLayout {
    /// Creates a structure layout without any field.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            fields: IndexMap::new(),
        }
    }

    /// Adds a field to the layout.
    pub fn with_field(mut self, name: impl Into<String>, offset: u64, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), FieldLayout { offset, kind });
        self
    }

    /// Name of the structure.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the structure.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the layout of the given field.
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.get(name)
    }

    /// Returns the layout of the given field, making sure it has the
    /// expected kind and lies within the structure.
    pub fn check_field(
        &self,
        name: &str,
        expected: FieldKind,
    ) -> Result<&FieldLayout, LayoutMismatch> {
        let field = self
            .field(name)
            .ok_or_else(|| LayoutMismatch::MissingField(name.to_owned()))?;

        if field.kind != expected {
            return Err(LayoutMismatch::WrongKind {
                field: name.to_owned(),
                expected,
                found: field.kind,
            });
        }

        if field
            .offset
            .checked_add(expected.size())
            .is_none_or(|end| end > self.size)
        {
            return Err(LayoutMismatch::OutOfBounds {
                field: name.to_owned(),
                offset: field.offset,
                size: self.size,
            });
        }

        Ok(field)
    }

    /// Makes sure all the given fields exist with the expected kinds.
    pub fn check_fields(&self, fields: &[(&str, FieldKind)]) -> Result<(), LayoutMismatch> {
        fields
            .iter()
            .try_for_each(|(name, kind)| self.check_field(name, *kind).map(|_| ()))
    }
}

/// Structure instance within the debuggee's address space.
pub struct TypedObject<'a> {
    addr: u64,
    layout: &'a TypeLayout,
}

impl<'a> TypedObject<'a> {
    /// Views the memory at `addr` as a structure with the given layout.
    pub const fn new(addr: u64, layout: &'a TypeLayout) -> Self {
        Self { addr, layout }
    }

    /// Reads a pointer field.
    pub fn read_pointer<S: DebugBackend>(
        &self,
        session: &S,
        field: &str,
    ) -> crate::Result<u64, S::Error> {
        let addr = self.field_addr(field, FieldKind::Pointer)?;

        let mut buf = [0u8; 8];
        session.read_memory(addr, &mut buf).map_err(DebuggerError)?;

        Ok(LittleEndian::read_u64(&buf))
    }

    /// Reads a `UNICODE_STRING` field as text.
    ///
    /// Invalid UTF-16 sequences are replaced.
    pub fn read_unicode_string<S: DebugBackend>(
        &self,
        session: &S,
        field: &str,
    ) -> crate::Result<String, S::Error> {
        let addr = self.field_addr(field, FieldKind::UnicodeString)?;

        let mut header = [0u8; 16];
        session
            .read_memory(addr, &mut header)
            .map_err(DebuggerError)?;

        // `Length` is in bytes and excludes any terminating NUL
        let len = LittleEndian::read_u16(&header[..2]) as usize;

        // empty strings usually have no buffer
        if len == 0 {
            return Ok(String::new());
        }

        let buffer = LittleEndian::read_u64(&header[UNICODE_STRING_BUFFER_OFFSET..]);

        let mut raw = vec![0u8; len & !1];
        session.read_memory(buffer, &mut raw).map_err(DebuggerError)?;

        let mut utf16 = vec![0u16; raw.len() / 2];
        LittleEndian::read_u16_into(&raw, &mut utf16);

        Ok(String::from_utf16_lossy(&utf16))
    }

    fn field_addr<E>(&self, field: &str, kind: FieldKind) -> crate::Result<u64, E> {
        let field = self
            .layout
            .check_field(field, kind)
            .map_err(|reason| crate::Error::type_layout(self.layout.name(), reason))?;

        Ok(self.addr.wrapping_add(field.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldKind, TypeLayout};
    use crate::error::LayoutMismatch;

    fn layout() -> TypeLayout {
        TypeLayout::new("_KTHING", 0x20)
            .with_field("Link", 0x0, FieldKind::Pointer)
            .with_field("Name", 0x8, FieldKind::UnicodeString)
            .with_field("Count", 0x18, FieldKind::U32)
            .with_field("Stamp", 0x1c, FieldKind::U64)
    }

    #[test]
    fn check_field_kind() {
        let layout = layout();

        assert_eq!(layout.check_field("Name", FieldKind::UnicodeString).unwrap().offset, 0x8);

        assert_eq!(
            layout.check_field("Count", FieldKind::Pointer),
            Err(LayoutMismatch::WrongKind {
                field: "Count".to_owned(),
                expected: FieldKind::Pointer,
                found: FieldKind::U32,
            })
        );

        assert_eq!(
            layout.check_field("Missing", FieldKind::U32),
            Err(LayoutMismatch::MissingField("Missing".to_owned()))
        );
    }

    #[test]
    fn check_field_bounds() {
        let layout = layout();

        assert!(layout.check_field("Count", FieldKind::U32).is_ok());

        // 8 bytes at 0x1c overflow a 0x20-byte structure
        assert_eq!(
            layout.check_field("Stamp", FieldKind::U64),
            Err(LayoutMismatch::OutOfBounds {
                field: "Stamp".to_owned(),
                offset: 0x1c,
                size: 0x20,
            })
        );

        let layout = TypeLayout::new("_KWRAP", 0x10).with_field("Far", u64::MAX, FieldKind::Pointer);
        assert!(matches!(
            layout.check_field("Far", FieldKind::Pointer),
            Err(LayoutMismatch::OutOfBounds { .. })
        ));
    }

    #[test]
    fn check_fields_stops_at_first_mismatch() {
        let layout = layout();

        assert!(layout
            .check_fields(&[("Link", FieldKind::Pointer), ("Name", FieldKind::UnicodeString)])
            .is_ok());

        assert_eq!(
            layout.check_fields(&[
                ("Link", FieldKind::Pointer),
                ("Other", FieldKind::U32),
                ("Stamp", FieldKind::U64),
            ]),
            Err(LayoutMismatch::MissingField("Other".to_owned()))
        );
    }
}
