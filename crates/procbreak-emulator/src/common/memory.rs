use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};

/// Flat, sparse address space made of non-overlapping regions.
#[derive(Default)]
pub struct Memory {
    /// Mapped regions, by start address.
    regions: BTreeMap<u64, Vec<u8>>,
}

impl Memory {
    /// Creates an address space with nothing mapped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a zeroed region of `size` bytes at `addr`.
    pub fn map(&mut self, addr: u64, size: usize) -> crate::Result<()> {
        let end = addr.saturating_add(size as u64);

        let overlaps_prev = self
            .regions
            .range(..=addr)
            .next_back()
            .is_some_and(|(start, data)| start + data.len() as u64 > addr);

        let overlaps_next = self
            .regions
            .range(addr..)
            .next()
            .is_some_and(|(start, _)| *start < end);

        if overlaps_prev || overlaps_next {
            return Err(crate::Error::AlreadyMapped(addr));
        }

        self.regions.insert(addr, vec![0; size]);

        Ok(())
    }

    /// Returns whether `len` bytes at `addr` are mapped.
    pub fn is_mapped(&self, addr: u64, len: usize) -> bool {
        self.region_offset(addr, len).is_some()
    }

    /// Reads memory into `buf`.
    ///
    /// The whole range must lie within a single region.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> crate::Result<()> {
        let (start, offset) = self.region_offset(addr, buf.len()).ok_or(
            crate::Error::UnmappedMemory {
                addr,
                len: buf.len(),
            },
        )?;

        let region = &self.regions[&start];
        buf.copy_from_slice(&region[offset..offset + buf.len()]);

        Ok(())
    }

    /// Writes `data` to memory.
    ///
    /// The whole range must lie within a single region.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> crate::Result<()> {
        let (start, offset) = self.region_offset(addr, data.len()).ok_or(
            crate::Error::UnmappedMemory {
                addr,
                len: data.len(),
            },
        )?;

        if let Some(region) = self.regions.get_mut(&start) {
            region[offset..offset + data.len()].copy_from_slice(data);
        }

        Ok(())
    }

    /// Writes a little-endian 64-bit value.
    pub fn write_u64(&mut self, addr: u64, value: u64) -> crate::Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.write(addr, &buf)
    }

    /// Reads a little-endian 64-bit value.
    pub fn read_u64(&self, addr: u64) -> crate::Result<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    /// Returns the region containing `[addr, addr + len)`, along with the
    /// offset of `addr` within it.
    fn region_offset(&self, addr: u64, len: usize) -> Option<(u64, usize)> {
        let (start, data) = self.regions.range(..=addr).next_back()?;

        let offset = (addr - start) as usize;
        let end = offset.checked_add(len)?;

        (end <= data.len()).then_some((*start, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::Memory;

    #[test]
    fn read_write_within_region() {
        let mut mem = Memory::new();
        mem.map(0x1000, 0x100).unwrap();

        mem.write_u64(0x1008, 0xdead_beef).unwrap();
        assert_eq!(mem.read_u64(0x1008).unwrap(), 0xdead_beef);
        assert_eq!(mem.read_u64(0x1000).unwrap(), 0);

        assert!(mem.is_mapped(0x10f8, 8));
        assert!(!mem.is_mapped(0x10f9, 8));
    }

    #[test]
    fn unmapped_access_fails() {
        let mut mem = Memory::new();
        mem.map(0x1000, 0x10).unwrap();

        assert!(matches!(
            mem.read_u64(0x2000),
            Err(crate::Error::UnmappedMemory { addr: 0x2000, len: 8 })
        ));
        assert!(mem.write(0x100c, &[0; 8]).is_err());
        assert!(mem.read_u64(0xff8).is_err());
    }

    #[test]
    fn overlapping_map_fails() {
        let mut mem = Memory::new();
        mem.map(0x1000, 0x100).unwrap();

        assert!(mem.map(0x10ff, 1).is_err());
        assert!(mem.map(0xf01, 0x100).is_err());
        assert!(mem.map(0x1100, 0x10).is_ok());
        assert!(mem.map(0xf00, 0x100).is_ok());
    }
}
