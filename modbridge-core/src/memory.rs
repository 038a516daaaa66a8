// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Memory bridge
//!
//! Bounds-checked access to a flat byte buffer: a WebAssembly guest's linear
//! memory, or the host-managed staging buffer used by the scripting backend.
//! Every access is validated against the buffer's current size before any
//! byte is touched.

use crate::error::{CoreError, CoreResult};
use byteorder::{ByteOrder, LittleEndian};

/// Largest address a region may reach. Anything beyond cannot be a real
/// location in a 32-bit address space.
const ADDRESS_SPACE: u64 = 1 << 32;

/// `(offset, length)` window into guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryRegion {
    pub offset: u32,
    pub length: u32,
}

impl MemoryRegion {
    pub const EMPTY: MemoryRegion = MemoryRegion {
        offset: 0,
        length: 0,
    };

    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    /// Build a region from the `(i32, i32)` pair used by import parameters.
    pub fn from_parts(offset: i32, length: i32) -> Self {
        Self::new(offset as u32, length as u32)
    }

    pub fn end(&self) -> u64 {
        self.offset as u64 + self.length as u64
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Pack into the `i64` wire form: `(length << 32) | offset`.
    pub fn to_bits(self) -> u64 {
        ((self.length as u64) << 32) | self.offset as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            offset: bits as u32,
            length: (bits >> 32) as u32,
        }
    }

    /// Validate against a buffer of `size` bytes.
    ///
    /// A region that runs past the end of the address space is corrupt; one
    /// that merely runs past the current buffer is out of bounds.
    pub fn check(&self, size: usize) -> CoreResult<std::ops::Range<usize>> {
        let end = self.end();
        if end > ADDRESS_SPACE {
            return Err(CoreError::CorruptRegion {
                offset: self.offset as u64,
                length: self.length as u64,
            });
        }
        if end > size as u64 {
            return Err(CoreError::OutOfBounds {
                offset: self.offset as u64,
                length: self.length as u64,
                size: size as u64,
            });
        }
        Ok(self.offset as usize..end as usize)
    }
}

/// Read access to a guest byte buffer.
pub trait MemoryBridge {
    /// Current size in bytes.
    fn size(&self) -> usize;

    /// Raw view of the whole buffer.
    fn data(&self) -> &[u8];

    fn read(&self, region: MemoryRegion) -> CoreResult<&[u8]> {
        let range = region.check(self.size())?;
        Ok(&self.data()[range])
    }

    fn read_str(&self, region: MemoryRegion) -> CoreResult<&str> {
        let bytes = self.read(region)?;
        std::str::from_utf8(bytes)
            .map_err(|e| CoreError::Decode(format!("invalid UTF-8 at {}: {}", region.offset, e)))
    }

    fn read_u32(&self, offset: u32) -> CoreResult<u32> {
        let bytes = self.read(MemoryRegion::new(offset, 4))?;
        Ok(LittleEndian::read_u32(bytes))
    }

    fn read_f64(&self, offset: u32) -> CoreResult<f64> {
        let bytes = self.read(MemoryRegion::new(offset, 8))?;
        Ok(LittleEndian::read_f64(bytes))
    }
}

/// Write a byte slice into `buffer` at a guest-chosen offset.
pub fn write_checked(buffer: &mut [u8], offset: u32, bytes: &[u8]) -> CoreResult<MemoryRegion> {
    let length = u32::try_from(bytes.len()).map_err(|_| CoreError::OutOfBounds {
        offset: offset as u64,
        length: bytes.len() as u64,
        size: buffer.len() as u64,
    })?;
    let region = MemoryRegion::new(offset, length);
    let range = region.check(buffer.len())?;
    buffer[range].copy_from_slice(bytes);
    Ok(region)
}

/// Borrowed read-only view, used while a host function runs.
#[derive(Debug, Clone, Copy)]
pub struct SliceMemory<'a>(pub &'a [u8]);

impl MemoryBridge for SliceMemory<'_> {
    fn size(&self) -> usize {
        self.0.len()
    }

    fn data(&self) -> &[u8] {
        self.0
    }
}

/// Host-managed byte buffer standing in for linear memory in the scripting
/// backend. Allocation is a bump pointer reset at the end of every call.
#[derive(Debug)]
pub struct StagingBuffer {
    bytes: Vec<u8>,
    cursor: usize,
    max_bytes: usize,
}

impl StagingBuffer {
    pub fn new(initial_bytes: usize, max_bytes: usize) -> Self {
        let initial = initial_bytes.min(max_bytes);
        Self {
            bytes: vec![0; initial],
            cursor: 0,
            max_bytes,
        }
    }

    /// Host-chosen placement: copy `data` to the next free offset, growing
    /// the buffer up to its cap.
    pub fn write(&mut self, data: &[u8]) -> CoreResult<MemoryRegion> {
        let needed = self.cursor + data.len();
        if needed > self.bytes.len() {
            let additional = needed - self.bytes.len();
            self.grow(additional.max(self.bytes.len()).min(self.max_bytes - self.bytes.len()))?;
        }
        if needed > self.bytes.len() {
            return Err(CoreError::OutOfBounds {
                offset: self.cursor as u64,
                length: data.len() as u64,
                size: self.bytes.len() as u64,
            });
        }

        let offset = u32::try_from(self.cursor).map_err(|_| CoreError::CorruptRegion {
            offset: self.cursor as u64,
            length: data.len() as u64,
        })?;
        let region = write_checked(&mut self.bytes, offset, data)?;
        self.cursor = needed;
        Ok(region)
    }

    pub fn write_at(&mut self, offset: u32, data: &[u8]) -> CoreResult<MemoryRegion> {
        write_checked(&mut self.bytes, offset, data)
    }

    /// Extend the buffer by `additional` bytes. Returns the previous size.
    pub fn grow(&mut self, additional: usize) -> CoreResult<usize> {
        let previous = self.bytes.len();
        let target = previous + additional;
        if target > self.max_bytes {
            return Err(CoreError::OutOfBounds {
                offset: previous as u64,
                length: additional as u64,
                size: self.max_bytes as u64,
            });
        }
        self.bytes.resize(target, 0);
        Ok(previous)
    }

    /// Bytes handed out since the last reset.
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Forget every allocation. Capacity is kept.
    pub fn reset(&mut self) {
        self.bytes[..self.cursor].fill(0);
        self.cursor = 0;
    }
}

impl MemoryBridge for StagingBuffer {
    fn size(&self) -> usize {
        self.bytes.len()
    }

    fn data(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_packing() {
        let region = MemoryRegion::new(1024, 17);
        assert_eq!(MemoryRegion::from_bits(region.to_bits()), region);
        assert_eq!(region.to_bits() >> 32, 17);
    }

    #[test]
    fn test_out_of_bounds_read() {
        let memory = SliceMemory(&[1, 2, 3, 4]);
        assert_eq!(memory.read(MemoryRegion::new(1, 3)).unwrap(), &[2, 3, 4]);

        let err = memory.read(MemoryRegion::new(2, 3)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::OutOfBounds {
                offset: 2,
                length: 3,
                size: 4
            }
        ));
    }

    #[test]
    fn test_region_past_address_space_is_corrupt() {
        let memory = SliceMemory(&[0; 8]);
        let err = memory
            .read(MemoryRegion::new(u32::MAX, 16))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_read_integers() {
        let mut bytes = vec![0u8; 12];
        LittleEndian::write_u32(&mut bytes[0..4], 0xDEAD_BEEF);
        LittleEndian::write_f64(&mut bytes[4..12], 2.5);
        let memory = SliceMemory(&bytes);
        assert_eq!(memory.read_u32(0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(memory.read_f64(4).unwrap(), 2.5);
        assert!(memory.read_u32(10).is_err());
    }

    #[test]
    fn test_staging_buffer_grows_to_cap() {
        let mut staging = StagingBuffer::new(4, 16);
        let first = staging.write(b"hello").unwrap();
        assert_eq!(first, MemoryRegion::new(0, 5));
        let second = staging.write(b"world").unwrap();
        assert_eq!(second, MemoryRegion::new(5, 5));
        assert_eq!(staging.read_str(second).unwrap(), "world");

        let err = staging.write(&[0; 32]).unwrap_err();
        assert!(matches!(err, CoreError::OutOfBounds { .. }));

        staging.reset();
        assert_eq!(staging.used(), 0);
        assert_eq!(staging.write(b"x").unwrap().offset, 0);
    }

    #[test]
    fn test_invalid_utf8_is_decode_error() {
        let memory = SliceMemory(&[0xff, 0xfe]);
        assert!(matches!(
            memory.read_str(MemoryRegion::new(0, 2)),
            Err(CoreError::Decode(_))
        ));
    }
}
