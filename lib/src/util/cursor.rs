use std::io::Cursor;

use binrw::{BinRead, BinWrite, Endian};
use zerocopy::{ByteOrder, LittleEndian};

use crate::format::error::{DecodeError, EncodeError};

/// Bounds-checked little-endian reader over an in-memory file image.
///
/// Cursors are cheap to copy; a scoped seek is expressed by taking a new cursor
/// with [`ByteCursor::at`] and leaving the original untouched.
#[derive(Copy, Clone, Debug)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Self { Self { data, pos: 0 } }

    #[inline]
    pub fn data(&self) -> &'a [u8] { self.data }

    #[inline]
    pub fn len(&self) -> usize { self.data.len() }

    #[inline]
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    #[inline]
    pub fn position(&self) -> usize { self.pos }

    #[inline]
    pub fn remaining(&self) -> usize { self.data.len().saturating_sub(self.pos) }

    /// Absolute seek. Seeking to exactly the end is allowed.
    pub fn seek(&mut self, offset: usize) -> Result<(), DecodeError> {
        if offset > self.data.len() {
            return Err(DecodeError::PointerOutOfRange {
                offset: self.pos,
                pointer: offset as u64,
                len: self.data.len(),
            });
        }
        self.pos = offset;
        Ok(())
    }

    /// Relative seek from the current position.
    pub fn skip(&mut self, delta: isize) -> Result<(), DecodeError> {
        let Some(target) = self.pos.checked_add_signed(delta) else {
            return Err(DecodeError::PointerOutOfRange {
                offset: self.pos,
                pointer: 0,
                len: self.data.len(),
            });
        };
        self.seek(target)
    }

    /// Returns a copy of this cursor positioned at `pointer`.
    /// The error reports where the pointer was read from, not the pointer itself.
    pub fn at(&self, pointer: u32) -> Result<Self, DecodeError> {
        let target = pointer as usize;
        if target >= self.data.len() {
            return Err(DecodeError::PointerOutOfRange {
                offset: self.pos,
                pointer: pointer as u64,
                len: self.data.len(),
            });
        }
        Ok(Self { data: self.data, pos: target })
    }

    pub fn align(&mut self, alignment: usize) -> Result<(), DecodeError> {
        let rem = self.pos % alignment;
        if rem != 0 {
            self.skip((alignment - rem) as isize)?;
        }
        Ok(())
    }

    pub fn bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if count > self.remaining() {
            return Err(DecodeError::UnexpectedEof {
                offset: self.pos,
                need: count,
                have: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(out)
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> { Ok(self.bytes(1)?[0]) }

    #[inline]
    pub fn read_i8(&mut self) -> Result<i8, DecodeError> { Ok(self.bytes(1)?[0] as i8) }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(LittleEndian::read_u16(self.bytes(2)?))
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(LittleEndian::read_i16(self.bytes(2)?))
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(LittleEndian::read_u32(self.bytes(4)?))
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(LittleEndian::read_i32(self.bytes(4)?))
    }

    #[inline]
    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(LittleEndian::read_f32(self.bytes(4)?))
    }

    /// Reads a u32 without advancing.
    pub fn peek_u32(&self) -> Result<u32, DecodeError> {
        let mut c = *self;
        c.read_u32()
    }

    /// Reads a u32 at an absolute offset without moving this cursor.
    pub fn u32_at(&self, offset: usize) -> Result<u32, DecodeError> {
        let mut c = *self;
        c.seek(offset)?;
        c.read_u32()
    }

    /// Reads a null-terminated string at `pointer`. Zero means absent.
    pub fn cstr_at(&self, pointer: u32) -> Result<Option<String>, DecodeError> {
        if pointer == 0 {
            return Ok(None);
        }
        let c = self.at(pointer)?;
        let tail = &self.data[c.pos..];
        let Some(end) = tail.iter().position(|&b| b == 0) else {
            return Err(DecodeError::UnterminatedString { offset: c.pos });
        };
        Ok(Some(String::from_utf8_lossy(&tail[..end]).into_owned()))
    }

    /// Reads a fixed-layout binrw record at the current position.
    pub fn read_record<T>(&mut self) -> Result<T, DecodeError>
    where
        T: BinRead,
        for<'b> T::Args<'b>: Default,
    {
        let offset = self.pos;
        let mut reader = Cursor::new(self.data);
        reader.set_position(offset as u64);
        let value = T::read_options(&mut reader, Endian::Little, Default::default()).map_err(
            |e| DecodeError::Record {
                offset,
                record: short_type_name::<T>(),
                message: e.to_string(),
            },
        )?;
        self.pos = reader.position() as usize;
        Ok(value)
    }
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

/// Growable little-endian writer that remembers every pointer field it emits.
#[derive(Clone, Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
    pointers: Vec<u32>,
}

impl ByteWriter {
    pub fn new() -> Self { Self::default() }

    #[inline]
    pub fn position(&self) -> usize { self.buf.len() }

    /// Offsets of every field written through [`ByteWriter::put_ptr`] or
    /// [`ByteWriter::reserve_ptr`], in write order.
    pub fn pointer_fields(&self) -> &[u32] { &self.pointers }

    pub fn into_inner(self) -> Vec<u8> { self.buf }

    pub fn put_u8(&mut self, value: u8) { self.buf.push(value); }

    pub fn put_i8(&mut self, value: i8) { self.buf.push(value as u8); }

    pub fn put_u16(&mut self, value: u16) {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_i16(&mut self, value: i16) {
        let mut b = [0u8; 2];
        LittleEndian::write_i16(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_u32(&mut self, value: u32) {
        let mut b = [0u8; 4];
        LittleEndian::write_u32(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_f32(&mut self, value: f32) {
        let mut b = [0u8; 4];
        LittleEndian::write_f32(&mut b, value);
        self.buf.extend_from_slice(&b);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }

    /// Writes a pointer field and records it for the relocation table.
    pub fn put_ptr(&mut self, target: u32) {
        self.pointers.push(self.buf.len() as u32);
        self.put_u32(target);
    }

    /// Writes a zero pointer to be patched later; returns the field offset.
    pub fn reserve_ptr(&mut self) -> usize {
        let at = self.buf.len();
        self.put_ptr(0);
        at
    }

    /// Writes a zero word to be patched later; returns the field offset.
    pub fn reserve_u32(&mut self) -> usize {
        let at = self.buf.len();
        self.put_u32(0);
        at
    }

    /// Records an already written field as a pointer.
    pub fn mark_pointer(&mut self, at: usize) { self.pointers.push(at as u32); }

    pub fn patch_u32(&mut self, at: usize, value: u32) {
        LittleEndian::write_u32(&mut self.buf[at..at + 4], value);
    }

    /// Overwrites previously reserved bytes with a record.
    pub fn patch_record<T>(&mut self, at: usize, value: &T) -> Result<(), EncodeError>
    where
        T: BinWrite,
        for<'b> T::Args<'b>: Default,
    {
        let mut scratch = ByteWriter::new();
        scratch.write_record(value)?;
        let bytes = scratch.into_inner();
        self.buf[at..at + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    pub fn align(&mut self, alignment: usize) {
        let rem = self.buf.len() % alignment;
        if rem != 0 {
            self.buf.resize(self.buf.len() + alignment - rem, 0);
        }
    }

    pub fn write_record<T>(&mut self, value: &T) -> Result<(), EncodeError>
    where
        T: BinWrite,
        for<'b> T::Args<'b>: Default,
    {
        let mut writer = Cursor::new(Vec::new());
        value
            .write_options(&mut writer, Endian::Little, Default::default())
            .map_err(|e| EncodeError::Record {
                record: short_type_name::<T>(),
                message: e.to_string(),
            })?;
        self.buf.extend_from_slice(&writer.into_inner());
        Ok(())
    }
}
