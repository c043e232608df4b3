//! Untyped argument buffers for command records.
//!
//! The producer appends raw `Pod` representations with [`ArgBuffer::push`]; the dispatcher
//! reads them back with [`ArgReader::pop`] in exactly the same order. There is no per-value
//! framing: producer and consumer agree on each opcode's argument schema, and reading a value
//! with a different type than was pushed is a programming error. Running off the end of the
//! buffer is detected and reported as [`DecodeError`], which the dispatcher treats as fatal.
//!
//! Variable-length payloads are written as a `u32` element count followed by the raw elements.
//! The payload lives inside the record's own buffer, so it is released together with the
//! record.

use bytemuck::Pod;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("argument read of {wanted} bytes at offset {offset} overruns buffer of {len} bytes")]
    Truncated {
        offset: usize,
        wanted: usize,
        len: usize,
    },
    #[error("{0} bytes of arguments left unread")]
    TrailingBytes(usize),
}

/// Owned, append-only argument storage attached to a single command record.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ArgBuffer {
    bytes: Vec<u8>,
}

impl core::fmt::Debug for ArgBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArgBuffer")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ArgBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Appends the raw representation of `value`.
    pub fn push<T: Pod>(&mut self, value: T) -> &mut Self {
        self.bytes.extend_from_slice(bytemuck::bytes_of(&value));
        self
    }

    pub fn push_bool(&mut self, value: bool) -> &mut Self {
        self.push(u8::from(value))
    }

    /// Appends a `u32` element count followed by the raw elements.
    ///
    /// Panics if `values` holds more than `u32::MAX` elements.
    pub fn push_slice<T: Pod>(&mut self, values: &[T]) -> &mut Self {
        let count = u32::try_from(values.len()).expect("argument slice exceeds u32::MAX elements");
        self.push(count);
        self.bytes
            .extend_from_slice(bytemuck::cast_slice::<T, u8>(values));
        self
    }

    pub fn reader(&self) -> ArgReader<'_> {
        ArgReader::new(&self.bytes)
    }
}

impl From<Vec<u8>> for ArgBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// Cursor over an [`ArgBuffer`] on the consumer side.
#[derive(Debug, Clone)]
pub struct ArgReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ArgReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, wanted: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .offset
            .checked_add(wanted)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DecodeError::Truncated {
                offset: self.offset,
                wanted,
                len: self.bytes.len(),
            })?;
        let out = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(out)
    }

    /// Reads the next value. Values may be unaligned inside the buffer.
    pub fn pop<T: Pod>(&mut self) -> Result<T, DecodeError> {
        let raw = self.take(core::mem::size_of::<T>())?;
        Ok(bytemuck::pod_read_unaligned(raw))
    }

    pub fn pop_bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.pop::<u8>()? != 0)
    }

    /// Reads a count-prefixed sequence written by [`ArgBuffer::push_slice`].
    pub fn pop_vec<T: Pod>(&mut self) -> Result<Vec<T>, DecodeError> {
        let count = self.pop::<u32>()? as usize;
        let elem = core::mem::size_of::<T>();
        let total = count.checked_mul(elem).ok_or(DecodeError::Truncated {
            offset: self.offset,
            wanted: usize::MAX,
            len: self.bytes.len(),
        })?;
        let raw = self.take(total)?;
        Ok(raw
            .chunks_exact(elem.max(1))
            .take(count)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    /// Reads a count-prefixed byte payload without copying it.
    pub fn pop_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let count = self.pop::<u32>()? as usize;
        self.take(count)
    }

    /// Fails when the producer pushed more than the consumer read.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, Rect};

    #[test]
    fn values_pop_in_push_order_at_exact_width() {
        let mut args = ArgBuffer::new();
        args.push(7u8).push(-3i32).push(1.5f32).push_bool(true);
        assert_eq!(args.len(), 1 + 4 + 4 + 1);

        let mut r = args.reader();
        assert_eq!(r.pop::<u8>().unwrap(), 7);
        assert_eq!(r.pop::<i32>().unwrap(), -3);
        assert_eq!(r.pop::<f32>().unwrap(), 1.5);
        assert!(r.pop_bool().unwrap());
        r.finish().unwrap();
    }

    #[test]
    fn slices_are_count_prefixed() {
        let pts = [Point::new(1, 2), Point::new(3, 4), Point::new(-5, 6)];
        let mut args = ArgBuffer::new();
        args.push_slice(&pts).push(Rect::new(0, 0, 8, 8));
        assert_eq!(args.len(), 4 + 3 * 8 + 16);
        assert_eq!(&args.as_bytes()[..4], &3u32.to_ne_bytes());

        let mut r = args.reader();
        assert_eq!(r.pop_vec::<Point>().unwrap(), pts.to_vec());
        assert_eq!(r.pop::<Rect>().unwrap(), Rect::new(0, 0, 8, 8));
        r.finish().unwrap();
    }

    #[test]
    fn truncated_read_is_reported() {
        let mut args = ArgBuffer::new();
        args.push(1u16);
        let mut r = args.reader();
        assert_eq!(
            r.pop::<u32>(),
            Err(DecodeError::Truncated {
                offset: 0,
                wanted: 4,
                len: 2
            })
        );
    }

    #[test]
    fn oversized_count_does_not_allocate() {
        let mut args = ArgBuffer::new();
        args.push(u32::MAX);
        let mut r = args.reader();
        assert!(matches!(
            r.pop_vec::<u64>(),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_detected() {
        let mut args = ArgBuffer::new();
        args.push(1u32).push(2u32);
        let mut r = args.reader();
        r.pop::<u32>().unwrap();
        assert_eq!(r.finish(), Err(DecodeError::TrailingBytes(4)));
    }
}
