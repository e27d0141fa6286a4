//! Little-endian binary encoding shared by every persisted form.
//!
//! All scalars are fixed-width little-endian. Strings are `u64`
//! length-prefixed UTF-8. Homogeneous sequences carry a `u64` element count;
//! string sequences are additionally prefixed with their total byte size so a
//! reader can skip them without decoding every element. Durations and
//! monotonic timestamps travel as their integer count in the stated unit.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("buffer exhausted: needed {needed} more bytes, {available} available")]
    Overflow { needed: usize, available: usize },
    #[error("sub-buffer capacity of {cap} bytes exceeded")]
    BlockOverflow { cap: usize },
    #[error("length prefix {0} exceeds the remaining buffer")]
    BadLength(u64),
    #[error("string field is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unknown class version {0:#x}")]
    UnknownVersion(i32),
    #[error("unknown enum discriminant {value} for {what}")]
    BadDiscriminant { what: &'static str, value: i64 },
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Append-only encoder over a growable byte buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
    /// Hard cap for bounded sub-buffers. `usize::MAX` means unbounded.
    cap: usize,
}

macro_rules! scalar_codec {
    ($($ty:ty => $write:ident / $read:ident),+ $(,)?) => {
        impl Encoder {
            $(pub fn $write(&mut self, value: $ty) -> CodecResult<()> {
                self.put(&value.to_le_bytes())
            })+
        }
        impl Decoder<'_> {
            $(pub fn $read(&mut self) -> CodecResult<$ty> {
                let raw = self.take(size_of::<$ty>())?;
                Ok(<$ty>::from_le_bytes(raw.try_into().expect("exact slice")))
            })+
        }
    };
}

scalar_codec! {
    u8 => write_u8 / read_u8,
    u32 => write_u32 / read_u32,
    u64 => write_u64 / read_u64,
    i32 => write_i32 / read_i32,
    i64 => write_i64 / read_i64,
    f32 => write_f32 / read_f32,
    f64 => write_f64 / read_f64,
}

impl Encoder {
    pub fn new() -> Self {
        Self { buf: Vec::new(), cap: usize::MAX }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity), cap: usize::MAX }
    }

    /// A bounded encoder that refuses to grow past `cap` bytes. Used for the
    /// compact sub-buffer blocks inside derivation-tree payloads.
    pub fn bounded(cap: usize) -> Self {
        Self { buf: Vec::with_capacity(cap.min(4096)), cap }
    }

    fn put(&mut self, bytes: &[u8]) -> CodecResult<()> {
        if self.buf.len() + bytes.len() > self.cap {
            return Err(CodecError::BlockOverflow { cap: self.cap });
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_bool(&mut self, value: bool) -> CodecResult<()> {
        self.write_u8(value as u8)
    }

    pub fn write_str(&mut self, value: &str) -> CodecResult<()> {
        self.write_u64(value.len() as u64)?;
        self.put(value.as_bytes())
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> CodecResult<()> {
        self.write_u64(value.len() as u64)?;
        self.put(value)
    }

    pub fn write_duration_ns(&mut self, value: Duration) -> CodecResult<()> {
        self.write_i64(value.as_nanos() as i64)
    }

    pub fn write_u64_seq(&mut self, values: impl ExactSizeIterator<Item = u64>) -> CodecResult<()> {
        self.write_u64(values.len() as u64)?;
        for v in values {
            self.write_u64(v)?;
        }
        Ok(())
    }

    pub fn write_f64_seq(&mut self, values: impl ExactSizeIterator<Item = f64>) -> CodecResult<()> {
        self.write_u64(values.len() as u64)?;
        for v in values {
            self.write_f64(v)?;
        }
        Ok(())
    }

    /// String sequences lead with their total encoded byte size so readers
    /// can skip the whole run in one bound check.
    pub fn write_str_seq<'v>(
        &mut self,
        values: impl ExactSizeIterator<Item = &'v str> + Clone,
    ) -> CodecResult<()> {
        let total: u64 = values
            .clone()
            .map(|s| size_of::<u64>() as u64 + s.len() as u64)
            .sum();
        self.write_u64(total)?;
        self.write_u64(values.len() as u64)?;
        for v in values {
            self.write_str(v)?;
        }
        Ok(())
    }

    /// Appends a finished sub-buffer as a `u64` length-prefixed block.
    pub fn write_block(&mut self, block: Encoder) -> CodecResult<()> {
        self.write_bytes(&block.buf)
    }
}

thread_local! {
    static SCRATCH: std::cell::Cell<Vec<u8>> = const { std::cell::Cell::new(Vec::new()) };
}

/// Runs `f` with a per-thread scratch encoder. The backing buffer is reused
/// across calls on the same thread, so per-form serialization on the save
/// path stops allocating once the buffer has grown to a steady size.
pub fn with_scratch<R>(f: impl FnOnce(&mut Encoder) -> R) -> R {
    SCRATCH.with(|slot| {
        let mut buf = slot.take();
        buf.clear();
        let mut enc = Encoder { buf, cap: usize::MAX };
        let result = f(&mut enc);
        slot.set(enc.buf);
        result
    })
}

impl Encoder {
    /// The encoded bytes so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Cursor-style reader over a borrowed byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, count: usize) -> CodecResult<&'a [u8]> {
        if count > self.remaining() {
            return Err(CodecError::Overflow { needed: count, available: self.remaining() });
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn skip(&mut self, count: usize) -> CodecResult<()> {
        self.take(count).map(|_| ())
    }

    pub fn read_bool(&mut self) -> CodecResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_string(&mut self) -> CodecResult<String> {
        let len = self.read_u64()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::BadLength(len));
        }
        Ok(String::from_utf8(self.take(len as usize)?.to_vec())?)
    }

    pub fn read_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_u64()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::BadLength(len));
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn read_duration_ns(&mut self) -> CodecResult<Duration> {
        let ns = self.read_i64()?;
        Ok(Duration::from_nanos(ns.max(0) as u64))
    }

    pub fn read_u64_seq(&mut self) -> CodecResult<Vec<u64>> {
        let count = self.read_u64()?;
        if count.saturating_mul(size_of::<u64>() as u64) > self.remaining() as u64 {
            return Err(CodecError::BadLength(count));
        }
        (0..count).map(|_| self.read_u64()).collect()
    }

    pub fn read_f64_seq(&mut self) -> CodecResult<Vec<f64>> {
        let count = self.read_u64()?;
        if count.saturating_mul(size_of::<f64>() as u64) > self.remaining() as u64 {
            return Err(CodecError::BadLength(count));
        }
        (0..count).map(|_| self.read_f64()).collect()
    }

    pub fn read_str_seq(&mut self) -> CodecResult<Vec<String>> {
        let total = self.read_u64()?;
        if total > self.remaining() as u64 {
            return Err(CodecError::BadLength(total));
        }
        let count = self.read_u64()?;
        (0..count).map(|_| self.read_string()).collect()
    }

    /// Skips a string sequence without decoding its elements.
    pub fn skip_str_seq(&mut self) -> CodecResult<()> {
        let total = self.read_u64()?;
        if total > self.remaining() as u64 {
            return Err(CodecError::BadLength(total));
        }
        self.skip(total as usize)
    }

    /// Reads a `u64` length-prefixed block and returns a decoder bounded to
    /// exactly that block.
    pub fn read_block(&mut self) -> CodecResult<Decoder<'a>> {
        let len = self.read_u64()?;
        if len > self.remaining() as u64 {
            return Err(CodecError::BadLength(len));
        }
        Ok(Decoder::new(self.take(len as usize)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut enc = Encoder::new();
        enc.write_u8(0xab).unwrap();
        enc.write_u32(0xdead_beef).unwrap();
        enc.write_u64(u64::MAX - 1).unwrap();
        enc.write_i32(-7).unwrap();
        enc.write_i64(i64::MIN).unwrap();
        enc.write_f32(1.5).unwrap();
        enc.write_f64(-0.25).unwrap();
        enc.write_bool(true).unwrap();

        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 0xab);
        assert_eq!(dec.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(dec.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(dec.read_i32().unwrap(), -7);
        assert_eq!(dec.read_i64().unwrap(), i64::MIN);
        assert_eq!(dec.read_f32().unwrap(), 1.5);
        assert_eq!(dec.read_f64().unwrap(), -0.25);
        assert!(dec.read_bool().unwrap());
        assert_eq!(dec.remaining(), 0);
    }

    #[test]
    fn little_endian_layout() {
        let mut enc = Encoder::new();
        enc.write_u32(0x0102_0304).unwrap();
        assert_eq!(enc.into_bytes(), vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn string_sequences_are_skippable() {
        let mut enc = Encoder::new();
        let tokens = ["alpha".to_owned(), "beta".to_owned(), String::new()];
        enc.write_str_seq(tokens.iter().map(String::as_str)).unwrap();
        enc.write_u32(42).unwrap();

        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        dec.skip_str_seq().unwrap();
        assert_eq!(dec.read_u32().unwrap(), 42);

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_str_seq().unwrap(), tokens);
    }

    #[test]
    fn truncated_read_reports_overflow() {
        let mut enc = Encoder::new();
        enc.write_u64(9000).unwrap();
        let mut bytes = enc.into_bytes();
        bytes.truncate(6);

        let mut dec = Decoder::new(&bytes);
        assert!(matches!(dec.read_u64(), Err(CodecError::Overflow { .. })));
    }

    #[test]
    fn bad_length_prefix_is_rejected() {
        let mut enc = Encoder::new();
        enc.write_u64(u64::MAX).unwrap();
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert!(matches!(dec.read_string(), Err(CodecError::BadLength(_))));
    }

    #[test]
    fn bounded_encoder_refuses_overflow() {
        let mut enc = Encoder::bounded(8);
        enc.write_u64(1).unwrap();
        assert!(matches!(enc.write_u8(0), Err(CodecError::BlockOverflow { .. })));
    }

    #[test]
    fn block_round_trip() {
        let mut inner = Encoder::bounded(64);
        inner.write_i64(-3).unwrap();
        inner.write_str("nested").unwrap();

        let mut outer = Encoder::new();
        outer.write_u32(7).unwrap();
        outer.write_block(inner).unwrap();

        let bytes = outer.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u32().unwrap(), 7);
        let mut block = dec.read_block().unwrap();
        assert_eq!(block.read_i64().unwrap(), -3);
        assert_eq!(block.read_string().unwrap(), "nested");
        assert_eq!(block.remaining(), 0);
        assert_eq!(dec.remaining(), 0);
    }
}
