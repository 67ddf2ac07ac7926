//! Deterministic binary encoding used by the program container.
//!
//! # Binary Format
//!
//! - Integers: little-endian, fixed-width
//! - `usize`: encoded as `u64`
//! - `bool`: one byte, `0` or `1`
//! - `f64`: IEEE-754 bits as a little-endian `u64`
//! - `char`: scalar value as a little-endian `u32`
//! - `Vec<T>`/`String`: 8-byte length prefix followed by elements
//! - `Option<T>`: 1-byte tag (0 = None, 1 = Some) followed by the value
//! - `[T; N]`: elements back to back, no prefix
//!
//! Instructions are a fixed 8 bytes each (`u16` opcode plus three `u16`
//! operands), which keeps serialized streams bit-exact.

use scopevm_derive::Error;

/// Destination for encoded bytes.
///
/// Implemented by byte buffers and by [`SizeCounter`], so encoders write
/// straight into their target.
pub trait EncodeSink {
    /// Appends `bytes` to the sink.
    fn write(&mut self, bytes: &[u8]);
}

/// Counts encoded bytes without storing them.
///
/// Used by [`Encode::to_bytes`] to size the output buffer exactly.
#[derive(Default)]
pub struct SizeCounter {
    len: usize,
}

impl SizeCounter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes counted so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing has been counted.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl EncodeSink for SizeCounter {
    fn write(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }
}

impl EncodeSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Types with a binary representation.
pub trait Encode {
    /// Writes the binary representation of `self` to `out`.
    fn encode<S: EncodeSink>(&self, out: &mut S);

    /// Encodes into a buffer sized exactly for the value.
    fn to_bytes(&self) -> Vec<u8> {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter);

        let mut out = Vec::with_capacity(counter.len());
        self.encode(&mut out);
        out
    }
}

/// Errors produced while decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// Bytes do not form a valid value (bad tag, bool, char or UTF-8).
    #[error("invalid value")]
    InvalidValue,
    /// Length prefix above the decoder's limit or the platform's `usize`.
    #[error("length prefix too large")]
    LengthOverflow,
}

/// Types that can be read back from their binary representation.
pub trait Decode: Sized {
    /// Decodes one value and advances `input` past it.
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a value that must span all of `data`.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut input = data;
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::InvalidValue);
        }
        Ok(value)
    }
}

/// Splits exactly `N` bytes off the front of `input`.
fn read_array<const N: usize>(input: &mut &[u8]) -> Result<[u8; N], DecodeError> {
    let (head, rest) = input
        .split_first_chunk::<N>()
        .ok_or(DecodeError::UnexpectedEof)?;
    *input = rest;
    Ok(*head)
}

/// Little-endian fixed-width encoding for primitive integers.
macro_rules! impl_int {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<S: EncodeSink>(&self, out: &mut S) {
                    out.write(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
                    Ok(<$t>::from_le_bytes(read_array(input)?))
                }
            }
        )*
    };
}

impl_int!(u8, u16, u32, u64, i16, i32, i64);

impl Encode for usize {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (*self as u64).encode(out);
    }
}

impl Decode for usize {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        usize::try_from(u64::decode(input)?).map_err(|_| DecodeError::LengthOverflow)
    }
}

impl Encode for bool {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[*self as u8]);
    }
}

impl Decode for bool {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

impl Encode for f64 {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.to_bits().encode(out);
    }
}

impl Decode for f64 {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(f64::from_bits(u64::decode(input)?))
    }
}

impl Encode for char {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (*self as u32).encode(out);
    }
}

impl Decode for char {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        char::from_u32(u32::decode(input)?).ok_or(DecodeError::InvalidValue)
    }
}

/// Upper bound on decoded collection lengths.
const MAX_VEC_LEN: usize = 1 << 24;

impl<T: Encode> Encode for Vec<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = usize::decode(input)?;
        if len > MAX_VEC_LEN {
            return Err(DecodeError::LengthOverflow);
        }
        // Never trust the prefix for the allocation size.
        let mut items = Vec::with_capacity(len.min(input.len()));
        for _ in 0..len {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

impl Encode for String {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_str().encode(out);
    }
}

impl Encode for &str {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        out.write(self.as_bytes());
    }
}

impl Decode for String {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        String::from_utf8(Vec::<u8>::decode(input)?).map_err(|_| DecodeError::InvalidValue)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        match self {
            None => 0u8.encode(out),
            Some(value) => {
                1u8.encode(out);
                value.encode(out);
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(input)?)),
            _ => Err(DecodeError::InvalidValue),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(self);
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        read_array(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bytes_allocates_exact_capacity() {
        let data: Vec<u16> = vec![1, 2, 3];
        let bytes = data.to_bytes();
        assert_eq!(bytes.len(), 8 + 3 * 2);
        assert_eq!(bytes.capacity(), bytes.len());
    }

    #[test]
    fn integers_are_little_endian() {
        assert_eq!(0x1234u16.to_bytes(), vec![0x34, 0x12]);
        assert_eq!((-1i64).to_bytes(), vec![0xFF; 8]);
        assert_eq!(u32::from_bytes(&[0x78, 0x56, 0x34, 0x12]).unwrap(), 0x12345678);
    }

    #[test]
    fn float_keeps_exact_bits() {
        for value in [0.0f64, -0.0, 1.5, f64::MAX, f64::INFINITY] {
            let decoded = f64::from_bytes(&value.to_bytes()).unwrap();
            assert_eq!(decoded.to_bits(), value.to_bits());
        }
        let nan = f64::from_bytes(&f64::NAN.to_bytes()).unwrap();
        assert!(nan.is_nan());
    }

    #[test]
    fn char_rejects_surrogates() {
        assert_eq!(char::from_bytes(&('λ' as u32).to_bytes()).unwrap(), 'λ');
        assert_eq!(
            char::from_bytes(&0xD800u32.to_bytes()),
            Err(DecodeError::InvalidValue)
        );
    }

    #[test]
    fn bool_rejects_other_bytes() {
        assert!(bool::from_bytes(&[1]).unwrap());
        assert_eq!(bool::from_bytes(&[2]), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn vec_has_length_prefix() {
        let bytes = vec![0xAAu8, 0xBB].to_bytes();
        assert_eq!(&bytes[..8], &2u64.to_le_bytes());
        assert_eq!(&bytes[8..], &[0xAA, 0xBB]);
    }

    #[test]
    fn vec_length_overflow_is_rejected() {
        let bytes = ((MAX_VEC_LEN as u64) + 1).to_bytes();
        assert_eq!(
            Vec::<u8>::from_bytes(&bytes),
            Err(DecodeError::LengthOverflow)
        );
    }

    #[test]
    fn vec_with_lying_prefix_hits_eof() {
        let mut bytes = 1000u64.to_bytes();
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(
            Vec::<u8>::from_bytes(&bytes),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn string_rejects_invalid_utf8() {
        let mut bytes = 2u64.to_bytes();
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        assert_eq!(String::from_bytes(&bytes), Err(DecodeError::InvalidValue));
        assert_eq!("ok".to_bytes(), "ok".to_string().to_bytes());
    }

    #[test]
    fn option_tags() {
        assert_eq!(None::<u16>.to_bytes(), vec![0]);
        assert_eq!(Some(7u16).to_bytes(), vec![1, 7, 0]);
        assert_eq!(
            Option::<u16>::from_bytes(&[2, 0, 0]),
            Err(DecodeError::InvalidValue)
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        assert_eq!(u8::from_bytes(&[1, 2]), Err(DecodeError::InvalidValue));
    }

    #[test]
    fn decode_advances_input() {
        let mut input: &[u8] = &[0x01, 0x02, 0x03];
        assert_eq!(u8::decode(&mut input).unwrap(), 1);
        assert_eq!(u16::decode(&mut input).unwrap(), 0x0302);
        assert!(input.is_empty());
        assert_eq!(u8::decode(&mut input), Err(DecodeError::UnexpectedEof));
    }
}
