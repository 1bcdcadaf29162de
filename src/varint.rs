//! Variable-length integer encoding and decoding.
//!
//! # Overview
//!
//! Little-endian base-128 varints: each byte carries 7 data bits and a
//! continuation bit in the high position. The wire format uses them for every
//! length, count, id, and flag field, in two widths (`u32`, `u64`), plus a
//! ZigZag mapping for signed 32-bit integers so small magnitudes of either
//! sign stay short.
//!
//! Reads are strict: a varint that overflows its target width, or that wastes
//! a trailing zero continuation byte, is rejected. Every value has exactly one
//! valid encoding.

use crate::error::Error;
use bytes::{Buf, BufMut};

/// The number of data-bearing bits in a byte.
const DATA_BITS_PER_BYTE: usize = 7;

/// The mask for the data-bearing bits in a byte.
const DATA_BITS_MASK: u8 = 0x7F;

/// The mask for the continuation bit in a byte.
const CONTINUATION_BIT_MASK: u8 = 0x80;

// Generates the write/read/size trio for one unsigned width.
macro_rules! impl_uint {
    ($type:ty, $write:ident, $read:ident, $size:ident) => {
        /// Encodes the integer as a varint.
        #[inline]
        pub fn $write(value: $type, buf: &mut impl BufMut) {
            // Fast path for sub-continuation values (common case for lengths).
            if value < CONTINUATION_BIT_MASK as $type {
                buf.put_u8(value as u8);
                return;
            }

            let mut val = value;
            while val >= CONTINUATION_BIT_MASK as $type {
                buf.put_u8((val as u8) | CONTINUATION_BIT_MASK);
                val >>= DATA_BITS_PER_BYTE;
            }
            buf.put_u8(val as u8);
        }

        /// Decodes a varint into the integer width.
        ///
        /// Returns an error if the buffer ends mid-varint, or if the varint is
        /// malformed (overflow or a trailing zero continuation byte).
        pub fn $read(buf: &mut impl Buf) -> Result<$type, Error> {
            const MAX_BITS: usize = <$type>::BITS as usize;
            let mut result: $type = 0;
            let mut bits_read = 0;

            loop {
                if !buf.has_remaining() {
                    return Err(Error::EndOfBuffer);
                }
                let byte = buf.get_u8();

                // A zero byte past the first carries no data and no
                // continuation, so the previous byte had no reason to point at
                // it. Rejecting it keeps encodings unique.
                if byte == 0 && bits_read > 0 {
                    return Err(Error::InvalidVarint(MAX_BITS / 8));
                }

                // On what must be the last byte, any set bit beyond the width
                // (the continuation bit included, it being the most
                // significant) is an overflow.
                let remaining_bits = MAX_BITS - bits_read;
                if remaining_bits <= DATA_BITS_PER_BYTE {
                    let relevant_bits = 8 - byte.leading_zeros() as usize;
                    if relevant_bits > remaining_bits {
                        return Err(Error::InvalidVarint(MAX_BITS / 8));
                    }
                }

                result |= ((byte & DATA_BITS_MASK) as $type) << bits_read;

                if byte & CONTINUATION_BIT_MASK == 0 {
                    return Ok(result);
                }

                bits_read += DATA_BITS_PER_BYTE;
            }
        }

        /// The number of bytes the varint encoding of the integer occupies.
        #[inline]
        pub fn $size(value: $type) -> usize {
            let data_bits = <$type>::BITS as usize - value.leading_zeros() as usize;
            usize::max(1, data_bits.div_ceil(DATA_BITS_PER_BYTE))
        }
    };
}

impl_uint!(u32, write_u32, read_u32, size_u32);
impl_uint!(u64, write_u64, read_u64, size_u64);

/// Maps a signed integer onto the unsigned line, interleaving negatives and
/// positives so small magnitudes of either sign encode short.
#[inline]
pub fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

/// Inverts [`zigzag`].
#[inline]
pub fn un_zigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

/// Encodes a signed 32-bit integer as a ZigZag varint.
#[inline]
pub fn write_i32(value: i32, buf: &mut impl BufMut) {
    write_u32(zigzag(value), buf);
}

/// Decodes a ZigZag varint into a signed 32-bit integer.
#[inline]
pub fn read_i32(buf: &mut impl Buf) -> Result<i32, Error> {
    read_u32(buf).map(un_zigzag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_end_of_buffer() {
        let mut buf = Bytes::from_static(&[]);
        assert!(matches!(read_u32(&mut buf), Err(Error::EndOfBuffer)));

        let mut buf = Bytes::from_static(&[0x80, 0x8F]);
        assert!(matches!(read_u32(&mut buf), Err(Error::EndOfBuffer)));

        let mut buf = Bytes::from_static(&[0xFF, 0x8F]);
        assert!(matches!(read_u64(&mut buf), Err(Error::EndOfBuffer)));
    }

    #[test]
    fn test_overflow() {
        let mut buf = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(read_u32(&mut buf).unwrap(), u32::MAX);

        let mut buf = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);
        assert!(matches!(read_u32(&mut buf), Err(Error::InvalidVarint(4))));

        let mut buf =
            Bytes::from_static(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x02]);
        assert!(matches!(read_u64(&mut buf), Err(Error::InvalidVarint(8))));
    }

    #[test]
    fn test_overcontinuation() {
        let mut buf = Bytes::from_static(&[0x80, 0x80, 0x80, 0x80, 0x80]);
        assert!(matches!(read_u32(&mut buf), Err(Error::InvalidVarint(4))));
    }

    #[test]
    fn test_zeroed_byte() {
        let mut buf = Bytes::from_static(&[0xFF, 0x00]);
        assert!(matches!(read_u64(&mut buf), Err(Error::InvalidVarint(8))));
    }

    #[test]
    fn test_conformity() {
        fn encoded(value: u64) -> Vec<u8> {
            let mut buf = Vec::new();
            write_u64(value, &mut buf);
            buf
        }

        assert_eq!(encoded(0), &[0x00][..]);
        assert_eq!(encoded(1), &[0x01][..]);
        assert_eq!(encoded(127), &[0x7F][..]);
        assert_eq!(encoded(128), &[0x80, 0x01][..]);
        assert_eq!(encoded(16383), &[0xFF, 0x7F][..]);
        assert_eq!(encoded(16384), &[0x80, 0x80, 0x01][..]);
        assert_eq!(encoded(2097151), &[0xFF, 0xFF, 0x7F][..]);
        assert_eq!(encoded(2097152), &[0x80, 0x80, 0x80, 0x01][..]);
        assert_eq!(
            encoded(u32::MAX as u64),
            &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F][..]
        );
        assert_eq!(
            encoded(u64::MAX),
            &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01][..]
        );
    }

    #[test]
    fn test_u32_round_trip() {
        const CASES: &[u32] = &[
            0,
            1,
            127,
            128,
            129,
            0xFF,
            0x100,
            0x3FFF,
            0x4000,
            0x1_FFFF,
            0xFF_FFFF,
            u32::MAX,
        ];

        for &value in CASES {
            let mut buf = Vec::new();
            write_u32(value, &mut buf);
            assert_eq!(buf.len(), size_u32(value));

            let mut slice = &buf[..];
            assert_eq!(read_u32(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_u64_round_trip() {
        const CASES: &[u64] = &[
            0,
            1,
            127,
            128,
            129,
            0x3FFF,
            0x4000,
            0x1_FFFF_FFFF,
            0xFF_FFFF_FFFF_FFFF,
            u32::MAX as u64,
            u32::MAX as u64 + 1,
            u64::MAX,
        ];

        for &value in CASES {
            let mut buf = Vec::new();
            write_u64(value, &mut buf);
            assert_eq!(buf.len(), size_u64(value));

            let mut slice = &buf[..];
            assert_eq!(read_u64(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_boundary_sizes() {
        // Values that require exactly N bytes.
        let boundaries: &[(u64, usize)] = &[
            (0, 1),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (2097151, 3),
            (2097152, 4),
            (268435455, 4),
            (268435456, 5),
            (34359738367, 5),
            (34359738368, 6),
            (u64::MAX, 10),
        ];

        for &(value, expected) in boundaries {
            assert_eq!(size_u64(value), expected, "size for {value}");
            let mut buf = Vec::new();
            write_u64(value, &mut buf);
            assert_eq!(buf.len(), expected, "encoding for {value}");
        }
    }

    #[test]
    fn test_all_u16_range() {
        // Exhaustively check the low range where the fast path and the loop
        // hand off.
        for value in 0..=u16::MAX as u32 {
            let mut buf = Vec::new();
            write_u32(value, &mut buf);
            assert_eq!(buf.len(), size_u32(value));

            let mut slice = &buf[..];
            assert_eq!(read_u32(&mut slice).unwrap(), value);
        }
    }

    #[test]
    fn test_zigzag_mapping() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(-2), 3);
        assert_eq!(zigzag(2), 4);
        assert_eq!(zigzag(i32::MAX), u32::MAX - 1);
        assert_eq!(zigzag(i32::MIN), u32::MAX);
    }

    #[test]
    fn test_i32_round_trip() {
        const CASES: &[i32] = &[
            0,
            1,
            -1,
            2,
            -2,
            63,
            64,
            -64,
            -65,
            127,
            -127,
            128,
            -128,
            129,
            -129,
            8191,
            8192,
            -8192,
            -8193,
            1 << 29,
            -(1 << 29),
            1 << 30,
            -(1 << 30),
            i32::MAX,
            i32::MIN,
        ];

        for &value in CASES {
            let mut buf = Vec::new();
            write_i32(value, &mut buf);

            let mut slice = &buf[..];
            assert_eq!(read_i32(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
            assert_eq!(un_zigzag(zigzag(value)), value);
        }
    }

    #[test]
    fn test_small_magnitudes_stay_short() {
        for value in -64..64i32 {
            let mut buf = Vec::new();
            write_i32(value, &mut buf);
            assert_eq!(buf.len(), 1, "value {value}");
        }
    }
}
