//! Serialize value graphs in the structured clone wire format.
//!
//! # Overview
//!
//! A codec for the tagged binary format script embedders use to clone values
//! across contexts (wire format version 13). The encoder walks an arbitrary
//! value graph — preserving object identity, so cycles and shared subtrees
//! survive — and emits a compact, self-describing byte stream with varint
//! integers, host-byte-order doubles, and aligned two-byte strings. The
//! decoder parses the stream back, registering every composite before its
//! contents so back-references always resolve.
//!
//! # Supported Values
//!
//! - Primitives: undefined, null, booleans, 32-bit integers, doubles
//! - Strings (latin-1 and UTF-16 payloads on the wire)
//! - Records, dense and sparse arrays (with holes and extra properties)
//! - Dates, regular expressions, key/value maps, sets
//! - Byte buffers (inline, or by transfer id), typed views over them
//! - Boxed primitives, and opaque host objects via caller-supplied hooks
//!
//! # Example
//!
//! ```
//! use structured_clone::{decode, encode, Record, Value};
//!
//! let mut record = Record::new();
//! record.insert("foo", "bar");
//!
//! let bytes = encode(&Value::record(record)).unwrap();
//! assert_eq!(
//!     bytes.as_ref(),
//!     &[0xFF, 0x0D, 0x6F, 0x22, 0x03, b'f', b'o', b'o', 0x22, 0x03, b'b', b'a', b'r', 0x7B, 0x01]
//! );
//!
//! let decoded = decode(&bytes).unwrap();
//! let record = decoded.as_record().unwrap().borrow();
//! assert_eq!(record.get("foo").and_then(Value::as_str), Some("bar"));
//! ```
//!
//! For identity continuity across several values, or for byte-buffer
//! transfers and custom host objects, drive [`Encoder`] and [`Decoder`]
//! directly; [`encode`] and [`decode`] each wrap a fresh instance with the
//! default typed-view host codec installed.

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod host;
pub mod tag;
pub mod value;
pub mod varint;

use bytes::Bytes;

// Re-export main types and traits
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::Error;
pub use host::{ReadHostObject, ViewHostCodec, WriteHostObject};
pub use tag::Tag;
pub use value::{
    Array, ByteBuf, Date, HostObject, Record, RegExp, RegExpFlags, Value, ValueMap, ValueSet,
    View, ViewKind, Wrapper,
};

/// The wire format version written by [`Encoder::write_header`]. Streams up
/// to and including this version are readable.
pub const WIRE_FORMAT_VERSION: u32 = 13;

/// Serializes one value with a fresh default encoder: header, value, bytes.
pub fn encode(value: &Value) -> Result<Bytes, Error> {
    let mut encoder = Encoder::with_host_codec(Box::new(ViewHostCodec));
    encoder.set_treat_views_as_host_objects(true);
    encoder.write_header();
    encoder.write_value(value)?;
    Ok(encoder.release())
}

/// Deserializes the first value of `input` with a fresh default decoder.
///
/// Trailing bytes are not an error; streams may carry several values, and
/// this façade hands back the first.
pub fn decode(input: &[u8]) -> Result<Value, Error> {
    let mut decoder = Decoder::with_host_codec(input, Box::new(ViewHostCodec));
    decoder.read_header()?;
    decoder.read_value()
}
