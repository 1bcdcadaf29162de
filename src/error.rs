//! Error type shared by the encoder, the decoder, and host-object hooks.

use crate::value::Value;
use thiserror::Error;

/// Error surfaced while encoding or decoding a value graph.
///
/// Two families are observable: clone errors (the encoder cannot represent a
/// value) and deserialization errors (the decoder detected a malformed or
/// truncated stream). Setup mistakes around transfer registration use their
/// own variant. No operation retries internally; an encoder or decoder that
/// returned an error must be discarded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ---------- Encode ----------
    /// The value cannot be represented in the wire format.
    #[error("{0} could not be cloned")]
    DataClone(String),
    /// A host object was encountered but no host-object hook is installed.
    #[error("Unknown host object type: {0}")]
    UnknownHostObject(String),

    // ---------- Transfer setup ----------
    /// The byte buffer (encoder) or transfer id (decoder) is already
    /// registered.
    #[error("byte buffer already registered for transfer")]
    AlreadyTransferred,

    // ---------- Decode ----------
    /// The input ended before the value was complete.
    #[error("end of buffer")]
    EndOfBuffer,
    /// A varint was malformed or overflowed its target width of `{0}` bytes.
    #[error("invalid varint of size {0}")]
    InvalidVarint(usize),
    /// The header declared a wire format version newer than this codec.
    #[error("unsupported wire format version {0}")]
    UnsupportedVersion(u32),
    /// A tag byte outside the alphabet, at a version with no host-object
    /// fallback.
    #[error("unknown tag 0x{0:02x}")]
    UnknownTag(u8),
    /// A recognized tag this codec does not materialize (wasm payloads).
    #[error("unsupported tag 0x{0:02x}")]
    UnsupportedTag(u8),
    /// A string payload was not valid for its declared encoding.
    #[error("invalid {0} string payload")]
    InvalidString(&'static str),
    /// A property key decoded to something that cannot name a property.
    #[error("invalid object key")]
    InvalidKey,
    /// A composite body's trailing declared count disagrees with what was
    /// read.
    #[error("count mismatch in {0}: declared {1}, read {2}")]
    CountMismatch(&'static str, u32, u32),
    /// A back-reference pointed at an id that has not been assigned yet.
    #[error("invalid back-reference id {0}")]
    InvalidReference(u32),
    /// A transferred byte buffer id with no registered handle.
    #[error("no transferred byte buffer with id {0}")]
    UnknownTransferId(u32),
    /// A typed view with an unknown subtag, or offset/length outside its
    /// buffer or off its element grid.
    #[error("invalid typed view")]
    InvalidView,
    /// Regular expression flag bits outside the defined set.
    #[error("invalid regular expression flags")]
    InvalidRegExpFlags,
    /// A host-object payload was encountered but no host-object hook is
    /// installed to read it.
    #[error("no host object hook installed")]
    MissingHostCodec,
}

impl Error {
    /// Clone-failure error carrying the stringified form of `value`.
    ///
    /// Host-object hooks that refuse a value should fail the same way the
    /// core does.
    pub fn data_clone(value: &Value) -> Self {
        Self::DataClone(value.to_string())
    }
}
