//! Host-object hooks and the default typed-view codec.
//!
//! # Overview
//!
//! The core format reserves one tag for values it refuses to interpret. A
//! caller-supplied hook takes over on both sides: the writing hook emits an
//! opaque payload through the encoder's low-level primitives, and the reading
//! hook consumes that payload and returns a reconstructed value, which the
//! decoder registers in its id map like any other composite.
//!
//! [`ViewHostCodec`] is the default hook pair: it round-trips typed views as
//! host objects, using a shared ordered constructor table, so that an
//! embedder can revive views under its own types instead of the core ones.

use crate::{
    decoder::Decoder,
    encoder::Encoder,
    error::Error,
    value::{ByteBuf, Value, View, ViewKind},
};

/// Encoder-side host-object hook.
pub trait WriteHostObject {
    /// Writes the opaque payload for `value`. The core has already emitted
    /// the host-object tag; the hook writes through the encoder's
    /// `write_uint32`/`write_uint64`/`write_double`/`write_raw_bytes`
    /// primitives. Refusing a value is returning an error, conventionally
    /// [`Error::data_clone`].
    fn write_host_object(&mut self, encoder: &mut Encoder, value: &Value) -> Result<(), Error>;
}

/// Decoder-side host-object hook.
pub trait ReadHostObject {
    /// Consumes the payload written by the matching [`WriteHostObject`] and
    /// returns the reconstructed value.
    fn read_host_object(&mut self, decoder: &mut Decoder<'_>) -> Result<Value, Error>;
}

/// The shared constructor table: the ten view kinds in subtag-table order.
/// Index 10 is the raw-byte-wrapper slot some embedders append for their own
/// byte class; it is accepted on read and revived as a plain byte view.
const VIEW_TABLE: [ViewKind; 10] = [
    ViewKind::Int8,
    ViewKind::Uint8,
    ViewKind::Uint8Clamped,
    ViewKind::Int16,
    ViewKind::Uint16,
    ViewKind::Int32,
    ViewKind::Uint32,
    ViewKind::Float32,
    ViewKind::Float64,
    ViewKind::DataView,
];

/// The raw-byte-wrapper constructor index.
const RAW_BYTES_INDEX: u32 = VIEW_TABLE.len() as u32;

/// Default host codec: typed views as `varint constructor index, varint byte
/// length, raw bytes`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ViewHostCodec;

impl WriteHostObject for ViewHostCodec {
    fn write_host_object(&mut self, encoder: &mut Encoder, value: &Value) -> Result<(), Error> {
        let Value::View(view) = value else {
            return Err(Error::data_clone(value));
        };
        let Some(index) = VIEW_TABLE.iter().position(|&kind| kind == view.kind()) else {
            return Err(Error::data_clone(value));
        };

        let data = view.buffer().borrow();
        let start = view.byte_offset() as usize;
        let end = start + view.byte_length() as usize;
        let Some(window) = data.get(start..end) else {
            // The view no longer fits its (mutable) buffer.
            return Err(Error::data_clone(value));
        };

        encoder.write_uint32(index as u32);
        encoder.write_uint32(view.byte_length());
        encoder.write_raw_bytes(window);
        Ok(())
    }
}

impl ReadHostObject for ViewHostCodec {
    fn read_host_object(&mut self, decoder: &mut Decoder<'_>) -> Result<Value, Error> {
        let index = decoder.read_uint32()?;
        let byte_length = decoder.read_uint32()?;

        let kind = if index == RAW_BYTES_INDEX {
            ViewKind::Uint8
        } else {
            *VIEW_TABLE
                .get(index as usize)
                .ok_or(Error::InvalidView)?
        };
        if byte_length as usize % kind.element_size() != 0 {
            return Err(Error::InvalidView);
        }

        // Materialize an aligned copy regardless of where the payload sits in
        // the input, and build the view over it from offset zero.
        let bytes = decoder.read_raw_bytes(byte_length as usize)?;
        let buffer = ByteBuf::new(bytes.to_vec());
        Ok(Value::view(View::new(kind, buffer, 0, byte_length)))
    }
}
