//! Wire-format decoder.
//!
//! # Overview
//!
//! [`Decoder`] is a recursive-descent automaton over a borrowed byte slice,
//! keyed on the tag alphabet. Composites are registered in the id map before
//! their contents are read, so a back-reference to an enclosing container
//! resolves to the container being built; that is what makes cycles
//! decodable.
//!
//! The decoder never mutates its input. Byte buffer payloads are copied into
//! fresh allocations; transferred buffers resolve to the handles registered
//! by the caller.

use crate::{
    error::Error,
    host::ReadHostObject,
    tag::Tag,
    value::{
        canonical_index, number_to_string, Array, ByteBuf, Record, RegExpFlags, Value, ValueMap,
        ValueSet, View, ViewKind, Wrapper,
    },
    varint, WIRE_FORMAT_VERSION,
};
use std::{cell::RefCell, rc::Rc};

/// A decoded property key: an array index or a plain name.
enum PropertyKey {
    Index(u32),
    Name(Rc<str>),
}

/// Reconstructs value graphs from the wire format.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    version: u32,
    /// Decoded composites, indexed by id in begin order.
    objects: Vec<Value>,
    transfers: Vec<(u32, ByteBuf)>,
    host: Option<Box<dyn ReadHostObject>>,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            version: 0,
            objects: Vec::new(),
            transfers: Vec::new(),
            host: None,
        }
    }

    /// A decoder with a host-object hook installed.
    pub fn with_host_codec(input: &'a [u8], host: Box<dyn ReadHostObject>) -> Self {
        Self {
            host: Some(host),
            ..Self::new(input)
        }
    }

    /// Consumes the version header if one is present.
    ///
    /// Without a header the position stays at zero and the version defaults
    /// to 0 (legacy). Fails on versions newer than this codec writes.
    pub fn read_header(&mut self) -> Result<u32, Error> {
        if self.peek_byte() == Some(Tag::Version as u8) {
            self.read_tag_byte()?;
            let version = self.read_uint32()?;
            if version > WIRE_FORMAT_VERSION {
                return Err(Error::UnsupportedVersion(version));
            }
            self.version = version;
        }
        Ok(self.version)
    }

    /// The version consumed by [`Decoder::read_header`], or 0.
    pub fn wire_format_version(&self) -> u32 {
        self.version
    }

    /// Registers a caller-supplied handle for a transfer id, so transferred
    /// byte buffers resolve to it instead of a copied payload.
    ///
    /// Fails if the id is already registered.
    pub fn transfer_byte_buffer(&mut self, transfer_id: u32, buffer: &ByteBuf) -> Result<(), Error> {
        if self.transfers.iter().any(|(id, _)| *id == transfer_id) {
            return Err(Error::AlreadyTransferred);
        }
        self.transfers.push((transfer_id, buffer.clone()));
        Ok(())
    }

    /// Consumes one encoded value.
    pub fn read_value(&mut self) -> Result<Value, Error> {
        self.read_object()
    }

    // ---------- Primitives for host-object hooks ----------

    pub fn read_uint32(&mut self) -> Result<u32, Error> {
        let mut slice = &self.input[self.pos..];
        let value = varint::read_u32(&mut slice)?;
        self.pos = self.input.len() - slice.len();
        Ok(value)
    }

    /// Reads a 64-bit varint, returned as its two 32-bit halves.
    pub fn read_uint64(&mut self) -> Result<(u32, u32), Error> {
        let mut slice = &self.input[self.pos..];
        let value = varint::read_u64(&mut slice)?;
        self.pos = self.input.len() - slice.len();
        Ok(((value >> 32) as u32, value as u32))
    }

    /// Reads eight raw bytes in host byte order.
    pub fn read_double(&mut self) -> Result<f64, Error> {
        let bytes = self.read_raw_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_ne_bytes(raw))
    }

    pub fn read_raw_bytes(&mut self, len: usize) -> Result<&'a [u8], Error> {
        self.require(len)?;
        let bytes = &self.input[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    // ---------- Cursor ----------

    fn remaining(&self) -> usize {
        self.input.len() - self.pos
    }

    fn require(&self, len: usize) -> Result<(), Error> {
        if self.remaining() < len {
            return Err(Error::EndOfBuffer);
        }
        Ok(())
    }

    /// The next non-padding byte, without consuming anything.
    fn peek_byte(&self) -> Option<u8> {
        self.input[self.pos..]
            .iter()
            .copied()
            .find(|&byte| byte != Tag::Padding as u8)
    }

    /// Consumes through any padding and returns the next byte.
    fn read_tag_byte(&mut self) -> Result<u8, Error> {
        loop {
            self.require(1)?;
            let byte = self.input[self.pos];
            self.pos += 1;
            if byte != Tag::Padding as u8 {
                return Ok(byte);
            }
        }
    }

    fn read_int32(&mut self) -> Result<i32, Error> {
        let mut slice = &self.input[self.pos..];
        let value = varint::read_i32(&mut slice)?;
        self.pos = self.input.len() - slice.len();
        Ok(value)
    }

    // ---------- Dispatch ----------

    fn read_object(&mut self) -> Result<Value, Error> {
        let value = self.read_object_internal()?;
        // A typed view tag consumes the byte buffer decoded just before it.
        if let Value::Buffer(buffer) = &value {
            if self.peek_byte() == Some(Tag::View as u8) {
                self.read_tag_byte()?;
                return self.read_view(buffer.clone());
            }
        }
        Ok(value)
    }

    fn read_object_internal(&mut self) -> Result<Value, Error> {
        loop {
            let byte = self.read_tag_byte()?;
            let Some(tag) = Tag::from_u8(byte) else {
                return self.read_unknown(byte);
            };
            return match tag {
                // Legacy sanity marker: read the count, ignore it, continue.
                Tag::VerifyObjectCount => {
                    self.read_uint32()?;
                    continue;
                }
                Tag::Undefined => Ok(Value::Undefined),
                Tag::Null => Ok(Value::Null),
                Tag::True => Ok(Value::Bool(true)),
                Tag::False => Ok(Value::Bool(false)),
                Tag::Int32 => Ok(Value::Int32(self.read_int32()?)),
                Tag::Uint32 => {
                    let value = self.read_uint32()?;
                    Ok(Value::integer(i64::from(value)))
                }
                Tag::Double => Ok(Value::Double(self.read_double()?)),
                Tag::Utf8String => Ok(Value::String(self.read_utf8_string()?)),
                Tag::OneByteString => Ok(Value::String(self.read_one_byte_string()?)),
                Tag::TwoByteString => Ok(Value::String(self.read_two_byte_string()?)),
                Tag::ObjectReference => {
                    let id = self.read_uint32()?;
                    self.objects
                        .get(id as usize)
                        .cloned()
                        .ok_or(Error::InvalidReference(id))
                }
                Tag::BeginRecord => self.read_record(),
                Tag::BeginSparseArray => self.read_sparse_array(),
                Tag::BeginDenseArray => self.read_dense_array(),
                Tag::Date => {
                    let epoch_millis = self.read_double()?;
                    Ok(self.register(Value::date(epoch_millis)))
                }
                Tag::TrueObject => Ok(self.register(Value::boolean_object(true))),
                Tag::FalseObject => Ok(self.register(Value::boolean_object(false))),
                Tag::NumberObject => {
                    let number = self.read_double()?;
                    Ok(self.register(Value::number_object(number)))
                }
                Tag::StringObject => {
                    let string = self.read_string()?;
                    Ok(self.register(Value::Wrapper(Rc::new(Wrapper::String(string)))))
                }
                Tag::RegExp => self.read_regexp(),
                Tag::BeginMap => self.read_map(),
                Tag::BeginSet => self.read_set(),
                Tag::ByteBuffer => self.read_byte_buffer(),
                Tag::ByteBufferTransfer | Tag::SharedByteBuffer => {
                    self.read_transferred_byte_buffer()
                }
                Tag::HostObject => self.read_host_object(),
                Tag::WasmModule | Tag::WasmTransfer => Err(Error::UnsupportedTag(byte)),
                // Everything else (end tags, holes, view tags, a stray
                // version marker) never starts a value.
                _ => self.read_unknown(byte),
            };
        }
    }

    /// Streams older than the current format reserve unassigned tag bytes for
    /// host objects: rewind so the hook sees the byte itself.
    fn read_unknown(&mut self, byte: u8) -> Result<Value, Error> {
        if self.version < WIRE_FORMAT_VERSION {
            self.pos -= 1;
            return self.read_host_object();
        }
        Err(Error::UnknownTag(byte))
    }

    fn register(&mut self, value: Value) -> Value {
        self.objects.push(value.clone());
        value
    }

    // ---------- Strings ----------

    fn read_utf8_string(&mut self) -> Result<Rc<str>, Error> {
        let byte_length = self.read_uint32()? as usize;
        let bytes = self.read_raw_bytes(byte_length)?;
        std::str::from_utf8(bytes)
            .map(Rc::from)
            .map_err(|_| Error::InvalidString("utf-8"))
    }

    fn read_one_byte_string(&mut self) -> Result<Rc<str>, Error> {
        let byte_length = self.read_uint32()? as usize;
        let bytes = self.read_raw_bytes(byte_length)?;
        Ok(bytes.iter().map(|&b| char::from(b)).collect::<String>().into())
    }

    fn read_two_byte_string(&mut self) -> Result<Rc<str>, Error> {
        let byte_length = self.read_uint32()? as usize;
        if byte_length % 2 != 0 {
            return Err(Error::InvalidString("utf-16"));
        }
        let bytes = self.read_raw_bytes(byte_length)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units)
            .map(Rc::from)
            .map_err(|_| Error::InvalidString("utf-16"))
    }

    /// A nested string value, as carried inside RegExp and boxed strings.
    /// Streams older than version 12 spelled these with the raw UTF-8 tag.
    fn read_string(&mut self) -> Result<Rc<str>, Error> {
        if self.version < 12 {
            let byte = self.read_tag_byte()?;
            if byte != Tag::Utf8String as u8 {
                return Err(Error::UnknownTag(byte));
            }
            return self.read_utf8_string();
        }
        match self.read_object()? {
            Value::String(string) => Ok(string),
            _ => Err(Error::InvalidString("nested")),
        }
    }

    // ---------- Composites ----------

    fn read_property_key(&mut self) -> Result<PropertyKey, Error> {
        match self.read_object()? {
            Value::String(string) => Ok(match canonical_index(&string) {
                Some(index) => PropertyKey::Index(index),
                None => PropertyKey::Name(string),
            }),
            Value::Int32(number) => {
                if number >= 0 {
                    Ok(PropertyKey::Index(number as u32))
                } else {
                    Ok(PropertyKey::Name(format!("{number}").into()))
                }
            }
            Value::Double(number) => {
                if number.is_finite()
                    && number.fract() == 0.0
                    && number >= 0.0
                    && number < u32::MAX as f64
                {
                    Ok(PropertyKey::Index(number as u32))
                } else {
                    Ok(PropertyKey::Name(number_to_string(number).into()))
                }
            }
            _ => Err(Error::InvalidKey),
        }
    }

    fn read_record(&mut self) -> Result<Value, Error> {
        let record = Rc::new(RefCell::new(Record::new()));
        // Register before the body, so self-references resolve.
        self.objects.push(Value::Record(record.clone()));

        let mut read: u32 = 0;
        while self.peek_byte() != Some(Tag::EndRecord as u8) {
            let key = self.read_property_key()?;
            let entry = self.read_object()?;
            let key = match key {
                PropertyKey::Index(index) => format!("{index}").into(),
                PropertyKey::Name(name) => name,
            };
            record.borrow_mut().insert(key, entry);
            read += 1;
        }
        self.read_tag_byte()?;
        let declared = self.read_uint32()?;
        if declared != read {
            return Err(Error::CountMismatch("record", declared, read));
        }
        Ok(Value::Record(record))
    }

    fn read_dense_array(&mut self) -> Result<Value, Error> {
        let length = self.read_uint32()?;
        // Each element takes at least one byte; a length past the input is a
        // lie and would only bloat the allocation.
        if length as usize > self.remaining() {
            return Err(Error::EndOfBuffer);
        }

        let array = Rc::new(RefCell::new(Array::dense_with_holes(vec![
            None;
            length as usize
        ])));
        self.objects.push(Value::Array(array.clone()));

        for index in 0..length {
            if self.peek_byte() == Some(Tag::TheHole as u8) {
                self.read_tag_byte()?;
                continue;
            }
            let element = self.read_object()?;
            // Streams older than version 11 wrote holes as Undefined.
            if self.version < 11 && matches!(element, Value::Undefined) {
                continue;
            }
            array.borrow_mut().set_element(index, element);
        }

        let mut read: u32 = 0;
        while self.peek_byte() != Some(Tag::EndDenseArray as u8) {
            let key = self.read_property_key()?;
            let entry = self.read_object()?;
            match key {
                PropertyKey::Index(index) => array.borrow_mut().set_element(index, entry),
                PropertyKey::Name(name) => array.borrow_mut().insert_property(name, entry),
            }
            read += 1;
        }
        self.read_tag_byte()?;
        let declared = self.read_uint32()?;
        if declared != read {
            return Err(Error::CountMismatch("dense array", declared, read));
        }
        let declared_length = self.read_uint32()?;
        if declared_length != length {
            return Err(Error::CountMismatch(
                "dense array length",
                declared_length,
                length,
            ));
        }
        Ok(Value::Array(array))
    }

    fn read_sparse_array(&mut self) -> Result<Value, Error> {
        let length = self.read_uint32()?;
        let array = Rc::new(RefCell::new(Array::sparse(length)));
        self.objects.push(Value::Array(array.clone()));

        let mut read: u32 = 0;
        while self.peek_byte() != Some(Tag::EndSparseArray as u8) {
            let key = self.read_property_key()?;
            let entry = self.read_object()?;
            match key {
                PropertyKey::Index(index) => array.borrow_mut().set_element(index, entry),
                PropertyKey::Name(name) => array.borrow_mut().insert_property(name, entry),
            }
            read += 1;
        }
        self.read_tag_byte()?;
        let declared = self.read_uint32()?;
        if declared != read {
            return Err(Error::CountMismatch("sparse array", declared, read));
        }
        let declared_length = self.read_uint32()?;
        if declared_length != length {
            return Err(Error::CountMismatch(
                "sparse array length",
                declared_length,
                length,
            ));
        }
        Ok(Value::Array(array))
    }

    fn read_regexp(&mut self) -> Result<Value, Error> {
        let source = self.read_string()?;
        let raw_flags = self.read_uint32()?;
        let flags = RegExpFlags::from_bits(raw_flags).ok_or(Error::InvalidRegExpFlags)?;
        Ok(self.register(Value::regexp(source, flags)))
    }

    fn read_map(&mut self) -> Result<Value, Error> {
        let map = Rc::new(RefCell::new(ValueMap::new()));
        self.objects.push(Value::Map(map.clone()));

        let mut read: u32 = 0;
        while self.peek_byte() != Some(Tag::EndMap as u8) {
            let key = self.read_object()?;
            let entry = self.read_object()?;
            map.borrow_mut().insert(key, entry);
            read += 2;
        }
        self.read_tag_byte()?;
        let declared = self.read_uint32()?;
        if declared != read {
            return Err(Error::CountMismatch("map", declared, read));
        }
        Ok(Value::Map(map))
    }

    fn read_set(&mut self) -> Result<Value, Error> {
        let set = Rc::new(RefCell::new(ValueSet::new()));
        self.objects.push(Value::Set(set.clone()));

        let mut read: u32 = 0;
        while self.peek_byte() != Some(Tag::EndSet as u8) {
            let entry = self.read_object()?;
            set.borrow_mut().insert(entry);
            read += 1;
        }
        self.read_tag_byte()?;
        let declared = self.read_uint32()?;
        if declared != read {
            return Err(Error::CountMismatch("set", declared, read));
        }
        Ok(Value::Set(set))
    }

    fn read_byte_buffer(&mut self) -> Result<Value, Error> {
        let byte_length = self.read_uint32()? as usize;
        let bytes = self.read_raw_bytes(byte_length)?;
        Ok(self.register(Value::Buffer(ByteBuf::new(bytes.to_vec()))))
    }

    fn read_transferred_byte_buffer(&mut self) -> Result<Value, Error> {
        let id = self.read_uint32()?;
        let handle = self
            .transfers
            .iter()
            .find(|(registered, _)| *registered == id)
            .map(|(_, handle)| handle.clone())
            .ok_or(Error::UnknownTransferId(id))?;
        Ok(self.register(Value::Buffer(handle)))
    }

    fn read_view(&mut self, buffer: ByteBuf) -> Result<Value, Error> {
        let subtag = self.read_uint32()?;
        let byte_offset = self.read_uint32()?;
        let byte_length = self.read_uint32()?;

        let kind = u8::try_from(subtag)
            .ok()
            .and_then(ViewKind::from_subtag)
            .ok_or(Error::InvalidView)?;
        if u64::from(byte_offset) + u64::from(byte_length) > buffer.len() as u64 {
            return Err(Error::InvalidView);
        }
        let element_size = kind.element_size() as u32;
        if byte_offset % element_size != 0 || byte_length % element_size != 0 {
            return Err(Error::InvalidView);
        }

        // The view gets its own id, assigned after its buffer's.
        Ok(self.register(Value::view(View::new(kind, buffer, byte_offset, byte_length))))
    }

    fn read_host_object(&mut self) -> Result<Value, Error> {
        let Some(mut host) = self.host.take() else {
            return Err(Error::MissingHostCodec);
        };
        let result = host.read_host_object(self);
        self.host = Some(host);
        Ok(self.register(result?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_versions() {
        let mut decoder = Decoder::new(&[0xFF, 0x0D, b'0']);
        assert_eq!(decoder.read_header().unwrap(), 13);
        assert_eq!(decoder.wire_format_version(), 13);
        assert!(matches!(decoder.read_value().unwrap(), Value::Null));
    }

    #[test]
    fn test_headerless_stream_is_legacy() {
        let mut decoder = Decoder::new(&[b'0']);
        assert_eq!(decoder.read_header().unwrap(), 0);
        assert!(matches!(decoder.read_value().unwrap(), Value::Null));
    }

    #[test]
    fn test_future_version_is_rejected() {
        let mut decoder = Decoder::new(&[0xFF, 0x0E]);
        assert_eq!(decoder.read_header(), Err(Error::UnsupportedVersion(14)));
    }

    #[test]
    fn test_padding_is_skipped() {
        let mut decoder = Decoder::new(&[0x00, 0x00, 0xFF, 0x0D, 0x00, b'T']);
        assert_eq!(decoder.read_header().unwrap(), 13);
        assert_eq!(decoder.read_value().unwrap().as_bool(), Some(true));
    }

    #[test]
    fn test_verify_object_count_is_ignored() {
        let mut decoder = Decoder::new(&[0xFF, 0x0D, b'?', 0x20, b'I', 0x54]);
        decoder.read_header().unwrap();
        assert_eq!(decoder.read_value().unwrap().as_i32(), Some(42));
    }

    #[test]
    fn test_unknown_tag_at_current_version() {
        let mut decoder = Decoder::new(&[0xFF, 0x0D, 0x07]);
        decoder.read_header().unwrap();
        assert_eq!(decoder.read_value().unwrap_err(), Error::UnknownTag(0x07));
    }

    #[test]
    fn test_truncation() {
        let mut decoder = Decoder::new(&[0xFF, 0x0D, b'"', 0x05, b'a']);
        decoder.read_header().unwrap();
        assert_eq!(decoder.read_value().unwrap_err(), Error::EndOfBuffer);
    }

    #[test]
    fn test_record_count_mismatch() {
        // {foo: "bar"} with a declared count of 2.
        let mut bytes = vec![0xFF, 0x0D, b'o'];
        bytes.extend_from_slice(&[b'"', 0x03, b'f', b'o', b'o']);
        bytes.extend_from_slice(&[b'"', 0x03, b'b', b'a', b'r']);
        bytes.extend_from_slice(&[b'{', 0x02]);
        let mut decoder = Decoder::new(&bytes);
        decoder.read_header().unwrap();
        assert_eq!(
            decoder.read_value().unwrap_err(),
            Error::CountMismatch("record", 2, 1)
        );
    }

    #[test]
    fn test_missing_transfer_id() {
        let mut decoder = Decoder::new(&[0xFF, 0x0D, b't', 0x00]);
        decoder.read_header().unwrap();
        assert_eq!(decoder.read_value().unwrap_err(), Error::UnknownTransferId(0));
    }

    #[test]
    fn test_dense_array_length_overrun() {
        let mut decoder = Decoder::new(&[0xFF, 0x0D, b'A', 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        decoder.read_header().unwrap();
        assert_eq!(decoder.read_value().unwrap_err(), Error::EndOfBuffer);
    }

    #[test]
    fn test_one_byte_string_is_latin1() {
        let mut decoder = Decoder::new(&[0xFF, 0x0D, b'"', 0x01, 0xE9]);
        decoder.read_header().unwrap();
        assert_eq!(decoder.read_value().unwrap().as_str(), Some("é"));
    }

    #[test]
    fn test_numeric_record_keys_decode_to_names() {
        // {0: "a"} written with an integer key.
        let mut bytes = vec![0xFF, 0x0D, b'o', b'I', 0x00];
        bytes.extend_from_slice(&[b'"', 0x01, b'a']);
        bytes.extend_from_slice(&[b'{', 0x01]);
        let mut decoder = Decoder::new(&bytes);
        decoder.read_header().unwrap();
        let value = decoder.read_value().unwrap();
        let record = value.as_record().unwrap().borrow();
        assert_eq!(record.get("0").and_then(Value::as_str), Some("a"));
    }
}
