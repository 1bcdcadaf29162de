//! Wire-format encoder.
//!
//! # Overview
//!
//! [`Encoder`] walks a value graph and emits the tagged byte stream. Every
//! composite is written exactly once: the first visit assigns it the next id
//! and emits its body, later visits emit a back-reference to that id. This is
//! what keeps cycles and shared subtrees intact across the wire.
//!
//! One encoder instance may serialize several values in a row; the identity
//! map persists, so a composite shared between calls is a back-reference the
//! second time. [`Encoder::release`] hands back everything accumulated.

use crate::{
    error::Error,
    host::WriteHostObject,
    tag::Tag,
    value::{canonical_index, Array, ByteBuf, Record, Value, ValueMap, ValueSet, View, Wrapper},
    varint, WIRE_FORMAT_VERSION,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Serializes value graphs into the wire format.
pub struct Encoder {
    out: BytesMut,
    /// Composite identity (allocation address) to assigned id.
    ids: HashMap<usize, u32>,
    /// Clones of registered composites, so their addresses stay live and
    /// unique for the lifetime of the map.
    retained: Vec<Value>,
    transfers: Vec<(u32, ByteBuf)>,
    treat_views_as_host_objects: bool,
    host: Option<Box<dyn WriteHostObject>>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            out: BytesMut::new(),
            ids: HashMap::new(),
            retained: Vec::new(),
            transfers: Vec::new(),
            treat_views_as_host_objects: false,
            host: None,
        }
    }

    /// An encoder with a host-object hook installed.
    pub fn with_host_codec(host: Box<dyn WriteHostObject>) -> Self {
        Self {
            host: Some(host),
            ..Self::new()
        }
    }

    /// Emits the stream header: the version tag followed by the wire format
    /// version. Call exactly once, before any value.
    pub fn write_header(&mut self) {
        self.write_tag(Tag::Version);
        self.write_uint32(WIRE_FORMAT_VERSION);
    }

    /// When set, typed views dispatch to the host-object hook instead of the
    /// core view encoding.
    pub fn set_treat_views_as_host_objects(&mut self, flag: bool) {
        self.treat_views_as_host_objects = flag;
    }

    /// Registers `buffer` under a transfer id: its payload will be replaced
    /// by the id on the wire, and the decoder resolves the id back to a
    /// handle registered on its side.
    ///
    /// Fails if the handle or the id is already registered.
    pub fn transfer_byte_buffer(&mut self, transfer_id: u32, buffer: &ByteBuf) -> Result<(), Error> {
        if self
            .transfers
            .iter()
            .any(|(id, handle)| *id == transfer_id || handle.ptr_eq(buffer))
        {
            return Err(Error::AlreadyTransferred);
        }
        self.transfers.push((transfer_id, buffer.clone()));
        Ok(())
    }

    /// Emits one value.
    pub fn write_value(&mut self, value: &Value) -> Result<(), Error> {
        match value {
            Value::Undefined => {
                self.write_tag(Tag::Undefined);
                Ok(())
            }
            Value::Null => {
                self.write_tag(Tag::Null);
                Ok(())
            }
            Value::Bool(true) => {
                self.write_tag(Tag::True);
                Ok(())
            }
            Value::Bool(false) => {
                self.write_tag(Tag::False);
                Ok(())
            }
            Value::Int32(number) => {
                self.write_tag(Tag::Int32);
                varint::write_i32(*number, &mut self.out);
                Ok(())
            }
            Value::Double(number) => {
                self.write_tag(Tag::Double);
                self.write_double(*number);
                Ok(())
            }
            Value::String(string) => self.write_string(string),
            _ => self.write_composite(value),
        }
    }

    /// Consumes the encoder and returns the accumulated byte stream.
    pub fn release(self) -> Bytes {
        self.out.freeze()
    }

    // ---------- Primitives for host-object hooks ----------

    pub fn write_uint32(&mut self, value: u32) {
        varint::write_u32(value, &mut self.out);
    }

    /// Writes a 64-bit varint from two 32-bit halves.
    pub fn write_uint64(&mut self, hi: u32, lo: u32) {
        varint::write_u64((u64::from(hi) << 32) | u64::from(lo), &mut self.out);
    }

    /// Writes eight raw bytes in host byte order.
    pub fn write_double(&mut self, value: f64) {
        self.out.put_f64_ne(value);
    }

    pub fn write_raw_bytes(&mut self, bytes: &[u8]) {
        self.out.put_slice(bytes);
    }

    // ---------- Internals ----------

    fn write_tag(&mut self, tag: Tag) {
        self.out.put_u8(tag as u8);
    }

    fn write_string(&mut self, string: &str) -> Result<(), Error> {
        if string.chars().all(|c| u32::from(c) < 0x100) {
            let length = to_u32(string.chars().count())?;
            self.write_tag(Tag::OneByteString);
            self.write_uint32(length);
            if string.is_ascii() {
                self.out.put_slice(string.as_bytes());
            } else {
                for c in string.chars() {
                    self.out.put_u8(c as u8);
                }
            }
            return Ok(());
        }

        let units = string.encode_utf16().count();
        let byte_length = to_u32(units * 2)?;
        // Two-byte payloads start on an even offset, so an aligned reader can
        // walk the code units in place.
        if (self.out.len() + 1 + varint::size_u32(byte_length)) & 1 == 1 {
            self.write_tag(Tag::Padding);
        }
        self.write_tag(Tag::TwoByteString);
        self.write_uint32(byte_length);
        for unit in string.encode_utf16() {
            self.out.put_u16_le(unit);
        }
        Ok(())
    }

    fn write_composite(&mut self, value: &Value) -> Result<(), Error> {
        let Some(identity) = value.identity() else {
            // Opaque callables (and anything else without identity).
            return Err(Error::data_clone(value));
        };

        if let Some(&id) = self.ids.get(&identity) {
            self.write_tag(Tag::ObjectReference);
            self.write_uint32(id);
            return Ok(());
        }

        // A typed view rides behind its buffer: the buffer is emitted first
        // (possibly as a back-reference) so the decoder has it on hand when
        // the view tag arrives.
        if let Value::View(view) = value {
            if !self.treat_views_as_host_objects {
                self.write_value(&Value::Buffer(view.buffer().clone()))?;
            }
        }

        let id = self.ids.len() as u32;
        self.ids.insert(identity, id);
        self.retained.push(value.clone());

        match value {
            Value::Record(cell) => {
                let record = cell.borrow();
                self.write_record(&record)
            }
            Value::Array(cell) => {
                let array = cell.borrow();
                if array.is_dense() {
                    self.write_dense_array(&array)
                } else {
                    self.write_sparse_array(&array)
                }
            }
            Value::Date(date) => {
                self.write_tag(Tag::Date);
                self.write_double(date.epoch_millis());
                Ok(())
            }
            Value::RegExp(regexp) => {
                self.write_tag(Tag::RegExp);
                self.write_string(regexp.source())?;
                self.write_uint32(regexp.flags().bits());
                Ok(())
            }
            Value::Map(cell) => {
                let map = cell.borrow();
                self.write_map(&map)
            }
            Value::Set(cell) => {
                let set = cell.borrow();
                self.write_set(&set)
            }
            Value::Buffer(buffer) => self.write_byte_buffer(value, buffer),
            Value::View(view) => self.write_view(value, view),
            Value::Wrapper(wrapper) => {
                match wrapper.as_ref() {
                    Wrapper::Boolean(true) => self.write_tag(Tag::TrueObject),
                    Wrapper::Boolean(false) => self.write_tag(Tag::FalseObject),
                    Wrapper::Number(number) => {
                        self.write_tag(Tag::NumberObject);
                        self.write_double(*number);
                    }
                    Wrapper::String(string) => {
                        self.write_tag(Tag::StringObject);
                        self.write_string(string)?;
                    }
                }
                Ok(())
            }
            Value::Host(_) => self.write_host_object(value),
            // Primitives and callables never reach the composite path.
            _ => Err(Error::data_clone(value)),
        }
    }

    /// Keys that are canonical array indices are enumerated as numbers, the
    /// way the engine that defined the format enumerates integer-keyed
    /// properties.
    fn write_key(&mut self, key: &str) -> Result<(), Error> {
        match canonical_index(key) {
            Some(index) => {
                self.write_index_key(index);
                Ok(())
            }
            None => self.write_string(key),
        }
    }

    fn write_index_key(&mut self, index: u32) {
        match i32::try_from(index) {
            Ok(small) => {
                self.write_tag(Tag::Int32);
                varint::write_i32(small, &mut self.out);
            }
            Err(_) => {
                self.write_tag(Tag::Double);
                self.write_double(f64::from(index));
            }
        }
    }

    fn write_record(&mut self, record: &Record) -> Result<(), Error> {
        self.write_tag(Tag::BeginRecord);
        for (key, entry) in record.entries() {
            self.write_key(key)?;
            self.write_value(entry)?;
        }
        self.write_tag(Tag::EndRecord);
        self.write_uint32(record.len() as u32);
        Ok(())
    }

    fn write_dense_array(&mut self, array: &Array) -> Result<(), Error> {
        let length = array.length();
        self.write_tag(Tag::BeginDenseArray);
        self.write_uint32(length);
        if let Some(elements) = array.dense_elements() {
            for element in elements {
                match element {
                    Some(element) => self.write_value(element)?,
                    None => self.write_tag(Tag::TheHole),
                }
            }
        }
        let mut properties: u32 = 0;
        for (key, entry) in array.properties() {
            self.write_key(key)?;
            self.write_value(entry)?;
            properties += 1;
        }
        self.write_tag(Tag::EndDenseArray);
        self.write_uint32(properties);
        self.write_uint32(length);
        Ok(())
    }

    fn write_sparse_array(&mut self, array: &Array) -> Result<(), Error> {
        let length = array.length();
        self.write_tag(Tag::BeginSparseArray);
        self.write_uint32(length);
        let mut properties: u32 = 0;
        if let Some(entries) = array.sparse_entries() {
            for (index, element) in entries {
                self.write_index_key(*index);
                self.write_value(element)?;
                properties += 1;
            }
        }
        for (key, entry) in array.properties() {
            self.write_key(key)?;
            self.write_value(entry)?;
            properties += 1;
        }
        self.write_tag(Tag::EndSparseArray);
        self.write_uint32(properties);
        self.write_uint32(length);
        Ok(())
    }

    fn write_map(&mut self, map: &ValueMap) -> Result<(), Error> {
        self.write_tag(Tag::BeginMap);
        let mut written: u32 = 0;
        for (key, entry) in map.entries() {
            self.write_value(key)?;
            self.write_value(entry)?;
            written += 2;
        }
        self.write_tag(Tag::EndMap);
        // The trailing count is keys plus values, not pairs.
        self.write_uint32(written);
        Ok(())
    }

    fn write_set(&mut self, set: &ValueSet) -> Result<(), Error> {
        self.write_tag(Tag::BeginSet);
        for entry in set.values() {
            self.write_value(entry)?;
        }
        self.write_tag(Tag::EndSet);
        self.write_uint32(set.len() as u32);
        Ok(())
    }

    fn write_byte_buffer(&mut self, value: &Value, buffer: &ByteBuf) -> Result<(), Error> {
        if let Some(id) = self.transfer_id(buffer) {
            self.write_tag(Tag::ByteBufferTransfer);
            self.write_uint32(id);
            return Ok(());
        }
        let data = buffer.borrow();
        let byte_length = u32::try_from(data.len()).map_err(|_| Error::data_clone(value))?;
        self.write_tag(Tag::ByteBuffer);
        self.write_uint32(byte_length);
        self.out.put_slice(&data);
        Ok(())
    }

    fn write_view(&mut self, value: &Value, view: &View) -> Result<(), Error> {
        if self.treat_views_as_host_objects {
            return self.write_host_object(value);
        }
        self.write_tag(Tag::View);
        self.write_uint32(u32::from(view.kind().subtag()));
        self.write_uint32(view.byte_offset());
        self.write_uint32(view.byte_length());
        Ok(())
    }

    fn write_host_object(&mut self, value: &Value) -> Result<(), Error> {
        self.write_tag(Tag::HostObject);
        let Some(mut host) = self.host.take() else {
            return Err(match value {
                Value::Host(object) => Error::UnknownHostObject(object.class_tag().to_owned()),
                Value::View(view) => Error::UnknownHostObject(view.kind().class_name().to_owned()),
                _ => Error::data_clone(value),
            });
        };
        let result = host.write_host_object(self, value);
        self.host = Some(host);
        result
    }

    fn transfer_id(&self, buffer: &ByteBuf) -> Option<u32> {
        self.transfers
            .iter()
            .find(|(_, handle)| handle.ptr_eq(buffer))
            .map(|(id, _)| *id)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn to_u32(len: usize) -> Result<u32, Error> {
    u32::try_from(len).map_err(|_| Error::DataClone("#<String>".to_owned()))
}
