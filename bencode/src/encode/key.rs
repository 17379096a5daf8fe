use serde::ser;
use crate::error::{Error, Result};

// Serializer for dictionary keys: accepts only string/byte types and yields
// the raw key bytes so the map serializer can sort before writing.
pub struct KeySerializer;

macro_rules! key_type_error {
    ($($f:ident: $t:ty,)*) => {
        $(
            fn $f(self, _v: $t) -> Result<Vec<u8>> {
                Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
            }
        )*
    };
}

impl<'a> ser::Serializer for &'a mut KeySerializer {

    type Ok    = Vec<u8>;
    type Error = Error;

    type SerializeSeq           = ser::Impossible<Vec<u8>, Error>;
    type SerializeMap           = ser::Impossible<Vec<u8>, Error>;
    type SerializeStruct        = ser::Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = ser::Impossible<Vec<u8>, Error>;
    type SerializeTuple         = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct   = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant  = ser::Impossible<Vec<u8>, Error>;

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>> {
        Ok(v.to_vec())
    }

    fn serialize_str(self, v: &str) -> Result<Vec<u8>> {
        self.serialize_bytes(v.as_bytes())
    }

    fn serialize_char(self, v: char) -> Result<Vec<u8>> {
        let mut buf = [0; 4];
        self.serialize_bytes(v.encode_utf8(&mut buf).as_bytes())
    }

    fn serialize_unit_variant(
            self,
            _name: &'static str,
            _variant_index: u32,
            variant: &'static str,
        ) -> Result<Vec<u8>>
    {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized>(
            self,
            _name: &'static str,
            value: &T,
        ) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    key_type_error! {
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_f32: f32,
        serialize_f64: f64,
    }

    fn serialize_unit(self) -> Result<Vec<u8>> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Vec<u8>> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_none(self) -> Result<Vec<u8>> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized>(
            self,
            _name: &'static str,
            _variant_index: u32,
            _variant: &'static str,
            _value: &T,
        ) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_tuple_struct(
            self,
            _name: &'static str,
            _len: usize,
        ) -> Result<Self::SerializeTupleStruct>
    {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_tuple_variant(
            self,
            _name: &'static str,
            _variant_index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> Result<Self::SerializeTupleVariant>
    {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_struct(
            self,
            _name: &'static str,
            _len: usize,
        ) -> Result<Self::SerializeStruct>
    {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }

    fn serialize_struct_variant(
            self,
            _name: &'static str,
            _variant_index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> Result<Self::SerializeStructVariant>
    {
        Err(Error::InvalidType("dictionary keys must be byte strings".to_string()))
    }
}
