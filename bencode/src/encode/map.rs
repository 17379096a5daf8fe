use serde::ser;
use crate::error::Error;
use super::{key::KeySerializer, encoder::Encoder};

// Buffers dictionary entries so they can be written in lexicographical key
// order regardless of the order the caller produced them in. Keys are held
// raw; the length prefix is written at flush time.
pub struct SerializeMap<'a> {
    serializer:     &'a mut Encoder,
    items:          Vec<(Vec<u8>, Vec<u8>)>,
    current_key:    Option<Vec<u8>>,
}

impl<'a> SerializeMap<'a> {

    pub fn new(serializer: &'a mut Encoder, size: usize) -> Self {
        Self {
            serializer,
            items: Vec::with_capacity(size),
            current_key: None,
        }
    }

    fn finish(&mut self) -> Result<(), Error> {
        if self.current_key.is_some() {
            return Err(Error::MapSerializationOrder(
                "attempted to end map serialization while holding key".to_string())
            )
        }
        // Take items and sort lexicographically.
        let mut items = std::mem::take(&mut self.items);
        items.sort_by(|(a, _), (b, _)| a.cmp(b));

        for pair in items.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(Error::MapSerializationOrder(
                    format!("duplicate dictionary key {:?}", String::from_utf8_lossy(&pair[0].0))
                ));
            }
        }

        self.serializer.push("d");
        for (k, v) in items {
            ser::Serializer::serialize_bytes(&mut *self.serializer, k.as_ref())?;
            self.serializer.push(v);
        }
        self.serializer.push("e");
        Ok(())
    }

    fn push_entry(&mut self, key: Vec<u8>, value: Vec<u8>) {
        // An empty encoding means the value was None; the whole entry is
        // omitted from the dictionary.
        if !value.is_empty() {
            self.items.push((key, value));
        }
    }
}

impl<'a> ser::SerializeMap for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, key: &T) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        match self.current_key {
            // We are supposed to be serializing a value here.
            Some(_) => Err(Error::MapSerializationOrder(
                "consecutive calls to serialize key without serializing value".to_string()
            )),
            None => {
                self.current_key = Some(key.serialize(&mut KeySerializer)?);
                Ok(())
            }
        }
    }

    fn serialize_value<T: ?Sized>(&mut self, value: &T) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        let key = self.current_key.take().ok_or_else(
            || {
                Error::MapSerializationOrder(
                    "consecutive calls to serialize value without serializing key".to_string()
                )
            }
        )?;

        let mut ser = Encoder::new();
        value.serialize(&mut ser)?;
        self.push_entry(key, ser.into_buf());
        Ok(())
    }

    fn serialize_entry<K: ?Sized, V: ?Sized>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<(), Self::Error>
        where K: serde::Serialize, V: serde::Serialize,
    {
        if self.current_key.is_some() {
            return Err(Error::MapSerializationOrder(
                "attempted to serialize entry whilst holding a key".to_string()
            ))
        }

        let key = key.serialize(&mut KeySerializer)?;

        let mut val_ser = Encoder::new();
        value.serialize(&mut val_ser)?;
        self.push_entry(key, val_ser.into_buf());
        Ok(())
    }

    fn end(mut self) -> Result<Self::Ok, Self::Error> { self.finish() }
}

impl<'a> ser::SerializeStruct for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(
            &mut self,
            key: &'static str,
            value: &T,
        ) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<Self::Ok, Self::Error> {
        self.finish()
    }
}

impl<'a> ser::SerializeStructVariant for SerializeMap<'a> {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(
            &mut self,
            key: &'static str,
            value: &T,
        ) -> Result<(), Self::Error>
        where T: serde::Serialize
    {
        ser::SerializeMap::serialize_entry(self, key, value)
    }

    fn end(mut self) -> Result<Self::Ok, Self::Error> {
        self.finish()?;
        self.serializer.push("e");
        Ok(())
    }
}
