use std::io::Read;
use serde::de;

use crate::error::{Error, Result};
use super::decoder::Decoder;
use super::DecodedType;

// Pumps list elements and dictionary entries out of the decoder until the
// matching 'e'. Dictionary keys must be byte strings in strictly ascending
// order; that rule is enforced here, so every consumer of a decoded dict
// gets the sorted-and-unique guarantee for free.
//
// Bencode has no representation for enums or fixed-arity tuples, so unlike
// a general serde backend this access type only ever serves seq and map
// visits; the decoder rejects enum requests outright.
pub struct Access<'a, R: 'a + Read> {

    d: &'a mut Decoder<R>,

    // Previous dictionary key, for the sorted-and-unique check.
    last_key: Option<Vec<u8>>,

}

impl<'a, R: 'a + Read> Access<'a, R> {
    pub fn new(deserializer: &'a mut Decoder<R>) -> Self {
        Self { d: deserializer, last_key: None }
    }
}

impl<'de, 'a, R: 'a + Read> de::SeqAccess<'de> for Access<'a, R> {
    type Error = Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>>
        where T: de::DeserializeSeed<'de>
    {
        match self.d.read_next()? {
            DecodedType::EOF => Ok(None),
            token => {
                self.d.next_token = Some(token);
                seed.deserialize(&mut *self.d).map(Some)
            }
        }
    }
}

impl<'de, 'a, R: Read> de::MapAccess<'de> for Access<'a, R> {
    type Error = Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>>
        where K: de::DeserializeSeed<'de>
    {
        match self.d.read_next()? {
            DecodedType::EOF => Ok(None),

            DecodedType::ByteString(key) => {
                // Dictionary keys must be strictly ascending.
                if let Some(prev) = &self.last_key {
                    match prev.as_slice().cmp(&key) {
                        std::cmp::Ordering::Less => {},
                        std::cmp::Ordering::Equal => return Err(Error::MalformedInput(
                            format!("duplicate dictionary key {:?}", String::from_utf8_lossy(&key))
                        )),
                        std::cmp::Ordering::Greater => return Err(Error::MalformedInput(
                            format!("unsorted dictionary key {:?}", String::from_utf8_lossy(&key))
                        )),
                    }
                }
                self.last_key = Some(key.clone());
                self.d.next_token = Some(DecodedType::ByteString(key));
                Ok(Some(seed.deserialize(&mut *self.d)?))
            },

            x => Err(Error::MalformedInput(format!("dictionary key is not a byte string: {:?}", x))),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value>
        where V: de::DeserializeSeed<'de>
    {
        seed.deserialize(&mut *self.d)
    }
}
