use std::collections::BTreeMap;
use serde::{de, ser, ser::{SerializeMap, SerializeSeq}};

// The full bencode value space. Dictionaries use a BTreeMap so re-encoding a
// decoded value is canonical by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<Value>),
    Dictionary(BTreeMap<Vec<u8>, Value>),
}

impl Value {

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::ByteString(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    // Dictionary lookup by string key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dictionary().and_then(|d| d.get(key.as_bytes()))
    }
}

impl ser::Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where S: serde::Serializer
    {
        match self {
            Value::Integer(int) => serializer.serialize_i64(*int),

            Value::ByteString(bytes) => serializer.serialize_bytes(bytes),

            Value::List(list) => {
                let mut seq = serializer.serialize_seq(Some(list.len()))?;
                for elem in list {
                    seq.serialize_element(elem)?;
                }
                seq.end()
            },

            Value::Dictionary(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (k, v) in dict {
                    map.serialize_entry(serde_bytes::Bytes::new(k), v)?;
                }
                map.end()
            },
        }
    }
}

impl<'de> de::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where D: serde::Deserializer<'de>
    {
        struct ValueVisitor;

        impl<'de> de::Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a bencode value")
            }

            fn visit_i64<E>(self, v: i64) -> Result<Value, E>
                where E: de::Error
            {
                Ok(Value::Integer(v))
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Value, E>
                where E: de::Error
            {
                Ok(Value::ByteString(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Value, E>
                where E: de::Error
            {
                Ok(Value::ByteString(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<Value, E>
                where E: de::Error
            {
                Ok(Value::ByteString(v.as_bytes().to_vec()))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
                where A: de::SeqAccess<'de>
            {
                let mut list = Vec::new();
                while let Some(elem) = seq.next_element::<Value>()? {
                    list.push(elem);
                }
                Ok(Value::List(list))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
                where A: de::MapAccess<'de>
            {
                let mut dict = BTreeMap::new();
                while let Some(key) = map.next_key::<Value>()? {
                    let key = match key {
                        Value::ByteString(b) => b,
                        _ => return Err(de::Error::custom("dictionary key is not a byte string")),
                    };
                    let value = map.next_value::<Value>()?;
                    dict.insert(key, value);
                }
                Ok(Value::Dictionary(dict))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}
