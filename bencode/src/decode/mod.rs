use std::io::Read;
use serde::de;
use crate::error::{Error, Result};

mod decoder;
mod access;
#[cfg(test)]
mod test;

use decoder::Decoder;

#[derive(PartialEq, Eq, Debug)]
pub enum DecodedType {
    Integer(i64),
    ByteString(Vec<u8>),
    List,
    Dictionary,
    EOF,
}

pub fn decode_bytes<'de, T>(b: &'de [u8]) -> Result<T>
    where T: de::Deserialize<'de>
{
    let mut decoder = Decoder::new(b);
    let out = de::Deserialize::deserialize(&mut decoder)?;

    // The outermost value must consume the whole input.
    let mut probe = [0u8; 1];
    if decoder.scanner.read(&mut probe).map_err(Error::IoError)? != 0 {
        return Err(Error::TrailingBytes);
    }
    Ok(out)
}

pub fn decode_str<'de, T>(s: &'de str) -> Result<T>
    where T: de::Deserialize<'de>
{
    decode_bytes(s.as_bytes())
}
