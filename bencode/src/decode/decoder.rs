use std::io::Read;
use serde::{
    de,
    forward_to_deserialize_any,
    de::Deserializer,
};
use crate::error::{Error, Result};
use super::DecodedType;
use super::access::Access;

pub struct Decoder<R: Read> {
    pub scanner:    R,
    pub next_token: Option<DecodedType>,
}

impl<R: Read> Decoder<R> {

    pub fn new(scanner: R) -> Self { Self { scanner, next_token: None } }

    pub fn read_next(&mut self) -> Result<DecodedType> {
        if let Some(next) = self.next_token.take() {
            return Ok(next);
        }

        let mut buf = [0; 1];
        if self.scanner.read(&mut buf).map_err(Error::IoError)? != 1 {
            return Err(Error::EOF);
        }

        match buf[0] {
            b'i' => Ok(DecodedType::Integer(self.read_i64()?)),
            n @ b'0'..=b'9' => Ok(DecodedType::ByteString(self.read_bytes(n)?)),
            b'l' => Ok(DecodedType::List),
            b'd' => Ok(DecodedType::Dictionary),
            b'e' => Ok(DecodedType::EOF),
            e => Err(Error::InvalidToken { expected: "a valid token type".to_string(), found: (e as char).to_string() }),
        }
    }

    fn read_i64(&mut self) -> Result<i64> {

        let mut buf = [0; 1];
        let mut out = vec![];

        loop {
            if self.scanner.read(&mut buf).map_err(Error::IoError)? != 1 {
                return Err(Error::EOF);
            }
            // Signals end of integer.
            if buf[0] == b'e' {
                return parse_int(&out);
            } else {
                out.push(buf[0]);
            }
        }
    }

    fn read_usize(&mut self, n: u8) -> Result<usize> {

        let mut buf = [0; 1];
        let mut out = vec![n];

        loop {
            if self.scanner.read(&mut buf).map_err(Error::IoError)? != 1 {
                return Err(Error::EOF);
            }
            if buf[0] == b':' {
                return parse_len(&out);
            } else {
                out.push(buf[0]);
            }
        }
    }

    fn read_bytes(&mut self, n: u8) -> Result<Vec<u8>> {

        let length = self.read_usize(n)?;
        let mut buf = vec![0u8; length];
        self.scanner.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::EOF,
            _ => Error::IoError(e),
        })?;
        Ok(buf)
    }
}

// i<digits>e with no leading zeros (i0e excepted) and no negative zero.
fn parse_int(raw: &[u8]) -> Result<i64> {

    let digits = match raw.first() {
        Some(b'-') => &raw[1..],
        _ => raw,
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::MalformedInput(format!("invalid integer {:?}", String::from_utf8_lossy(raw))));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(Error::MalformedInput(format!("leading zero in integer {:?}", String::from_utf8_lossy(raw))));
    }
    if raw[0] == b'-' && digits == b"0".as_slice() {
        return Err(Error::MalformedInput("negative zero".to_string()));
    }

    // All bytes are ascii digits at this point.
    let s = std::str::from_utf8(raw).expect("ascii");
    s.parse().map_err(|_| Error::MalformedInput(format!("integer out of range: {}", s)))
}

// <digits>: length prefix, same leading-zero rule as integers.
fn parse_len(raw: &[u8]) -> Result<usize> {

    if raw.is_empty() || !raw.iter().all(u8::is_ascii_digit) {
        return Err(Error::MalformedInput(format!("invalid length {:?}", String::from_utf8_lossy(raw))));
    }
    if raw.len() > 1 && raw[0] == b'0' {
        return Err(Error::MalformedInput(format!("leading zero in length {:?}", String::from_utf8_lossy(raw))));
    }

    let s = std::str::from_utf8(raw).expect("ascii");
    s.parse().map_err(|_| Error::MalformedInput(format!("length out of range: {}", s)))
}

impl<'de, 'a, R: Read> Deserializer<'de> for &'a mut Decoder<R> {

    type Error = Error;

    fn deserialize_any<V>(mut self, visitor: V) -> Result<V::Value>
        where V: serde::de::Visitor<'de>
    {
        match self.read_next()? {
            DecodedType::Integer(i) => visitor.visit_i64(i),
            DecodedType::ByteString(s) => visitor.visit_byte_buf(s),
            DecodedType::List => visitor.visit_seq(Access::new(&mut self)),
            DecodedType::Dictionary => visitor.visit_map(Access::new(&mut self)),
            DecodedType::EOF => Err(Error::EOF),
        }
    }

    forward_to_deserialize_any! {
        bool char
        i8 i16 i32 i64
        u8 u16 u32 u64
        f32 f64
        unit bytes byte_buf
        seq map unit_struct tuple tuple_struct
        ignored_any struct
    }

    fn deserialize_newtype_struct<V>(
            self,
            _name: &'static str,
            visitor: V,
        ) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        visitor.visit_some(self)
    }

    // Bencode has no enum representation; nothing in the wire formats this
    // decoder exists for carries one.
    fn deserialize_enum<V>(
            self,
            name: &'static str,
            _variants: &'static [&'static str],
            _visitor: V,
        ) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        Err(Error::InvalidType(format!("enum {} is not representable in bencode", name)))
    }

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        let b = self.read_next().and_then(
            |x| match x {
                DecodedType::ByteString(a) => Ok(a),
                _ => Err(Error::InvalidToken { expected: "b for byte string".to_string(), found: format!("{:?}", x) }),
            }
        )?;

        let s = std::str::from_utf8(&b).map_err(
            |err| Error::Custom(format!("failed to convert bytes to UTF-8 string: {}", err))
        )?;
        visitor.visit_str(s)
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value>
        where V: de::Visitor<'de>
    {
        self.deserialize_str(visitor)
    }
}
