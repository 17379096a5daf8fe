use std::fmt::Display;

pub type Result<T> = std::result::Result<T, Error>;

// Errors specific to bencoding on top of those present in serde.
#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error(transparent)]
    IoError(std::io::Error),

    // Attempted to serialize an invalid type.
    #[error("invalid type: {0}")]
    InvalidType(String),

    // Type valid but unexpected token.
    #[error("invalid token: expected: {expected:?}, found: {found:?}")]
    InvalidToken {
        expected: String,
        found: String,
    },

    #[error("map serialization error: {0}")]
    MapSerializationOrder(String),

    // Input breaks a bencode rule: leading zeros, negative zero,
    // unsorted or duplicate dictionary keys.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    // Input continues past the end of the outermost value.
    #[error("trailing bytes after value")]
    TrailingBytes,

    #[error("{0}")]
    Custom(String),

    #[error("unexpected end of input stream")]
    EOF,

}

impl serde::ser::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}

impl serde::de::Error for Error {
    fn custom<T>(msg: T) -> Self where T: Display {
        Error::Custom(msg.to_string())
    }
}
