use serde_derive::Deserialize;
use crate::Error;
use super::{decode_bytes, decode_str};

#[test]
fn decode_to_num() {
    let r: i64 = decode_str("i666e").unwrap();
    assert_eq!(r, 666);
    let r: i64 = decode_str("i-666e").unwrap();
    assert_eq!(r, -666);
    let r: i64 = decode_str("i0e").unwrap();
    assert_eq!(r, 0);
}

#[test]
fn decode_to_string() {
    let r: String = decode_str("3:yes").unwrap();
    assert_eq!(r, "yes");
    let r: String = decode_str("0:").unwrap();
    assert_eq!(r, "");
}

#[test]
fn decode_to_struct() {
    let b = "d1:xi1111e1:y3:dog1:z2:yoe";
    #[derive(PartialEq, Debug, Deserialize)]
    struct Fake {
        y: String,
        x: i64,
        #[serde(default)]
        z: Option<String>,
        #[serde(default)]
        a: Option<String>,
    }
    let r: Fake = decode_str(b).unwrap();
    assert_eq!(
        r,
        Fake {
            x: 1111,
            y: "dog".to_string(),
            z: Some("yo".to_string()),
            a: None,
        }
    );
}

#[test]
fn deserialize_to_vec() {
    let r: Vec<i64> = decode_str("li666ee").unwrap();
    assert_eq!(r, [666]);
}

#[test]
fn leading_zero_integer_rejected() {
    assert!(matches!(decode_str::<i64>("i03e"), Err(Error::MalformedInput(_))));
    assert!(matches!(decode_str::<i64>("i-03e"), Err(Error::MalformedInput(_))));
}

#[test]
fn negative_zero_rejected() {
    assert!(matches!(decode_str::<i64>("i-0e"), Err(Error::MalformedInput(_))));
}

#[test]
fn empty_integer_rejected() {
    assert!(matches!(decode_str::<i64>("ie"), Err(Error::MalformedInput(_))));
    assert!(matches!(decode_str::<i64>("i-e"), Err(Error::MalformedInput(_))));
}

#[test]
fn truncated_input_rejected() {
    assert!(matches!(decode_str::<String>("4:yes"), Err(Error::EOF)));
    assert!(matches!(decode_str::<i64>("i66"), Err(Error::EOF)));
    assert!(matches!(decode_str::<Vec<i64>>("li1e"), Err(Error::EOF)));
}

#[test]
fn trailing_bytes_rejected() {
    assert!(matches!(decode_str::<i64>("i1ei2e"), Err(Error::TrailingBytes)));
    assert!(matches!(decode_str::<String>("3:yesx"), Err(Error::TrailingBytes)));
}

#[test]
fn leading_zero_length_rejected() {
    assert!(matches!(decode_str::<String>("03:yes"), Err(Error::MalformedInput(_))));
}

#[test]
fn enums_are_rejected() {
    #[derive(Debug, Deserialize)]
    enum Verdict {
        Yes,
    }
    assert!(matches!(decode_str::<Verdict>("3:Yes"), Err(Error::InvalidType(_))));
}

#[test]
fn raw_byte_strings_are_not_utf8_decoded() {
    // 4 bytes that are not valid UTF-8.
    let mut input = b"4:".to_vec();
    input.extend_from_slice(&[0xff, 0xfe, 0x00, 0x80]);
    let r: serde_bytes::ByteBuf = decode_bytes(&input).unwrap();
    assert_eq!(r.as_ref(), &[0xff, 0xfe, 0x00, 0x80]);
}
