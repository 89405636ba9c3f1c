use crate::encoding::{Decode, Encode, EncodingError, decode_from_slice, encode_to_vec};

fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
    let bytes = encode_to_vec(&value).unwrap();
    let (decoded, consumed) = decode_from_slice::<T>(&bytes).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(consumed, bytes.len());
}

#[test]
fn roundtrip_unsigned_integers() {
    roundtrip(0u8);
    roundtrip(0xABu8);
    roundtrip(0u32);
    roundtrip(0xDEAD_BEEFu32);
    roundtrip(u32::MAX);
    roundtrip(0u64);
    roundtrip(u64::MAX);
}

#[test]
fn integers_are_little_endian() {
    let bytes = encode_to_vec(&0x0102_0304u32).unwrap();
    assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);

    let bytes = encode_to_vec(&0x01u64).unwrap();
    assert_eq!(bytes, vec![0x01, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn roundtrip_bool() {
    roundtrip(true);
    roundtrip(false);
}

#[test]
fn invalid_bool_byte_is_rejected() {
    let err = bool::decode_from(&[2]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidBool(2)));
}

#[test]
fn roundtrip_fixed_arrays() {
    roundtrip(*b"SYNAPSE!");
    roundtrip([0u8; 0]);
}

#[test]
fn roundtrip_option() {
    roundtrip(Option::<u32>::None);
    roundtrip(Some(42u32));
}

#[test]
fn option_rejects_unknown_tag() {
    let err = Option::<u32>::decode_from(&[7]).unwrap_err();
    assert!(matches!(err, EncodingError::InvalidTag { tag: 7, .. }));
}

#[test]
fn short_buffer_reports_eof() {
    let err = u32::decode_from(&[1, 2]).unwrap_err();
    match err {
        EncodingError::UnexpectedEof { needed, available } => {
            assert_eq!(needed, 4);
            assert_eq!(available, 2);
        }
        other => panic!("expected UnexpectedEof, got {other:?}"),
    }
}
