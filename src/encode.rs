//! Variable width integer, vector, and string encodings for the metadata carried in custom sections.
//!
//! These share `wasm_encoder`'s encodings of module contents, so metadata written here reads back with
//! `wasmparser`'s [`BinaryReader`](wasmparser::BinaryReader).

use wasm_encoder::Encode;

/// Encodes a signed integer as LEB128.
pub fn encode_signed_varint(val: i64, out: &mut Vec<u8>) {
    val.encode(out);
}
/// Encodes an unsigned integer as LEB128.
pub fn encode_unsigned_varint(val: u64, out: &mut Vec<u8>) {
    val.encode(out);
}

/// Writes `items.len()` followed by each (already encoded) item.
pub fn encode_vector<T: AsRef<[u8]>>(items: &[T], out: &mut Vec<u8>) {
    encode_unsigned_varint(items.len() as u64, out);
    for item in items {
        out.extend_from_slice(item.as_ref());
    }
}
/// Writes the byte length of `s` followed by its UTF-8 bytes.
pub fn encode_utf8_string(s: &str, out: &mut Vec<u8>) {
    s.encode(out);
}

#[test]
fn test_signed_varint() {
    let mut buf = vec![];
    let tests = [
        (0,                [0x00].as_slice()),
        (1,                [0x01].as_slice()),
        (-1,               [0x7f].as_slice()),
        (63,               [0x3f].as_slice()),
        (64,               [0xc0, 0x00].as_slice()),
        (-64,              [0x40].as_slice()),
        (-65,              [0xbf, 0x7f].as_slice()),
        (624485,           [0xe5, 0x8e, 0x26].as_slice()),
        (-123456,          [0xc0, 0xbb, 0x78].as_slice()),
        (i32::MAX as i64,  [0xff, 0xff, 0xff, 0xff, 0x07].as_slice()),
        (i32::MIN as i64,  [0x80, 0x80, 0x80, 0x80, 0x78].as_slice()),
        (i64::MAX,         [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00].as_slice()),
        (i64::MIN,         [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7f].as_slice()),
    ];
    for (v, expect) in tests {
        for prefix_bytes in 0..4 {
            buf.clear();
            buf.extend(std::iter::once(0x53).cycle().take(prefix_bytes));
            encode_signed_varint(v, &mut buf);
            assert!(buf[..prefix_bytes].iter().all(|&x| x == 0x53));
            assert_eq!(&buf[prefix_bytes..], expect, "{v}");

            let mut reader = wasmparser::BinaryReader::new(&buf[prefix_bytes..], 0);
            assert_eq!(reader.read_var_i64().unwrap(), v);
            assert!(reader.eof());
        }
    }
}

#[test]
fn test_unsigned_varint() {
    let mut buf = vec![];
    let tests = [
        (0,              [0x00].as_slice()),
        (1,              [0x01].as_slice()),
        (0x7f,           [0x7f].as_slice()),
        (0x80,           [0x80, 0x01].as_slice()),
        (624485,         [0xe5, 0x8e, 0x26].as_slice()),
        (u32::MAX as u64, [0xff, 0xff, 0xff, 0xff, 0x0f].as_slice()),
        (u64::MAX,       [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01].as_slice()),
    ];
    for (v, expect) in tests {
        for prefix_bytes in 0..4 {
            buf.clear();
            buf.extend(std::iter::once(0x53).cycle().take(prefix_bytes));
            encode_unsigned_varint(v, &mut buf);
            assert_eq!(&buf[prefix_bytes..], expect);

            let mut reader = wasmparser::BinaryReader::new(&buf[prefix_bytes..], 0);
            assert_eq!(reader.read_var_u64().unwrap(), v);
        }
    }
}

#[test]
fn test_vector_and_string() {
    let mut buf = vec![];
    encode_vector::<Vec<u8>>(&[], &mut buf);
    assert_eq!(buf, [0x00]);

    buf.clear();
    encode_vector(&[vec![0x7f], vec![0x7c, 0x7c]], &mut buf);
    assert_eq!(buf, [0x02, 0x7f, 0x7c, 0x7c]);

    buf.clear();
    encode_utf8_string("", &mut buf);
    encode_utf8_string("héllo", &mut buf);
    assert_eq!(buf, [0x00, 0x06, b'h', 0xc3, 0xa9, b'l', b'l', b'o']);
    let mut reader = wasmparser::BinaryReader::new(&buf, 0);
    assert_eq!(reader.read_string().unwrap(), "");
    assert_eq!(reader.read_string().unwrap(), "héllo");
    assert!(wasmparser::BinaryReader::new(&buf[1..5], 1).read_string().is_err());

    let long = "x".repeat(200);
    buf.clear();
    encode_utf8_string(&long, &mut buf);
    assert_eq!(&buf[..2], &[0xc8, 0x01]);
}
