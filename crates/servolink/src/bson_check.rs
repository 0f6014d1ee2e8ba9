//! Structural validation of BSON blobs copied out of shared memory.
//!
//! Snapshots are only accepted into the provider caches after this check,
//! so the lazy parsers never see a document whose length fields could walk
//! outside the buffer. The checker is allocation-free and rejects anything
//! deeper than [`MAX_DEPTH`].

/// Maximum accepted document nesting depth.
pub const MAX_DEPTH: usize = 16;

const MIN_DOC_SIZE: usize = 5;

/// Validate one BSON document at the start of `buf`.
///
/// Accepts trailing bytes after the document; every nested length must stay
/// inside its enclosing document and every document must end with a NUL.
pub fn validate_document(buf: &[u8]) -> bool {
    document_ok(buf, 0)
}

fn document_ok(buf: &[u8], depth: usize) -> bool {
    if depth > MAX_DEPTH || buf.len() < MIN_DOC_SIZE {
        return false;
    }

    let size = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if size < MIN_DOC_SIZE as i32 || size as usize > buf.len() {
        return false;
    }
    let doc = &buf[..size as usize];
    if *doc.last().unwrap() != 0 {
        return false;
    }

    let mut at = 4;
    let end = doc.len() - 1;
    while at < end {
        let tag = doc[at];
        at += 1;

        // Element key: cstring.
        let Some(key_len) = doc[at..end].iter().position(|&b| b == 0) else {
            return false;
        };
        at += key_len + 1;

        let remaining = end - at;
        match tag {
            0x01 => {
                // double
                if remaining < 8 {
                    return false;
                }
                at += 8;
            }
            0x02 => {
                // string: i32 length including NUL, then bytes, then NUL
                let Some(len) = read_i32(doc, at) else {
                    return false;
                };
                if len < 1 || remaining < 4 + len as usize {
                    return false;
                }
                if doc[at + 4 + len as usize - 1] != 0 {
                    return false;
                }
                at += 4 + len as usize;
            }
            0x03 | 0x04 => {
                // embedded document / array
                let Some(len) = read_i32(doc, at) else {
                    return false;
                };
                if len < MIN_DOC_SIZE as i32 || remaining < len as usize {
                    return false;
                }
                if !document_ok(&doc[at..at + len as usize], depth + 1) {
                    return false;
                }
                at += len as usize;
            }
            0x05 => {
                // binary: i32 length, subtype byte, payload
                let Some(len) = read_i32(doc, at) else {
                    return false;
                };
                if len < 0 || remaining < 4 + 1 + len as usize {
                    return false;
                }
                at += 4 + 1 + len as usize;
            }
            0x08 => {
                // bool
                if remaining < 1 {
                    return false;
                }
                at += 1;
            }
            0x0a => {} // null
            0x10 => {
                if remaining < 4 {
                    return false;
                }
                at += 4;
            }
            0x12 => {
                if remaining < 8 {
                    return false;
                }
                at += 8;
            }
            _ => return false,
        }
    }

    at == end
}

fn read_i32(buf: &[u8], at: usize) -> Option<i32> {
    let bytes = buf.get(at..at + 4)?;
    Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Bson};

    fn to_bytes(doc: &bson::Document) -> Vec<u8> {
        let mut out = Vec::new();
        doc.to_writer(&mut out).unwrap();
        out
    }

    #[test]
    fn accepts_well_formed_documents() {
        let bytes = to_bytes(&doc! {
            "name": "wheelbase",
            "connected": true,
            "vid": 0x16d0i32,
            "serial": 1234567i64,
            "gain": 0.5f64,
            "nothing": Bson::Null,
            "nested": { "inner": [1i32, 2i32, 3i32] },
            "blob": bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: vec![1, 2, 3, 4],
            },
        });
        assert!(validate_document(&bytes));
    }

    #[test]
    fn accepts_trailing_slack_after_document() {
        let mut bytes = to_bytes(&doc! {"a": 1i32});
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(validate_document(&bytes));
    }

    #[test]
    fn rejects_truncated_document() {
        let bytes = to_bytes(&doc! {"a": 1i32, "b": "text"});
        assert!(!validate_document(&bytes[..bytes.len() - 1]));
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut bytes = to_bytes(&doc! {"a": 1i32});
        let last = bytes.len() - 1;
        bytes[last] = 0x7f;
        assert!(!validate_document(&bytes));
    }

    #[test]
    fn rejects_inner_length_escaping_document() {
        let mut bytes = to_bytes(&doc! {"s": "hello"});
        // The string length field sits after the tag and "s\0" key.
        let len_at = 4 + 1 + 2;
        bytes[len_at..len_at + 4].copy_from_slice(&1000i32.to_le_bytes());
        assert!(!validate_document(&bytes));
    }

    #[test]
    fn rejects_unknown_element_tag() {
        let mut bytes = to_bytes(&doc! {"a": 1i32});
        bytes[4] = 0x7f;
        assert!(!validate_document(&bytes));
    }

    #[test]
    fn rejects_depth_beyond_limit() {
        let mut inner = doc! {"leaf": 1i32};
        for _ in 0..MAX_DEPTH + 1 {
            inner = doc! {"d": inner};
        }
        assert!(!validate_document(&to_bytes(&inner)));
    }

    #[test]
    fn accepts_depth_at_limit() {
        let mut inner = doc! {"leaf": 1i32};
        for _ in 0..MAX_DEPTH - 1 {
            inner = doc! {"d": inner};
        }
        assert!(validate_document(&to_bytes(&inner)));
    }

    #[test]
    fn rejects_tiny_buffers() {
        assert!(!validate_document(&[]));
        assert!(!validate_document(&[4, 0, 0, 0]));
    }
}
