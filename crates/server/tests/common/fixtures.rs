//! Test fixtures for generating test data.

use bytes::Bytes;
use hoard_core::ContentHash;

/// Boundary used by [`multipart_body`].
pub const BOUNDARY: &str = "hoard-test-boundary";

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Hex fingerprint of `data`, as stored in `files.file_hash`.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub fn fingerprint(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

/// A file part for [`multipart_body`].
#[allow(dead_code)]
pub struct FilePartSpec<'a> {
    pub filename: &'a str,
    pub content_type: Option<&'a str>,
    pub data: &'a [u8],
}

/// Build a `multipart/form-data` body with text fields followed by an
/// optional file part. Returns the body and its `Content-Type` header value.
#[allow(dead_code)]
pub fn multipart_body(
    fields: &[(&str, &str)],
    file: Option<FilePartSpec<'_>>,
) -> (Vec<u8>, String) {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
        );
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    if let Some(file) = file {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                file.filename
            )
            .as_bytes(),
        );
        if let Some(content_type) = file.content_type {
            body.extend_from_slice(format!("Content-Type: {content_type}\r\n").as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(file.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    (body, format!("multipart/form-data; boundary={BOUNDARY}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_bytes_deterministic() {
        let a = seeded_bytes(42, 100);
        let b = seeded_bytes(42, 100);
        assert_eq!(a, b);

        let c = seeded_bytes(43, 100);
        assert_ne!(a, c);
    }

    #[test]
    fn test_multipart_body_layout() {
        let (body, content_type) = multipart_body(
            &[("user_id", "alice")],
            Some(FilePartSpec {
                filename: "a.txt",
                content_type: Some("text/plain"),
                data: b"hi",
            }),
        );
        let text = String::from_utf8(body).unwrap();
        assert!(content_type.ends_with(BOUNDARY));
        assert!(text.contains("name=\"user_id\"\r\n\r\nalice\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n\r\nhi\r\n"));
        assert!(text.ends_with(&format!("--{BOUNDARY}--\r\n")));
    }
}
