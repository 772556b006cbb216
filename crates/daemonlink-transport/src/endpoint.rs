//! Endpoint naming.
//!
//! A server is created from a logical name and resolves it to an address that
//! is unique to that server instance:
//! - Unix: `{name}.sock` inside a private temporary directory
//! - Windows: `\\.\pipe\{name}-{suffix}.pipe` with a random suffix

use crate::error::{IpcError, Result};

/// Prefix for every Windows named pipe path.
pub const PIPE_NAMESPACE: &str = r"\\.\pipe\";

/// Number of random bytes behind [`unique_suffix`].
pub const SUFFIX_BYTES: usize = 6;

const URL_SAFE_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Reject logical names that cannot be turned into a single path component.
pub fn validate_logical_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name must not be empty")
    } else if name.contains(['/', '\\']) {
        Some("name must not contain path separators")
    } else if name.contains('\0') {
        Some("name must not contain NUL")
    } else if name == "." || name == ".." {
        Some("name must not be a relative path component")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(IpcError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Collision-resistant suffix: 6 random bytes, URL-safe base64 (8 characters).
pub fn unique_suffix() -> String {
    let random = uuid::Uuid::new_v4();
    // The last six bytes of a v4 UUID carry no version or variant bits.
    let bytes = &random.as_bytes()[16 - SUFFIX_BYTES..];
    encode_url_safe(bytes)
}

/// File name of the socket special file for `name`.
pub fn socket_file_name(name: &str) -> String {
    format!("{name}.sock")
}

/// Full named pipe path for `name` with the given unique suffix.
pub fn pipe_path(name: &str, suffix: &str) -> String {
    format!("{PIPE_NAMESPACE}{name}-{suffix}.pipe")
}

fn encode_url_safe(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let b = [
            chunk[0],
            chunk.get(1).copied().unwrap_or(0),
            chunk.get(2).copied().unwrap_or(0),
        ];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        let symbols = chunk.len() + 1;
        for i in 0..4 {
            if i < symbols {
                let index = (n >> (18 - 6 * i)) & 0x3f;
                out.push(char::from(URL_SAFE_ALPHABET[index as usize]));
            } else {
                out.push('=');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn suffix_is_eight_url_safe_chars() {
        let suffix = unique_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
    }

    #[test]
    fn suffixes_do_not_collide() {
        let seen: HashSet<String> = (0..256).map(|_| unique_suffix()).collect();
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn encodes_known_vectors() {
        assert_eq!(encode_url_safe(b"foobar"), "Zm9vYmFy");
        assert_eq!(encode_url_safe(b"fo"), "Zm8=");
        assert_eq!(encode_url_safe(&[0xfb, 0xff, 0xbf, 0xfe, 0xfb, 0xef]), "-_-__vvv");
    }

    #[test]
    fn pipe_path_follows_naming_convention() {
        assert_eq!(
            pipe_path("dmypy", "AbCd-_12"),
            r"\\.\pipe\dmypy-AbCd-_12.pipe"
        );
        assert_eq!(socket_file_name("dmypy"), "dmypy.sock");
    }

    #[test]
    fn rejects_unusable_names() {
        for bad in ["", "a/b", r"a\b", "..", "nul\0"] {
            assert!(
                matches!(
                    validate_logical_name(bad),
                    Err(IpcError::InvalidName { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        validate_logical_name("test1").expect("plain name should be accepted");
    }
}
