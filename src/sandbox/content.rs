//! Encoding and windowing of file content.
//!
//! Both backends fetch raw bytes and then apply the same rules, so the
//! meaning of `offset` and `limit` never depends on the backend:
//! UTF-8 reads window by lines, base64 reads window by bytes. Offsets
//! are 1-based; zero is treated as one.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::{Encoding, FileContent, ReadOptions};
use crate::error::{SandboxError, SandboxResult};

/// Decodes caller-supplied content into the bytes to write.
///
/// # Errors
///
/// Returns `SandboxError::InvalidArgument` if base64 content is malformed.
pub fn decode(content: &str, encoding: Encoding) -> SandboxResult<Vec<u8>> {
    match encoding {
        Encoding::Utf8 => Ok(content.as_bytes().to_vec()),
        Encoding::Base64 => STANDARD
            .decode(content.trim())
            .map_err(|e| SandboxError::invalid(format!("invalid base64 content: {e}"))),
    }
}

/// Encodes raw file bytes for a read, applying the offset/limit window.
#[must_use]
pub fn encode(bytes: &[u8], options: &ReadOptions) -> FileContent {
    let start = options.offset.map_or(0, |o| o.saturating_sub(1));

    let content = match options.encoding {
        Encoding::Utf8 => {
            let text = String::from_utf8_lossy(bytes);
            if options.offset.is_none() && options.limit.is_none() {
                text.into_owned()
            } else {
                let lines = text.split_inclusive('\n').skip(to_usize(start));
                match options.limit {
                    Some(limit) => lines.take(to_usize(limit)).collect(),
                    None => lines.collect(),
                }
            }
        }
        Encoding::Base64 => {
            let begin = to_usize(start).min(bytes.len());
            let end = match options.limit {
                Some(limit) => begin.saturating_add(to_usize(limit)).min(bytes.len()),
                None => bytes.len(),
            };
            STANDARD.encode(&bytes[begin..end])
        }
    };

    FileContent {
        content,
        encoding: options.encoding,
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

/// Converts captured output to text holding at most `limit` bytes
/// (0 means unlimited). Returns the text and whether anything was cut.
///
/// The cut lands on a character boundary, so a multi-byte character split
/// by the capture limit is dropped rather than replaced.
#[must_use]
pub fn cap_output(bytes: &[u8], limit: u64) -> (String, bool) {
    let limit = to_usize(limit);
    if limit == 0 {
        return (String::from_utf8_lossy(bytes).into_owned(), false);
    }

    let kept = &bytes[..bytes.len().min(limit)];
    let mut text = String::from_utf8_lossy(kept).into_owned();
    let mut truncated = bytes.len() > limit;
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        truncated = true;
    }
    (text, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_output_respects_limit() {
        assert_eq!(cap_output(b"hello", 0), ("hello".to_string(), false));
        assert_eq!(cap_output(b"hello", 5), ("hello".to_string(), false));
        assert_eq!(cap_output(b"hello", 3), ("hel".to_string(), true));
    }

    #[test]
    fn test_cap_output_drops_split_character() {
        let bytes = "ééééé".as_bytes();
        let (text, truncated) = cap_output(&bytes[..3], 3);
        assert_eq!(text, "é");
        assert!(truncated);

        let (text, truncated) = cap_output(bytes, 3);
        assert_eq!(text, "é");
        assert!(truncated);
        assert!(text.len() <= 3);
    }

    #[test]
    fn test_cap_output_invalid_bytes_stay_within_limit() {
        let (text, truncated) = cap_output(&[0xff, 0xfe, b'a'], 3);
        assert!(text.len() <= 3);
        assert!(truncated);
    }

    #[test]
    fn test_utf8_full_read_is_verbatim() {
        let content = encode(b"a\nb\nc", &ReadOptions::default());
        assert_eq!(content.content, "a\nb\nc");
        assert_eq!(content.encoding, Encoding::Utf8);
    }

    #[test]
    fn test_utf8_line_window() {
        let bytes = b"one\ntwo\nthree\nfour\n";
        let opts = ReadOptions::new().with_offset(2).with_limit(2);
        assert_eq!(encode(bytes, &opts).content, "two\nthree\n");

        let tail = ReadOptions::new().with_offset(4);
        assert_eq!(encode(bytes, &tail).content, "four\n");

        let past_end = ReadOptions::new().with_offset(10);
        assert_eq!(encode(bytes, &past_end).content, "");
    }

    #[test]
    fn test_zero_offset_means_start() {
        let opts = ReadOptions::new().with_offset(0).with_limit(1);
        assert_eq!(encode(b"x\ny\n", &opts).content, "x\n");
    }

    #[test]
    fn test_base64_byte_window() {
        let bytes = [0u8, 1, 2, 3, 4, 5];
        let opts = ReadOptions::new()
            .with_encoding(Encoding::Base64)
            .with_offset(3)
            .with_limit(2);
        let content = encode(&bytes, &opts);
        assert_eq!(decode(&content.content, Encoding::Base64).ok(), Some(vec![2, 3]));
    }

    #[test]
    fn test_base64_binary_survives() {
        let bytes: Vec<u8> = (0..=255).collect();
        let opts = ReadOptions::new().with_encoding(Encoding::Base64);
        let encoded = encode(&bytes, &opts);
        assert_eq!(decode(&encoded.content, Encoding::Base64).ok(), Some(bytes));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let err = decode("not base64!!", Encoding::Base64);
        assert!(matches!(err, Err(SandboxError::InvalidArgument { .. })));
    }
}
