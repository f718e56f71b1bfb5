//! Bounded capture of a script's combined stdout/stderr.

pub const DEFAULT_OUTPUT_MAX_CHARS: usize = 10_000;

/// Append-only text buffer that keeps the most recent `max_chars` characters.
///
/// Lengths are counted in `char`s so trimming never lands inside a code point.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    text: String,
    chars: usize,
    truncated_prefix: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &str, max_chars: usize) {
        if chunk.is_empty() {
            return;
        }
        self.text.push_str(chunk);
        self.chars = self.chars.saturating_add(chunk.chars().count());

        let excess = self.chars.saturating_sub(max_chars);
        if excess == 0 {
            return;
        }
        let cut = self
            .text
            .char_indices()
            .nth(excess)
            .map(|(idx, _)| idx)
            .unwrap_or(self.text.len());
        self.text.drain(..cut);
        self.chars -= excess;
        self.truncated_prefix = true;
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.chars = 0;
        self.truncated_prefix = false;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len_chars(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated_prefix
    }
}

/// Incremental UTF-8 decoder for pipe reads.
///
/// A read may end in the middle of a multi-byte sequence; those trailing bytes
/// are held back and prepended to the next chunk. Invalid sequences become
/// U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let keep = rest.to_vec();
        self.pending = keep;
        out
    }

    /// Flushes whatever is left once the stream has ended.
    pub(crate) fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn append_trims_only_excess_chars() {
        let mut buffer = OutputBuffer::new();
        buffer.append("hello", 8);
        buffer.append("world", 8);
        assert_eq!(buffer.as_str(), "lloworld");
        assert_eq!(buffer.len_chars(), 8);
        assert!(buffer.was_truncated());
    }

    #[test]
    fn many_small_appends_keep_most_recent_in_order() {
        let mut buffer = OutputBuffer::new();
        let mut expected = String::new();
        for idx in 0..500 {
            let piece = format!("{idx},");
            buffer.append(&piece, 64);
            expected.push_str(&piece);
            assert!(buffer.len_chars() <= 64);
        }
        let tail: String = expected
            .chars()
            .skip(expected.chars().count() - 64)
            .collect();
        assert_eq!(buffer.as_str(), tail);
    }

    #[test]
    fn single_chunk_larger_than_bound() {
        let mut buffer = OutputBuffer::new();
        buffer.append("abcdefghij", 3);
        assert_eq!(buffer.as_str(), "hij");
    }

    #[test]
    fn trimming_counts_chars_not_bytes() {
        let mut buffer = OutputBuffer::new();
        buffer.append("ééé", 2);
        assert_eq!(buffer.as_str(), "éé");
        buffer.append("✓", 2);
        assert_eq!(buffer.as_str(), "é✓");
    }

    #[test]
    fn clear_resets_everything() {
        let mut buffer = OutputBuffer::new();
        buffer.append("abcdef", 3);
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.was_truncated());
        assert_eq!(buffer.as_str(), "");
    }

    #[test]
    fn decoder_joins_split_code_points() {
        let bytes = "a✓b".as_bytes();
        let mut decoder = Utf8Decoder::default();
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "a");
        assert_eq!(second, "✓b");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        let text = decoder.decode(&[b'o', 0xff, b'k']);
        assert_eq!(text, "o\u{fffd}k");
    }

    #[test]
    fn decoder_flushes_dangling_bytes_on_finish() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xe2, 0x9c]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }
}
