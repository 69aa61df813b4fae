/// Streaming UTF-8 decoder.
///
/// A multi-byte sequence split across two reads is held back and completed by
/// the next read instead of being replaced. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held back from the previous read.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(bytes);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is held back. An incomplete sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sequence_is_joined() {
        let fire = "🔥".as_bytes();
        let mut d = Utf8ChunkDecoder::new();
        assert_eq!(d.decode(&fire[..2]), "");
        assert_eq!(d.pending(), 2);
        assert_eq!(d.decode(&fire[2..]), "🔥");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn invalid_byte_is_replaced() {
        let mut d = Utf8ChunkDecoder::new();
        assert_eq!(d.decode(b"ok\xffgo"), "ok\u{fffd}go");
    }

    #[test]
    fn dangling_prefix_flushes_to_replacement() {
        let mut d = Utf8ChunkDecoder::new();
        assert_eq!(d.decode(&[b'a', 0xe2, 0x82]), "a");
        assert_eq!(d.finish(), "\u{fffd}");
        assert_eq!(d.finish(), "");
    }
}
