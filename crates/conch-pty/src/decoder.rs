//! Incremental chunk boundary adjustment for PTY output.
//!
//! A single `read` can end in the middle of a multi-byte character. The
//! chunker holds such a trailing prefix back and prepends it to the next read,
//! so every published chunk ends on a complete character.

use crate::config::OutputEncoding;

/// Longest possible incomplete UTF-8 prefix (a 4-byte sequence minus one).
const MAX_PENDING: usize = 3;

/// Splits raw reads into chunks that end on decoding-unit boundaries.
#[derive(Debug)]
pub struct Utf8Chunker {
    encoding: OutputEncoding,
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new(encoding: OutputEncoding) -> Self {
        Self {
            encoding,
            pending: Vec::with_capacity(MAX_PENDING),
        }
    }

    /// Feed a freshly read slice, returning the bytes that are safe to publish.
    ///
    /// The result may be empty when the whole input is an incomplete prefix.
    /// Bytes that can never form a valid character are passed through in
    /// place, only a valid-but-unfinished tail is held back.
    pub fn push(&mut self, data: &[u8]) -> Vec<u8> {
        let mut chunk = std::mem::take(&mut self.pending);
        chunk.extend_from_slice(data);

        if self.encoding == OutputEncoding::Binary {
            return chunk;
        }

        if let Some(split) = incomplete_tail_start(&chunk) {
            self.pending = chunk.split_off(split);
        }
        chunk
    }

    /// Take whatever is still held back. Called once the stream is closing.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Index at which a trailing incomplete UTF-8 sequence begins, if any.
fn incomplete_tail_start(buf: &[u8]) -> Option<usize> {
    let mut offset = 0;
    loop {
        match std::str::from_utf8(&buf[offset..]) {
            Ok(_) => return None,
            Err(e) => match e.error_len() {
                // Invalid bytes mid-stream: skip past them and keep scanning.
                Some(len) => offset += e.valid_up_to() + len,
                // Unexpected end of input: the rest is an unfinished character.
                None => return Some(offset + e.valid_up_to()),
            },
        }
    }
}

/// Whether `byte` is a UTF-8 continuation byte (`10xxxxxx`).
pub(crate) fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passes_through() {
        let mut chunker = Utf8Chunker::new(OutputEncoding::Utf8);
        assert_eq!(chunker.push(b"hello\r\n"), b"hello\r\n");
        assert!(!chunker.has_pending());
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_split_character_is_held_back() {
        let text = "caf\u{e9} \u{1F600}".as_bytes();
        // Cut inside the 4-byte emoji.
        let (first, second) = text.split_at(text.len() - 2);

        let mut chunker = Utf8Chunker::new(OutputEncoding::Utf8);
        let a = chunker.push(first);
        assert_eq!(a, "caf\u{e9} ".as_bytes());
        assert!(chunker.has_pending());

        let b = chunker.push(second);
        assert_eq!(b, "\u{1F600}".as_bytes());
        assert!(!chunker.has_pending());
    }

    #[test]
    fn test_every_split_point_reassembles() {
        let text = "a\u{e9}\u{4e2d}\u{1F680}z".as_bytes();
        for cut in 0..=text.len() {
            let mut chunker = Utf8Chunker::new(OutputEncoding::Utf8);
            let a = chunker.push(&text[..cut]);
            let b = chunker.push(&text[cut..]);
            assert!(std::str::from_utf8(&a).is_ok(), "cut {cut}: {a:?}");
            assert!(std::str::from_utf8(&b).is_ok(), "cut {cut}: {b:?}");
            assert_eq!([a, b].concat(), text);
            assert_eq!(chunker.finish(), None);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let text = "\u{e9}\u{e9}".as_bytes();
        let mut chunker = Utf8Chunker::new(OutputEncoding::Utf8);
        assert!(chunker.push(&text[..1]).is_empty());
        assert_eq!(chunker.push(&text[1..2]), "\u{e9}".as_bytes());
        assert!(chunker.push(&text[2..3]).is_empty());
        assert_eq!(chunker.push(&text[3..]), "\u{e9}".as_bytes());
    }

    #[test]
    fn test_invalid_bytes_are_not_held() {
        let mut chunker = Utf8Chunker::new(OutputEncoding::Utf8);
        // 0xFF can never start a character; the trailing 0xC3 can.
        let out = chunker.push(&[b'a', 0xFF, b'b', 0xC3]);
        assert_eq!(out, vec![b'a', 0xFF, b'b']);
        assert_eq!(chunker.finish(), Some(vec![0xC3]));
    }

    #[test]
    fn test_unfinished_tail_flushed_on_finish() {
        let mut chunker = Utf8Chunker::new(OutputEncoding::Utf8);
        assert_eq!(chunker.push(&[b'x', 0xE4, 0xB8]), b"x");
        assert_eq!(chunker.finish(), Some(vec![0xE4, 0xB8]));
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_binary_never_holds() {
        let mut chunker = Utf8Chunker::new(OutputEncoding::Binary);
        assert_eq!(chunker.push(&[b'x', 0xE4, 0xB8]), vec![b'x', 0xE4, 0xB8]);
        assert!(!chunker.has_pending());
    }

    #[test]
    fn test_continuation_detection() {
        assert!(is_continuation(0x80));
        assert!(is_continuation(0xBF));
        assert!(!is_continuation(b'a'));
        assert!(!is_continuation(0xC3));
    }
}
