//! Accumulates token pieces until they form valid UTF-8.
//!
//! A single token can carry part of a multi-byte character. Bindings feed the
//! raw bytes of each sampled token through a [`PieceBuffer`] and hand the
//! coordinator whatever it releases.

/// Byte accumulator for detokenized pieces.
#[derive(Debug, Default)]
pub struct PieceBuffer {
    pending: Vec<u8>,
}

impl PieceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and release the accumulated text if it is complete.
    ///
    /// Returns an empty string while a multi-byte sequence is still open.
    /// Bytes that can never become valid UTF-8 are released lossily so the
    /// buffer does not grow without bound.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(text) => {
                let text = text.to_owned();
                self.pending.clear();
                text
            }
            Err(e) if e.error_len().is_none() => String::new(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                text
            }
        }
    }

    /// Discard any incomplete sequence.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Whether no bytes are waiting for completion.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut buf = PieceBuffer::new();
        assert_eq!(buf.push(b"hello"), "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn split_multibyte_is_held_back() {
        // "é" is 0xC3 0xA9
        let mut buf = PieceBuffer::new();
        assert_eq!(buf.push(&[0xC3]), "");
        assert!(!buf.is_empty());
        assert_eq!(buf.push(&[0xA9, b'!']), "é!");
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_bytes_are_flushed() {
        let mut buf = PieceBuffer::new();
        let out = buf.push(&[0xFF, b'a']);
        assert_eq!(out, "\u{FFFD}a");
        assert!(buf.is_empty());
    }

    #[test]
    fn clear_drops_partial_sequence() {
        let mut buf = PieceBuffer::new();
        buf.push(&[0xE2, 0x82]);
        buf.clear();
        assert_eq!(buf.push(b"x"), "x");
    }
}
