//! Per-connection input buffer.
//!
//! The demultiplex loop appends to the buffer; the connection's owner
//! consumes from it. Both sides go through the connection's buffer lock,
//! so the buffer itself needs no synchronization.

/// Append-only/consume-front byte buffer for one logical connection.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    buf: Vec<u8>,
}

impl ByteBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes at the end.
    pub fn write(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True if the buffer contains a complete line.
    pub fn has_line(&self) -> bool {
        self.buf.contains(&b'\n')
    }

    /// Consume up to `n` bytes from the front.
    pub fn read(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    /// Consume everything.
    pub fn read_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Consume one line, up to and including the first newline.
    ///
    /// Without a buffered newline this drains the whole buffer, matching
    /// end-of-stream semantics where the remainder is all there will be.
    pub fn read_line(&mut self) -> Vec<u8> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => self.read(pos + 1),
            None => self.read_all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_all() {
        let mut buf = ByteBuffer::new();
        buf.write(b"hello");
        buf.write(b" world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.read_all(), b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn read_caps_at_available() {
        let mut buf = ByteBuffer::new();
        buf.write(b"abc");
        assert_eq!(buf.read(2), b"ab");
        assert_eq!(buf.read(100), b"c");
        assert_eq!(buf.read(5), b"");
    }

    #[test]
    fn read_line_stops_at_newline() {
        let mut buf = ByteBuffer::new();
        buf.write(b"one\ntwo\n");
        assert_eq!(buf.read_line(), b"one\n");
        assert_eq!(buf.read_line(), b"two\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn read_line_without_newline_drains() {
        let mut buf = ByteBuffer::new();
        buf.write(b"partial");
        assert!(!buf.has_line());
        assert_eq!(buf.read_line(), b"partial");
    }

    #[test]
    fn has_line_sees_embedded_newline() {
        let mut buf = ByteBuffer::new();
        buf.write(b"a\nb");
        assert!(buf.has_line());
    }
}
