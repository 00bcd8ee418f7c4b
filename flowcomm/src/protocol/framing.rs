//! Resumable walking of length-prefixed object frames across buffers.
//!
//! [`FrameScanner`] only counts bytes, to find where a message ends before
//! anything is decoded. [`FrameReader`] collects each frame's bytes for
//! decoding. Both keep their position so a prefix or body split across
//! buffer boundaries continues in the next buffer.

use super::header::FRAME_PREFIX;

#[derive(Debug, Clone)]
struct Cursor {
    prefix: [u8; FRAME_PREFIX],
    prefix_len: usize,
    body_remaining: usize,
}

impl Cursor {
    fn new() -> Self {
        Self {
            prefix: [0; FRAME_PREFIX],
            prefix_len: 0,
            body_remaining: 0,
        }
    }

    /// Consume prefix bytes; returns bytes used and, once the prefix is
    /// whole, the frame length.
    fn feed_prefix(&mut self, bytes: &[u8]) -> (usize, Option<usize>) {
        let take = (FRAME_PREFIX - self.prefix_len).min(bytes.len());
        self.prefix[self.prefix_len..self.prefix_len + take].copy_from_slice(&bytes[..take]);
        self.prefix_len += take;
        if self.prefix_len < FRAME_PREFIX {
            return (take, None);
        }
        let len = u32::from_le_bytes(self.prefix) as usize;
        self.prefix_len = 0;
        (take, Some(len))
    }
}

/// Tracks whether every byte of a message body has arrived.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    expected: usize,
    seen: usize,
    in_body: bool,
    cursor: Cursor,
}

impl FrameScanner {
    pub fn new(expected_objects: usize) -> Self {
        Self {
            expected: expected_objects,
            seen: 0,
            in_body: false,
            cursor: Cursor::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.seen == self.expected
    }

    /// Walk `bytes`, stopping at the end of the message. Returns how many
    /// bytes belong to this message.
    pub fn scan(&mut self, bytes: &[u8]) -> usize {
        let mut pos = 0;
        while !self.is_complete() && pos < bytes.len() {
            if self.in_body {
                let take = self.cursor.body_remaining.min(bytes.len() - pos);
                self.cursor.body_remaining -= take;
                pos += take;
                if self.cursor.body_remaining == 0 {
                    self.in_body = false;
                    self.seen += 1;
                }
            } else {
                let (used, len) = self.cursor.feed_prefix(&bytes[pos..]);
                pos += used;
                if let Some(len) = len {
                    if len == 0 {
                        self.seen += 1;
                    } else {
                        self.in_body = true;
                        self.cursor.body_remaining = len;
                    }
                }
            }
        }
        pos
    }
}

/// Collects frame bytes for decoding.
#[derive(Debug, Clone)]
pub struct FrameReader {
    cursor: Cursor,
    body: Option<Vec<u8>>,
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            cursor: Cursor::new(),
            body: None,
        }
    }

    /// Feed bytes; returns the number consumed and a frame once one is
    /// whole. At most one frame is returned per call.
    pub fn feed(&mut self, bytes: &[u8]) -> (usize, Option<Vec<u8>>) {
        let mut pos = 0;
        if self.body.is_none() {
            let (used, len) = self.cursor.feed_prefix(bytes);
            pos += used;
            match len {
                Some(0) => return (pos, Some(Vec::new())),
                Some(len) => {
                    self.body = Some(Vec::with_capacity(len));
                    self.cursor.body_remaining = len;
                }
                None => return (pos, None),
            }
        }
        let take = self.cursor.body_remaining.min(bytes.len() - pos);
        if let Some(body) = self.body.as_mut() {
            body.extend_from_slice(&bytes[pos..pos + take]);
        }
        pos += take;
        self.cursor.body_remaining -= take;
        if self.cursor.body_remaining == 0 {
            (pos, self.body.take())
        } else {
            (pos, None)
        }
    }
}

/// Append one length-prefixed frame.
pub fn write_frame(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(frames: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for f in frames {
            write_frame(&mut out, f);
        }
        out
    }

    #[test]
    fn test_scanner_across_split_prefix() {
        let bytes = body(&[b"hello", b"", b"world!"]);
        let mut s = FrameScanner::new(3);
        // split inside the second prefix
        assert_eq!(s.scan(&bytes[..11]), 11);
        assert!(!s.is_complete());
        assert_eq!(s.scan(&bytes[11..17]), 6);
        assert!(!s.is_complete());
        assert_eq!(s.scan(&bytes[17..]), bytes.len() - 17);
        assert!(s.is_complete());
    }

    #[test]
    fn test_scanner_stops_at_message_end() {
        let mut bytes = body(&[b"abc"]);
        bytes.extend_from_slice(&[9, 9, 9]);
        let mut s = FrameScanner::new(1);
        assert_eq!(s.scan(&bytes), 7);
        assert!(s.is_complete());
        assert_eq!(s.scan(&bytes[7..]), 0);
    }

    #[test]
    fn test_reader_byte_at_a_time() {
        let bytes = body(&[b"ab", b"", b"xyz"]);
        let mut r = FrameReader::new();
        let mut frames = Vec::new();
        for b in &bytes {
            let (used, frame) = r.feed(std::slice::from_ref(b));
            assert_eq!(used, 1);
            if let Some(f) = frame {
                frames.push(f);
            }
        }
        assert_eq!(frames, vec![b"ab".to_vec(), vec![], b"xyz".to_vec()]);
    }

    #[test]
    fn test_zero_objects_complete_immediately() {
        let mut s = FrameScanner::new(0);
        assert!(s.is_complete());
        assert_eq!(s.scan(&[1, 2, 3]), 0);
    }
}
