use std::io;

// Read syscalls pull at most this much per call; the loop drains the socket
// until it would block, so this only bounds the per-call copy.
const READ_CHUNK: usize = 8192;

/// A growable byte buffer owned by a session. Allocation is lazy: an idle
/// session holds no heap at all, and the backing storage is released as soon
/// as the buffer drains.
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            start: 0,
        }
    }

    /// The number of unread bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unread data.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Unread data, mutable (ciphers decrypt in place here).
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..]
    }

    /// Appends bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Marks `count` bytes as read. Releases the backing storage once
    /// everything has been consumed.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        self.start += count;
        debug_assert!(self.start <= self.data.len());

        if self.start == self.data.len() {
            self.release();
        }
    }

    /// Drops the backing storage outright.
    #[inline]
    pub fn release(&mut self) {
        self.data = Vec::new();
        self.start = 0;
    }

    /// Reads from `reader` until it would block, appending at the tail.
    /// Consumed front space is compacted away first so a long-lived session
    /// with a partial packet does not grow without bound.
    ///
    /// A zero-length read means the peer closed the connection and is
    /// reported as `UnexpectedEof`.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        if self.start > 0 {
            self.data.drain(..self.start);
            self.start = 0;
        }

        let mut total = 0;

        loop {
            let old_len = self.data.len();
            self.data.resize(old_len + READ_CHUNK, 0);

            match reader.read(&mut self.data[old_len..]) {
                Ok(0) => {
                    self.data.truncate(old_len);
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(count) => {
                    self.data.truncate(old_len + count);
                    total += count;
                }
                Err(err) => {
                    self.data.truncate(old_len);

                    if err.kind() == io::ErrorKind::WouldBlock && total > 0 {
                        return Ok(total);
                    }

                    return Err(err);
                }
            }
        }
    }

    /// Writes the unread contents to `writer`, advancing past whatever was
    /// accepted. Would-block propagates to the caller with the remainder
    /// still buffered for the next writable tick.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let orig = self.start;

        while self.start < self.data.len() {
            let count = writer.write(&self.data[self.start..])?;

            if count == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }

            self.start += count;
        }

        let sent = self.start - orig;

        if self.start == self.data.len() {
            self.release();
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// A reader/writer that transfers data in fixed-size chunks and then
    /// reports would-block, like a non-blocking socket.
    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..(self.cursor + count)]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..40000u32).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new();

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.as_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_nothing_available() {
        let mut channel = MockChannel::new(Vec::new(), 500, 0);
        let mut buffer = Buffer::new();

        let result = buffer.ingress(&mut channel);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ingress_peer_close() {
        let mut buffer = Buffer::new();

        // An empty Cursor yields a zero-length read, i.e. peer close.
        let result = buffer.ingress(io::Cursor::new(Vec::<u8>::new()));

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_egress_short_write_keeps_remainder() {
        let mut buffer = Buffer::new();
        buffer.extend(&[1, 2, 3, 4, 5, 6]);

        // Accepts four bytes, then blocks.
        let mut channel = MockChannel::new(Vec::new(), 4, 4);
        let result = buffer.egress(&mut channel);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WouldBlock);
        assert_eq!(buffer.as_slice(), &[5, 6]);

        channel.max_size = 16;
        buffer.egress(&mut channel).unwrap();

        assert!(buffer.is_empty());
        assert_eq!(&channel.data[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut zero_vec = [0u8; 0];

        let mut buffer = Buffer::new();
        buffer.extend(&[1]);

        let result = buffer.egress(&mut zero_vec[..]);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_storage_released_when_drained() {
        let mut buffer = Buffer::new();
        buffer.extend(&[0u8; 1024]);

        buffer.consume(1024);

        assert_eq!(buffer.data.capacity(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_compaction_on_ingress() {
        let mut buffer = Buffer::new();
        buffer.extend(&[9u8; 100]);
        buffer.consume(60);

        let mut channel = MockChannel::new(vec![7u8; 10], 10, 10);
        buffer.ingress(&mut channel).unwrap();

        assert_eq!(buffer.start, 0);
        assert_eq!(buffer.len(), 50);
        assert_eq!(&buffer.as_slice()[..40], &[9u8; 40][..]);
        assert_eq!(&buffer.as_slice()[40..], &[7u8; 10][..]);
    }
}
