use std::io;

/// Outcome of draining a reader into the buffer. End of stream is reported
/// as a value so the session state machine can treat it uniformly with
/// every other disconnect.
#[derive(Debug, Eq, PartialEq)]
pub struct Ingress {
    pub received: usize,
    pub closed: bool,
}

/// A fixed-capacity byte FIFO. Data is appended at the tail and consumed
/// from the head; the backing storage is compacted whenever spare room is
/// requested. Capacity bounds every per-session buffer in the system, so a
/// frame that cannot fit is detected rather than grown around.
pub struct Buffer {
    data: Box<[u8]>,
    head: usize,
    tail: usize,
}

impl Buffer {
    #[inline]
    pub fn new(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.tail - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.data.len() - self.len()
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..self.tail]
    }

    /// Consume `count` bytes from the front of the buffer.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        debug_assert!(count <= self.len());

        self.head += count;

        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Slice containing free capacity to be written. Compacts first so the
    /// full free capacity is contiguous.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        self.compact();
        &mut self.data[self.tail..]
    }

    /// Commit `count` bytes previously written into `write_slice`.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        debug_assert!(self.tail + count <= self.data.len());

        self.tail += count;
    }

    /// Append `bytes` at the tail. The caller must have checked
    /// `free_capacity` beforehand.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.free_capacity(), "Buffer overrun");

        let spare = self.write_slice();
        spare[..bytes.len()].copy_from_slice(bytes);
        self.move_tail(bytes.len());
    }

    #[inline]
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
    }

    #[inline]
    fn compact(&mut self) {
        if self.head > 0 {
            self.data.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
    }

    /// Read from the supplied reader until it would block, the stream ends,
    /// or the buffer fills up. `WouldBlock` is absorbed; end of stream is
    /// reported through the returned `Ingress`.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<Ingress> {
        let mut received = 0;

        while self.free_capacity() > 0 {
            match reader.read(self.write_slice()) {
                Ok(0) => return Ok(Ingress { received, closed: true }),
                Ok(count) => {
                    self.move_tail(count);
                    received += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(Ingress { received, closed: false })
    }

    /// Write buffered data to the supplied writer until it would block or
    /// the buffer runs dry. Returns the number of bytes written.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut sent = 0;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.move_head(count);
                    sent += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Reader/writer that transfers at most `chunk` bytes per call and
    /// reports `WouldBlock` when drained or full.
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

        fn drained(&mut self) {
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
    fn test_roundtrip_in_chunks() {
        let payload: Vec<_> = (0..2048).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(payload.clone(), 129, payload.len());
        let mut buffer = Buffer::new(4096);

        let ingress = buffer.ingress(&mut channel).unwrap();

        assert_eq!(ingress, Ingress { received: payload.len(), closed: false });
        assert_eq!(buffer.read_slice(), &payload[..]);

        channel.drained();
        let sent = buffer.egress(&mut channel).unwrap();

        assert_eq!(sent, payload.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], payload[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut stream: &[u8] = &[1, 2, 3];
        let mut buffer = Buffer::new(16);

        let ingress = buffer.ingress(&mut stream).unwrap();

        assert_eq!(ingress, Ingress { received: 3, closed: true });
        assert_eq!(buffer.read_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_ingress_stops_at_capacity() {
        let payload = vec![7u8; 64];
        let mut channel = MockChannel::new(payload, 16, 0);
        let mut buffer = Buffer::new(32);

        let ingress = buffer.ingress(&mut channel).unwrap();

        assert_eq!(ingress, Ingress { received: 32, closed: false });
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroSink;

        impl io::Write for ZeroSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new(16);
        buffer.append(&[1]);

        let result = buffer.egress(&mut ZeroSink);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_compaction_reclaims_consumed_space() {
        let mut buffer = Buffer::new(8);

        buffer.append(&[1, 2, 3, 4, 5, 6]);
        buffer.move_head(4);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.free_capacity(), 6);

        // The append only fits if the consumed front is compacted away.
        buffer.append(&[7, 8, 9, 10, 11, 12]);

        assert_eq!(buffer.read_slice(), &[5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    #[should_panic(expected = "Buffer overrun")]
    fn test_append_past_capacity() {
        let mut buffer = Buffer::new(4);

        buffer.append(&[1, 2, 3, 4, 5]);
    }
}
