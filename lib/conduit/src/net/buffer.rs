use slice_deque::SliceDeque;
use std::io;

type ByteDeque = SliceDeque<u8>;

/// Buffers are sized in multiples of this increment.
pub const BUF_SIZE_INCREMENT: usize = 4096;

/// A fixed-capacity buffered FIFO byte queue. Data is appended at the tail
/// and read from the head.
pub struct Buffer {
    data: ByteDeque,
    size: usize,
}

impl Buffer {
    #[inline]
    pub fn new(size: usize) -> Buffer {
        if size == 0 || size % BUF_SIZE_INCREMENT != 0 {
            panic!(
                "Buffer size must be a non-zero multiple of {}, got {}",
                BUF_SIZE_INCREMENT, size
            );
        }

        let mut data = ByteDeque::new();
        data.reserve(size);
        Buffer { data, size }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The configured capacity of the buffer.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.size - self.data.len()
    }

    /// Advance the head, discarding consumed data.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        unsafe { self.data.move_head(count as isize) }
    }

    /// Advance the tail, committing written data.
    #[inline]
    pub fn move_tail(&mut self, count: usize) {
        unsafe { self.data.move_tail(count as isize) }
    }

    /// Slice containing buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        unsafe { self.data.move_head(len as isize) };
    }

    /// Slice containing free capacity to be written.
    #[inline]
    pub fn write_slice(&mut self) -> &mut [u8] {
        unsafe { &mut self.data.tail_head_slice()[..] }
    }

    /// Appends bytes to the buffer. The caller must check `free_capacity`
    /// upfront.
    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.free_capacity(), "Buffer overrun");
        let offset = {
            let slice = self.write_slice();
            slice[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        };
        self.move_tail(offset);
    }

    /// Performs a single read from the supplied reader into the free
    /// capacity. Returns the number of bytes read; `Ok(0)` means either the
    /// reader reached end-of-stream or the buffer is full.
    #[inline]
    pub fn fill_once<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let free = self.free_capacity();

        if free == 0 {
            return Ok(0);
        }

        let count = {
            // The deque may have reserved more than the configured size;
            // never read past the capacity cap.
            let slice = self.write_slice();
            let limit = std::cmp::min(slice.len(), free);
            reader.read(&mut slice[..limit])?
        };

        self.move_tail(count);
        Ok(count)
    }

    /// Performs a single write of the buffered data to the supplied writer.
    /// Returns the number of bytes written; a zero-length write on a
    /// non-empty buffer is reported as an error.
    #[inline]
    pub fn drain_once<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        if self.data.is_empty() {
            return Ok(0);
        }

        let count = writer.write(&self.data)?;

        if count == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        self.move_head(count);
        Ok(count)
    }

    /// Mutable slice containing data.
    #[allow(dead_code)]
    #[inline]
    pub(crate) fn data_slice(&mut self) -> &mut [u8] {
        self.data.as_mut_slice()
    }
}
