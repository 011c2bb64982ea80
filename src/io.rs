//! Buffered io primitives.
use bytes::BytesMut;
use std::{
    io,
    task::{Context, Poll},
};

pub fn poll_read<R, B>(reader: &mut R, buf: &mut B, cx: &mut Context) -> Poll<io::Result<usize>>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
    B: bytes::BufMut + ?Sized,
{
    use std::{pin::Pin, task::ready};
    use tokio::io::ReadBuf;

    if !buf.has_remaining_mut() {
        return Poll::Ready(Ok(0));
    }

    let n = {
        let dst = buf.chunk_mut();
        let dst = unsafe { dst.as_uninit_slice_mut() };
        let mut buf = ReadBuf::uninit(dst);
        let ptr = buf.filled().as_ptr();
        ready!(Pin::new(reader).poll_read(cx, &mut buf)?);

        // Ensure the pointer does not change from under us
        assert_eq!(ptr, buf.filled().as_ptr());
        buf.filled().len()
    };

    // Safety: This is guaranteed to be the number of initialized (and read)
    // bytes due to the invariants provided by `ReadBuf::filled`.
    unsafe {
        buf.advance_mut(n);
    }

    Poll::Ready(Ok(n))
}

pub fn poll_write_all<W, B>(writer: &mut W, buf: &mut B, cx: &mut Context) -> Poll<io::Result<()>>
where
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
    B: bytes::Buf + ?Sized,
{
    use std::{io::IoSlice, pin::Pin, task::ready};

    const MAX_VECTOR_ELEMENTS: usize = 64;

    while buf.has_remaining() {
        let n = if writer.is_write_vectored() {
            let mut slices = [IoSlice::new(&[]); MAX_VECTOR_ELEMENTS];
            let cnt = buf.chunks_vectored(&mut slices);
            ready!(Pin::new(&mut *writer).poll_write_vectored(cx, &slices[..cnt]))?
        } else {
            ready!(Pin::new(&mut *writer).poll_write(cx, buf.chunk())?)
        };
        buf.advance(n);
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
        }
    }

    Poll::Ready(Ok(()))
}

const MIN_CAPACITY: usize = 4096;

/// Grow-on-demand output buffer for outgoing frontend messages.
///
/// Messages are encoded straight into the inner [`BytesMut`]; draining happens
/// through [`poll_write_all`]. After a full drain, [`reset`][WriteBuf::reset]
/// steps the next allocation back to half of the previous high-water mark so
/// a single large pipeline burst does not pin its peak allocation for the
/// rest of the connection.
pub struct WriteBuf {
    buf: BytesMut,
    /// size of the backing allocation
    allocated: usize,
    /// bytes buffered at once since the last full drain
    high_water: usize,
    /// base allocation size for the next growth cycle
    reclaim: usize,
}

impl WriteBuf {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MIN_CAPACITY),
            allocated: MIN_CAPACITY,
            high_water: 0,
            reclaim: MIN_CAPACITY,
        }
    }

    /// Ensure at least `n` more bytes can be written without reallocating,
    /// doubling from the current target until it fits.
    pub fn reserve(&mut self, n: usize) {
        self.high_water = self.high_water.max(self.buf.len() + n);
        if self.buf.capacity() - self.buf.len() >= n {
            return;
        }
        let mut target = self.allocated.max(self.reclaim);
        while target < self.buf.len() + n {
            target = target.saturating_mul(2);
        }
        self.buf.reserve(target - self.buf.len());
        self.allocated = self.allocated.max(target);
    }

    /// Record the high-water mark and release an oversized allocation.
    ///
    /// Must only be called once all written bytes are drained.
    pub fn reset(&mut self) {
        debug_assert!(self.buf.is_empty(), "reset with undrained bytes");
        self.reclaim = self.high_water.max(MIN_CAPACITY) / 2;
        self.high_water = 0;
        if self.allocated > self.reclaim.max(MIN_CAPACITY) * 2 {
            let next = self.reclaim.max(MIN_CAPACITY);
            self.buf = BytesMut::with_capacity(next);
            self.allocated = next;
        }
    }
}

impl std::ops::Deref for WriteBuf {
    type Target = BytesMut;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::ops::DerefMut for WriteBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl std::fmt::Debug for WriteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuf")
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use bytes::Buf;

    use super::*;

    #[test]
    fn write_buf_growth() {
        let mut buf = WriteBuf::new();
        buf.reserve(MIN_CAPACITY * 3);
        assert!(buf.capacity() >= MIN_CAPACITY * 3);

        buf.extend_from_slice(&[0u8; MIN_CAPACITY * 3]);
        let before = buf.capacity();
        // still fits, no growth
        buf.reserve(before - buf.len());
        assert_eq!(buf.capacity(), before);
    }

    #[test]
    fn write_buf_shrinks_after_burst() {
        let mut buf = WriteBuf::new();
        buf.reserve(MIN_CAPACITY * 64);
        buf.extend_from_slice(&vec![0u8; MIN_CAPACITY * 64]);
        assert!(buf.allocated >= MIN_CAPACITY * 64);

        // drain everything, as the socket would
        let len = buf.len();
        Buf::advance(&mut *buf, len);
        buf.reset();

        // half of the previous high-water mark
        assert_eq!(buf.reclaim, MIN_CAPACITY * 32);

        // a quiet cycle steps the target down and frees the burst allocation
        buf.reserve(16);
        buf.extend_from_slice(&[0u8; 16]);
        Buf::advance(&mut *buf, 16);
        buf.reset();
        assert_eq!(buf.reclaim, MIN_CAPACITY / 2);
        assert!(buf.allocated <= MIN_CAPACITY);

        // and it still grows back on demand
        buf.reserve(MIN_CAPACITY * 8);
        assert!(buf.capacity() >= MIN_CAPACITY * 8);
    }
}
