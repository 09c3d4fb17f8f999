//! Chained Byte Buffers
//!
//! Read and write queues on a connection are chains of reference-counted
//! chunks. Cloning a buffer shares the underlying chunks; only a uniquely
//! owned tail chunk may be extended in place, so shared buffers grow by
//! appending fresh chunks instead of mutating what another holder sees.

use std::collections::VecDeque;
use std::sync::Arc;

/// Chunks at or below this capacity are eligible for recycling into a
/// drained queue's peer instead of being dropped.
pub const RECYCLE_LIMIT: usize = 64 * 1024;

/// Minimum allocation for a fresh writable chunk
const MIN_CHUNK: usize = 1024;

/// One reference-counted chunk of a buffer chain
#[derive(Debug, Clone)]
struct Chunk {
    data: Arc<Vec<u8>>,
    start: usize,
    end: usize,
}

impl Chunk {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Arc::new(Vec::with_capacity(capacity.max(MIN_CHUNK))),
            start: 0,
            end: 0,
        }
    }

    fn from_vec(data: Vec<u8>) -> Self {
        let end = data.len();
        Self {
            data: Arc::new(data),
            start: 0,
            end,
        }
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn is_unique(&self) -> bool {
        Arc::strong_count(&self.data) == 1
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }
}

/// An ordered, growable sequence of bytes held as a chain of chunks
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    chunks: VecDeque<Chunk>,
    /// Bytes zero-extended by `prepare_to_write` but not yet committed
    pending_write: usize,
}

impl Buffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer owning a byte vector
    pub fn from_vec(data: Vec<u8>) -> Self {
        let mut buffer = Self::new();
        if !data.is_empty() {
            buffer.chunks.push_back(Chunk::from_vec(data));
        }
        buffer
    }

    /// Number of readable bytes in the chain
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    /// True when no readable bytes remain
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.len() == 0)
    }

    /// Total allocated capacity across the chain
    pub fn capacity(&self) -> usize {
        self.chunks.iter().map(|c| c.data.capacity()).sum()
    }

    /// True when every chunk in the chain has exactly one holder
    pub fn is_unique(&self) -> bool {
        self.chunks.iter().all(Chunk::is_unique)
    }

    /// Contiguous view of all readable bytes, compacting the chain first
    /// when it holds more than one chunk.
    pub fn data(&mut self) -> &[u8] {
        debug_assert_eq!(self.pending_write, 0, "data() with uncommitted write");
        if self.chunks.len() > 1 {
            self.compact();
        }
        match self.chunks.front() {
            Some(chunk) => chunk.as_slice(),
            None => &[],
        }
    }

    fn compact(&mut self) {
        let total = self.len();
        let mut merged = Vec::with_capacity(total);
        for chunk in &self.chunks {
            merged.extend_from_slice(chunk.as_slice());
        }
        self.chunks.clear();
        if !merged.is_empty() {
            self.chunks.push_back(Chunk::from_vec(merged));
        }
    }

    /// Copy all readable bytes out into a vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.as_slice());
        }
        out
    }

    /// Append bytes, extending the tail chunk in place when it is the
    /// only holder and copying into a new chunk otherwise.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        debug_assert_eq!(self.pending_write, 0, "append() with uncommitted write");

        if let Some(tail) = self.chunks.back_mut() {
            if tail.is_unique() && tail.end == tail.data.len() {
                // Sole holder, no split-off tail: extend in place.
                let vec = Arc::get_mut(&mut tail.data).expect("unique chunk");
                vec.extend_from_slice(bytes);
                tail.end = vec.len();
                return;
            }
        }
        self.chunks.push_back(Chunk::from_vec(bytes.to_vec()));
    }

    /// Append another buffer's chain to the end of this one
    pub fn merge_back(&mut self, mut other: Buffer) {
        debug_assert_eq!(other.pending_write, 0);
        other.drop_empty_chunks();
        self.chunks.append(&mut other.chunks);
    }

    /// Prepend another buffer's chain to the front of this one
    pub fn merge_front(&mut self, mut other: Buffer) {
        debug_assert_eq!(other.pending_write, 0);
        other.drop_empty_chunks();
        while let Some(chunk) = other.chunks.pop_back() {
            self.chunks.push_front(chunk);
        }
    }

    /// Remove and discard `n` bytes from the front of the chain.
    ///
    /// The final chunk's allocation is retained even when fully consumed
    /// so a drained queue can recycle it.
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                debug_assert!(false, "consume past end of buffer");
                return;
            };
            let take = n.min(front.len());
            front.start += take;
            n -= take;
            let front_empty = front.len() == 0;
            if front_empty && self.chunks.len() > 1 {
                self.chunks.pop_front();
            } else if front_empty {
                break;
            }
        }
    }

    /// Split off and return the first `n` bytes as a new buffer, sharing
    /// chunk storage where a chunk does not straddle the split point.
    pub fn split(&mut self, mut n: usize) -> Buffer {
        debug_assert!(n <= self.len(), "split past end of buffer");
        let mut head = Buffer::new();
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() <= n {
                n -= front.len();
                let chunk = self.chunks.pop_front().expect("front exists");
                head.chunks.push_back(chunk);
            } else {
                // Chunk straddles the boundary: share the storage with
                // two disjoint ranges.
                let mut taken = front.clone();
                taken.end = taken.start + n;
                front.start += n;
                head.chunks.push_back(taken);
                n = 0;
            }
        }
        head
    }

    /// Reserve `n` writable bytes at the tail and return them.
    ///
    /// The returned slice is zero-filled scratch space; the caller reports
    /// how much of it became valid via [`write_complete`].
    ///
    /// [`write_complete`]: Buffer::write_complete
    pub fn prepare_to_write(&mut self, n: usize) -> &mut [u8] {
        debug_assert_eq!(self.pending_write, 0, "nested prepare_to_write");

        let reuse_tail = match self.chunks.back() {
            Some(tail) => tail.is_unique() && tail.end == tail.data.len(),
            None => false,
        };
        if !reuse_tail {
            self.chunks.push_back(Chunk::with_capacity(n));
        }

        let tail = self.chunks.back_mut().expect("tail exists");
        let vec = Arc::get_mut(&mut tail.data).expect("unique chunk");
        vec.resize(tail.end + n, 0);
        self.pending_write = n;
        let start = tail.end;
        let vec = Arc::get_mut(&mut tail.data).expect("unique chunk");
        &mut vec[start..start + n]
    }

    /// Commit `n` bytes of the scratch space handed out by
    /// [`prepare_to_write`]; the rest is returned to spare capacity.
    ///
    /// [`prepare_to_write`]: Buffer::prepare_to_write
    pub fn write_complete(&mut self, n: usize) {
        assert!(n <= self.pending_write, "committed more than prepared");
        let tail = self.chunks.back_mut().expect("prepare_to_write ran first");
        tail.end += n;
        let end = tail.end;
        let vec = Arc::get_mut(&mut tail.data).expect("unique chunk");
        vec.truncate(end);
        self.pending_write = 0;
    }

    /// Recycle this drained queue's final chunk into `target`.
    ///
    /// Applies only when this buffer is empty, its remaining chunk is
    /// uniquely owned and at most [`RECYCLE_LIMIT`] bytes of capacity, and
    /// `target` is empty with less allocated capacity. Returns whether the
    /// chunk moved.
    pub fn try_recycle_into(&mut self, target: &mut Buffer) -> bool {
        if !self.is_empty() || !target.is_empty() {
            return false;
        }
        let Some(chunk) = self.chunks.back() else {
            return false;
        };
        if !chunk.is_unique() || chunk.data.capacity() > RECYCLE_LIMIT {
            return false;
        }
        if target.capacity() >= chunk.data.capacity() {
            return false;
        }

        let mut chunk = self.chunks.pop_back().expect("chunk exists");
        let vec = Arc::get_mut(&mut chunk.data).expect("unique chunk");
        vec.clear();
        chunk.start = 0;
        chunk.end = 0;
        target.chunks.clear();
        target.chunks.push_back(chunk);
        true
    }

    fn drop_empty_chunks(&mut self) {
        self.chunks.retain(|c| c.len() > 0);
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Buffer::from_vec(data)
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Buffer::from_vec(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_consume() {
        let mut buf = Buffer::new();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.data(), b"hello world");

        buf.consume(6);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.data(), b"world");

        buf.consume(5);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_split_shares_storage() {
        let mut buf = Buffer::from_vec(b"0123456789".to_vec());
        let head = buf.split(4);
        assert_eq!(head.to_vec(), b"0123");
        assert_eq!(buf.to_vec(), b"456789");
        // The straddled chunk is shared between both buffers.
        assert!(!buf.is_unique());
        drop(head);
        assert!(buf.is_unique());
    }

    #[test]
    fn test_shared_buffer_copy_on_extend() {
        let mut buf = Buffer::from_vec(b"abc".to_vec());
        let shared = buf.clone();
        assert!(!buf.is_unique());

        // Extending a shared buffer must not disturb the other holder.
        buf.append(b"def");
        assert_eq!(buf.to_vec(), b"abcdef");
        assert_eq!(shared.to_vec(), b"abc");
    }

    #[test]
    fn test_unique_buffer_extends_in_place() {
        let mut buf = Buffer::from_vec(b"abc".to_vec());
        assert!(buf.is_unique());
        let chunks_before = buf.chunks.len();
        buf.append(b"def");
        assert_eq!(buf.chunks.len(), chunks_before);
        assert_eq!(buf.to_vec(), b"abcdef");
    }

    #[test]
    fn test_prepare_and_commit_write() {
        let mut buf = Buffer::new();
        let scratch = buf.prepare_to_write(8);
        assert_eq!(scratch.len(), 8);
        scratch[..3].copy_from_slice(b"xyz");
        buf.write_complete(3);
        assert_eq!(buf.to_vec(), b"xyz");
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_merge_front_and_back() {
        let mut buf = Buffer::from_vec(b"middle".to_vec());
        buf.merge_front(Buffer::from_vec(b"head-".to_vec()));
        buf.merge_back(Buffer::from_vec(b"-tail".to_vec()));
        assert_eq!(buf.data(), b"head-middle-tail");
    }

    #[test]
    fn test_recycle_drained_chunk() {
        let mut writeq = Buffer::new();
        writeq.append(b"queued data");
        writeq.consume(writeq.len());
        assert!(writeq.is_empty());

        let mut readq = Buffer::new();
        assert!(writeq.try_recycle_into(&mut readq));
        assert!(readq.is_empty());
        assert!(readq.capacity() > 0);

        // A second recycle has nothing left to move.
        assert!(!writeq.try_recycle_into(&mut readq));
    }

    #[test]
    fn test_recycle_refuses_large_chunk() {
        let mut writeq = Buffer::new();
        writeq.append(&vec![0u8; RECYCLE_LIMIT * 2]);
        writeq.consume(writeq.len());

        let mut readq = Buffer::new();
        assert!(!writeq.try_recycle_into(&mut readq));
    }

    #[test]
    fn test_recycle_refuses_shared_chunk() {
        let mut writeq = Buffer::new();
        writeq.append(b"shared");
        let _other = writeq.clone();
        writeq.consume(writeq.len());

        let mut readq = Buffer::new();
        assert!(!writeq.try_recycle_into(&mut readq));
    }

    #[test]
    fn test_split_then_merge_round_trip() {
        let mut buf = Buffer::from_vec(b"0123456789".to_vec());
        let head = buf.split(5);
        let mut rejoined = head;
        rejoined.merge_back(buf);
        assert_eq!(rejoined.to_vec(), b"0123456789");
    }
}
