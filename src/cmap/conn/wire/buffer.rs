use crate::{
    error::{Error, Result},
    linked_list::LinkedList,
};

/// Accumulates appended byte chunks and hands back exact spans on demand,
/// transparently across chunk boundaries. This is what turns an arbitrarily
/// chunked byte stream back into length-prefixed wire frames.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    chunks: LinkedList<Vec<u8>>,
    length: usize,
}

impl BufferPool {
    pub(crate) fn new() -> Self {
        Self {
            chunks: LinkedList::new(),
            length: 0,
        }
    }

    /// The total number of buffered bytes.
    pub(crate) fn len(&self) -> usize {
        self.length
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Appends a chunk at the tail.
    pub(crate) fn append(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.length += chunk.len();
        self.chunks.push(chunk);
    }

    /// Returns the little-endian 32-bit length prefix formed by the first
    /// four buffered bytes without consuming them, or `None` if fewer than
    /// four bytes are buffered. If the prefix spans chunks, the four bytes
    /// are consumed and re-inserted at the head to keep the chunk list
    /// consistent.
    pub(crate) fn peek_length_prefix(&mut self) -> Option<i32> {
        if self.length < 4 {
            return None;
        }
        if let Some(first) = self.chunks.first() {
            if first.len() >= 4 {
                let mut prefix = [0u8; 4];
                prefix.copy_from_slice(&first[..4]);
                return Some(i32::from_le_bytes(prefix));
            }
        }

        let bytes = self.read(4).ok()?;
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&bytes);
        self.chunks.unshift(bytes);
        self.length += 4;
        Some(i32::from_le_bytes(prefix))
    }

    /// Reads exactly `count` bytes from the head. Fails on a negative count,
    /// returns an empty result (consuming nothing) if fewer than `count`
    /// bytes are buffered, and otherwise never returns more or fewer bytes
    /// than requested.
    pub(crate) fn read(&mut self, count: i32) -> Result<Vec<u8>> {
        if count < 0 {
            return Err(Error::invalid_argument(format!(
                "cannot read {} bytes from a buffer pool",
                count
            )));
        }
        let count = count as usize;
        if count == 0 || count > self.length {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let Some(mut chunk) = self.chunks.shift() else {
                return Err(Error::internal(
                    "buffer pool length out of sync with its chunks",
                ));
            };
            let needed = count - out.len();
            if chunk.len() > needed {
                let rest = chunk.split_off(needed);
                self.chunks.unshift(rest);
            }
            out.extend_from_slice(&chunk);
        }
        self.length -= count;
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::BufferPool;

    #[test]
    fn read_reconstructs_concatenation_across_chunks() {
        let mut pool = BufferPool::new();
        pool.append(vec![1, 2, 3]);
        pool.append(vec![4]);
        pool.append(vec![5, 6, 7, 8, 9]);
        assert_eq!(pool.len(), 9);

        let first = pool.read(6).unwrap();
        let rest = pool.read(3).unwrap();
        assert_eq!(first, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(rest, vec![7, 8, 9]);
        assert!(pool.is_empty());
    }

    #[test]
    fn insufficient_data_yields_empty_not_partial() {
        let mut pool = BufferPool::new();
        pool.append(vec![1, 2]);
        assert_eq!(pool.read(3).unwrap(), Vec::<u8>::new());
        // Nothing was consumed by the failed read.
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.read(2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn read_on_empty_pool_is_empty() {
        let mut pool = BufferPool::new();
        assert_eq!(pool.read(1).unwrap(), Vec::<u8>::new());
        assert_eq!(pool.read(0).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn negative_read_fails() {
        let mut pool = BufferPool::new();
        pool.append(vec![1, 2, 3, 4]);
        assert!(pool.read(-1).is_err());
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn peek_within_first_chunk_does_not_consume() {
        let mut pool = BufferPool::new();
        pool.append(vec![16, 0, 0, 0, 99]);
        assert_eq!(pool.peek_length_prefix(), Some(16));
        assert_eq!(pool.len(), 5);
        assert_eq!(pool.read(5).unwrap(), vec![16, 0, 0, 0, 99]);
    }

    #[test]
    fn peek_across_chunk_boundaries_reassembles_the_prefix() {
        let mut pool = BufferPool::new();
        pool.append(vec![0x10]);
        pool.append(vec![0x20, 0x00]);
        pool.append(vec![0x00, 0xaa, 0xbb]);
        assert_eq!(pool.peek_length_prefix(), Some(0x2010));
        // Peeking consumed nothing overall.
        assert_eq!(pool.len(), 6);
        assert_eq!(
            pool.read(6).unwrap(),
            vec![0x10, 0x20, 0x00, 0x00, 0xaa, 0xbb]
        );
    }

    #[test]
    fn peek_with_fewer_than_four_bytes_is_unavailable() {
        let mut pool = BufferPool::new();
        pool.append(vec![1, 2, 3]);
        assert_eq!(pool.peek_length_prefix(), None);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn partial_chunk_remainder_returns_to_the_head() {
        let mut pool = BufferPool::new();
        pool.append(vec![1, 2, 3, 4, 5]);
        assert_eq!(pool.read(2).unwrap(), vec![1, 2]);
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.read(3).unwrap(), vec![3, 4, 5]);
    }
}
