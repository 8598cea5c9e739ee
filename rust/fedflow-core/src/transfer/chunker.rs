use bytes::Bytes;

use super::Chunk;

/// The archive bytes carried by one frame unless configured otherwise: 2 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Splits an in-memory archive into chunks of at most `chunk_size` bytes. Only the last chunk
/// may be shorter.
pub struct Chunker<'a, T: AsRef<[u8]>> {
    data: &'a T,
    chunk_size: usize,
}

impl<'a, T> Chunker<'a, T>
where
    T: AsRef<[u8]>,
{
    /// A `chunk_size` of `0` stands for [`DEFAULT_CHUNK_SIZE`].
    pub fn new(data: &'a T, chunk_size: usize) -> Self {
        let chunk_size = match chunk_size {
            0 => DEFAULT_CHUNK_SIZE,
            size => size,
        };
        Self { data, chunk_size }
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + 'a {
        self.data
            .as_ref()
            .chunks(self.chunk_size)
            .map(|slice| Chunk::new(Bytes::copy_from_slice(slice)))
    }

    /// The chunks, encoded as frames ready to be sent.
    pub fn frames(&self) -> impl Iterator<Item = Bytes> + 'a {
        self.chunks().map(|chunk| chunk.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_data_has_no_chunk() {
        let data: Vec<u8> = vec![];
        let chunker = Chunker::new(&data, 0);
        assert_eq!(chunker.chunks().count(), 0);
    }

    #[test]
    fn test_last_chunk_is_shorter() {
        let data = vec![0_u8; 10];
        let chunks: Vec<Chunk> = Chunker::new(&data, 3).chunks().collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(&chunks[3].data[..], &[0]);
        assert_eq!(chunks[3].size, 1);
    }

    #[test]
    fn test_exact_multiple() {
        let data: Vec<u8> = (0..12).collect();
        let chunker = Chunker::new(&data, 4);
        let chunks: Vec<Chunk> = chunker.chunks().collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[2].data[..], &[8, 9, 10, 11]);
        assert!(chunks.iter().all(|c| c.size == 4));
    }
}
