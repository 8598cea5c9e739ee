//! Chunked transfer of experiment archives.
//!
//! An archive is sent as a sequence of frames, each carrying one [`Chunk`] together with the
//! size its sender declared for it. A receiver checks every chunk against its declared size
//! before writing it and aborts the whole transfer on the first mismatch.

mod chunk;
mod chunker;
mod reader;
mod writer;

pub use self::{
    chunk::{Chunk, ChunkBuffer, HEADER_LENGTH},
    chunker::{Chunker, DEFAULT_CHUNK_SIZE},
    reader::{
        archive_frames, metadata_frame, read_metadata, FrameDecoder, FrameReader, MAX_PAYLOAD_LENGTH,
    },
    writer::{receive_archive, save_archive, ArchiveWriter},
};

use std::error::Error as StdError;

use thiserror::Error;

/// Errors of an archive transfer.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("chunk declares {declared} bytes but carries {actual} bytes")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("frame payload of {length} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge { length: u64, limit: u64 },

    #[error("stream ended in the middle of a frame ({0} trailing bytes)")]
    Truncated(usize),

    #[error("stream ended before the metadata frame")]
    MissingMetadata,

    #[error("malformed metadata frame: {0}")]
    Metadata(#[from] bincode::Error),

    #[error("transfer was aborted after an integrity error")]
    Aborted,

    #[error("transport failure: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Checks whether the received data itself was invalid, as opposed to a failure of the
    /// transport or the local file system.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Self::SizeMismatch { .. }
                | Self::FrameTooLarge { .. }
                | Self::Truncated(_)
                | Self::MissingMetadata
                | Self::Metadata(_)
                | Self::Aborted
        )
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::stream;

    use super::*;

    fn archive(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Re-slices the encoded frames at arbitrary boundaries, like a network would.
    fn rechunk(frames: Vec<Bytes>, piece: usize) -> Vec<Result<Bytes, std::io::Error>> {
        let all: Vec<u8> = frames.into_iter().flat_map(|f| f.to_vec()).collect();
        all.chunks(piece)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    #[tokio::test]
    async fn test_round_trip_of_five_million_bytes() {
        let data = archive(5_000_000);
        let chunks: Vec<Chunk> = Chunker::new(&data, DEFAULT_CHUNK_SIZE).chunks().collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.size == c.data.len() as u64));
        assert_eq!(chunks[2].size, 5_000_000 - 2 * DEFAULT_CHUNK_SIZE as u64);

        let frames = chunks.iter().map(Chunk::encode).collect();
        let mut reader = FrameReader::new(stream::iter(rechunk(frames, 1_000_003)));
        let mut received = Vec::new();
        let written = receive_archive(&mut reader, &mut received).await.unwrap();

        assert_eq!(written, 5_000_000);
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_size_mismatch_aborts_before_next_chunk() {
        let data = archive(5_000_000);
        let mut chunks: Vec<Chunk> = Chunker::new(&data, DEFAULT_CHUNK_SIZE).chunks().collect();
        chunks[1].size -= 1;

        let frames = chunks.iter().map(Chunk::encode).collect();
        let mut reader = FrameReader::new(stream::iter(rechunk(frames, 65_536)));
        let mut received = Vec::new();
        let err = receive_archive(&mut reader, &mut received)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                declared,
                actual
            } if declared + 1 == actual && actual == DEFAULT_CHUNK_SIZE as u64
        ));
        assert!(err.is_integrity_error());
        // only the first chunk made it through
        assert_eq!(received.len(), DEFAULT_CHUNK_SIZE);
        assert_eq!(&received[..], &data[..DEFAULT_CHUNK_SIZE]);
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let frame = Chunk::new(vec![1_u8; 100]).encode();
        let cut = vec![Ok::<_, std::io::Error>(frame.slice(..50))];
        let mut reader = FrameReader::new(stream::iter(cut));
        let err = reader.next_chunk().await.unwrap_err();
        assert!(matches!(err, TransferError::Truncated(50)));
    }

    #[tokio::test]
    async fn test_transport_error_is_not_an_integrity_error() {
        let items = vec![Err::<Bytes, _>(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))];
        let mut reader = FrameReader::new(stream::iter(items));
        let err = reader.next_chunk().await.unwrap_err();
        assert!(matches!(err, TransferError::Transport(_)));
        assert!(!err.is_integrity_error());
    }
}
