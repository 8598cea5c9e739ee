use std::{error::Error as StdError, path::Path};

use bytes::{Buf, Bytes, BytesMut};
use futures::{stream, Stream, StreamExt};
use tokio::{fs::File, io::AsyncReadExt};

use super::{chunk::ChunkBuffer, Chunk, TransferError, HEADER_LENGTH};
use crate::api::ExperimentMetadata;

/// The largest frame payload a receiver accepts.
pub const MAX_PAYLOAD_LENGTH: u64 = 64 * 1024 * 1024;

/// Splits a byte stream back into frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_payload_length: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload_length(MAX_PAYLOAD_LENGTH)
    }

    pub fn with_max_payload_length(max_payload_length: u64) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_payload_length,
        }
    }

    /// Appends received bytes.
    pub fn extend<B: Buf>(&mut self, mut bytes: B) {
        while bytes.has_remaining() {
            let chunk = bytes.chunk();
            let len = chunk.len();
            self.buffer.extend_from_slice(chunk);
            bytes.advance(len);
        }
    }

    /// Takes the next complete frame out of the buffer, if there is one.
    ///
    /// The declared size is not checked here, see [`Chunk::verify`].
    ///
    /// # Errors
    /// Fails if the frame announces a payload above the configured limit.
    pub fn decode(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.buffer.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let header = ChunkBuffer::new(&self.buffer[..HEADER_LENGTH]);
        let length = header.payload_length();
        if length > self.max_payload_length {
            return Err(TransferError::FrameTooLarge {
                length,
                limit: self.max_payload_length,
            });
        }
        let size = header.declared_size();

        let frame_length = HEADER_LENGTH + length as usize;
        if self.buffer.len() < frame_length {
            return Ok(None);
        }
        let mut frame = self.buffer.split_to(frame_length);
        let data = frame.split_off(HEADER_LENGTH).freeze();
        Ok(Some(Chunk { size, data }))
    }

    /// Checks that the stream did not end inside a frame.
    pub fn finish(&self) -> Result<(), TransferError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(TransferError::Truncated(self.buffer.len()))
        }
    }
}

/// Reads frames from a stream of byte buffers.
pub struct FrameReader<S> {
    stream: S,
    decoder: FrameDecoder,
}

impl<S, B, E> FrameReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: Buf,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Waits for the next frame. Returns `None` once the stream ended on a frame boundary.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        loop {
            if let Some(chunk) = self.decoder.decode()? {
                return Ok(Some(chunk));
            }
            match self.stream.next().await {
                Some(Ok(bytes)) => self.decoder.extend(bytes),
                Some(Err(err)) => return Err(TransferError::Transport(err.into())),
                None => {
                    self.decoder.finish()?;
                    return Ok(None);
                }
            }
        }
    }
}

/// Reads the metadata frame that opens an experiment upload.
pub async fn read_metadata<S, B, E>(
    reader: &mut FrameReader<S>,
) -> Result<ExperimentMetadata, TransferError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: Buf,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    let chunk = reader
        .next_chunk()
        .await?
        .ok_or(TransferError::MissingMetadata)?;
    chunk.verify()?;
    Ok(ExperimentMetadata::from_bytes(&chunk.data)?)
}

/// Encodes the metadata frame that opens an experiment upload.
pub fn metadata_frame(metadata: &ExperimentMetadata) -> Result<Bytes, TransferError> {
    Ok(Chunk::new(metadata.to_bytes()?).encode())
}

/// Opens the archive at `path` and streams it as frames of at most `chunk_size` bytes.
pub async fn archive_frames(
    path: impl AsRef<Path>,
    chunk_size: usize,
) -> Result<impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static, std::io::Error> {
    let file = File::open(path).await?;
    Ok(stream::try_unfold(file, move |mut file| async move {
        let mut buffer = Vec::with_capacity(chunk_size);
        (&mut file)
            .take(chunk_size as u64)
            .read_to_end(&mut buffer)
            .await?;
        if buffer.is_empty() {
            Ok(None)
        } else {
            Ok(Some((Chunk::new(buffer).encode(), file)))
        }
    }))
}
