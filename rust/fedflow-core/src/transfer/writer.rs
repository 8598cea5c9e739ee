use std::{error::Error as StdError, path::Path};

use bytes::Buf;
use futures::Stream;
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt},
};
use tracing::{debug, warn};

use super::{Chunk, FrameReader, TransferError};

/// Writes verified chunks to a sink.
///
/// The first chunk that fails verification aborts the writer: nothing of it is written and
/// every later write fails with [`TransferError::Aborted`].
pub struct ArchiveWriter<W> {
    inner: W,
    written: u64,
    aborted: bool,
}

impl<W: AsyncWrite + Unpin> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            written: 0,
            aborted: false,
        }
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verifies and writes a chunk.
    pub async fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        if self.aborted {
            return Err(TransferError::Aborted);
        }
        if let Err(err) = chunk.verify() {
            self.aborted = true;
            return Err(err);
        }
        self.inner.write_all(&chunk.data).await?;
        self.written += chunk.size;
        Ok(())
    }

    /// Flushes the sink and returns the total number of bytes written.
    pub async fn finish(mut self) -> Result<u64, TransferError> {
        self.inner.flush().await?;
        Ok(self.written)
    }
}

/// Writes every remaining frame of `reader` into `sink`.
pub async fn receive_archive<S, B, E, W>(
    reader: &mut FrameReader<S>,
    sink: W,
) -> Result<u64, TransferError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: Buf,
    E: Into<Box<dyn StdError + Send + Sync>>,
    W: AsyncWrite + Unpin,
{
    let mut writer = ArchiveWriter::new(sink);
    while let Some(chunk) = reader.next_chunk().await? {
        writer.write_chunk(&chunk).await?;
    }
    writer.finish().await
}

/// Receives an archive into a new file at `path`. A partially written file is removed on
/// failure.
pub async fn save_archive<S, B, E>(
    reader: &mut FrameReader<S>,
    path: impl AsRef<Path>,
) -> Result<u64, TransferError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: Buf,
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    let path = path.as_ref();
    let file = File::create(path).await?;
    match receive_archive(reader, file).await {
        Ok(written) => {
            debug!("received {} bytes into {}", written, path.display());
            Ok(written)
        }
        Err(err) => {
            warn!("discarding partial archive {}: {}", path.display(), err);
            if let Err(e) = fs::remove_file(path).await {
                warn!("failed to remove {}: {}", path.display(), e);
            }
            Err(err)
        }
    }
}
