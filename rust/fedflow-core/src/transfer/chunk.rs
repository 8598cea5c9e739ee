use std::convert::TryInto;

use bytes::{BufMut, Bytes, BytesMut};

use super::TransferError;

pub(crate) mod ranges {
    use std::ops::Range;

    /// Byte range of the size declared by the sender
    pub const DECLARED_SIZE: Range<usize> = 0..8;
    /// Byte range of the length of the payload that follows the header
    pub const PAYLOAD_LENGTH: Range<usize> = DECLARED_SIZE.end..DECLARED_SIZE.end + 8;
}

/// Length in bytes of a frame header.
pub const HEADER_LENGTH: usize = ranges::PAYLOAD_LENGTH.end;

/// A piece of an archive, tagged with the size its sender declared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Declared number of bytes in `data`.
    pub size: u64,
    pub data: Bytes,
}

impl Chunk {
    /// Creates a chunk whose declared size matches its data.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            size: data.len() as u64,
            data,
        }
    }

    /// Checks the declared size against the bytes actually carried.
    ///
    /// # Errors
    /// Fails with [`TransferError::SizeMismatch`] if they differ.
    pub fn verify(&self) -> Result<(), TransferError> {
        let actual = self.data.len() as u64;
        if self.size == actual {
            Ok(())
        } else {
            Err(TransferError::SizeMismatch {
                declared: self.size,
                actual,
            })
        }
    }

    /// Length in bytes of the encoded frame.
    pub fn buffer_length(&self) -> usize {
        HEADER_LENGTH + self.data.len()
    }

    /// Encodes the chunk into a frame.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.buffer_length());
        buffer.put_u64(self.size);
        buffer.put_u64(self.data.len() as u64);
        buffer.put_slice(&self.data);
        buffer.freeze()
    }
}

/// A view over an encoded frame.
///
/// ```no_rust
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                     declared_size (u64 BE)                    +
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                    payload_length (u64 BE)                    +
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// +                    payload (payload_length)                   +
/// |                                                               |
/// ```
///
/// - `declared_size`: the size the sender claims for the chunk
/// - `payload_length`: the number of payload bytes actually framed
///
/// The two only differ if the sender is broken. Receivers must treat that as an integrity
/// error.
pub struct ChunkBuffer<T> {
    inner: T,
}

impl<T: AsRef<[u8]>> ChunkBuffer<T> {
    /// Wraps `bytes` without any bound checks. The header fields may only be read once
    /// `bytes` holds at least [`HEADER_LENGTH`] bytes.
    pub fn new(bytes: T) -> Self {
        Self { inner: bytes }
    }

    /// Gets the declared size field.
    ///
    /// # Panics
    /// Panics if the buffer is shorter than [`HEADER_LENGTH`].
    pub fn declared_size(&self) -> u64 {
        // Unwrapping is OK, the range is 8 bytes long
        u64::from_be_bytes(self.inner.as_ref()[ranges::DECLARED_SIZE].try_into().unwrap())
    }

    /// Gets the payload length field.
    ///
    /// # Panics
    /// Panics if the buffer is shorter than [`HEADER_LENGTH`].
    pub fn payload_length(&self) -> u64 {
        // Unwrapping is OK, the range is 8 bytes long
        u64::from_be_bytes(self.inner.as_ref()[ranges::PAYLOAD_LENGTH].try_into().unwrap())
    }
}
