//! Frame header codec.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::TransferError;

/// Bytes taken by the name length prefix.
pub const NAME_LEN_SIZE: usize = 4;

/// Bytes taken by the file size field.
pub const FILE_SIZE_SIZE: usize = 8;

/// Largest single read issued by `read_exact`.
const READ_CHUNK: usize = 8192;

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Name as declared by the sender, before sanitization.
    pub name: String,
    /// Number of payload bytes that follow the header.
    pub size: u64,
}

/// Upper bounds applied to a header before anything is allocated for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLimits {
    pub max_name_len: u32,
    pub max_file_size: u64,
}

impl Default for HeaderLimits {
    fn default() -> Self {
        Self {
            max_name_len: 4096,
            max_file_size: 64 * 1024 * 1024 * 1024,
        }
    }
}

/// Encode `name_len || name || size`.
///
/// The name length is written as `name.len() as u32`; callers must not pass
/// names longer than `u32::MAX` bytes.
pub fn encode_frame_header(name: &str, size: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(NAME_LEN_SIZE + name.len() + FILE_SIZE_SIZE);
    buf.put_u32(name.len() as u32);
    buf.put_slice(name.as_bytes());
    buf.put_u64(size);
    buf.freeze()
}

pub fn decode_u32_be(bytes: [u8; 4]) -> u32 {
    (bytes[0] as u32) << 24 | (bytes[1] as u32) << 16 | (bytes[2] as u32) << 8 | bytes[3] as u32
}

pub fn decode_u64_be(bytes: [u8; 8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| acc << 8 | b as u64)
}

/// Read exactly `n` bytes, or fail with `TruncatedStream` if the stream
/// ends first.
pub async fn read_exact<R>(reader: &mut R, n: usize) -> Result<BytesMut, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(n.min(READ_CHUNK));
    while buf.len() < n {
        let want = (n - buf.len()).min(READ_CHUNK);
        let start = buf.len();
        buf.resize(start + want, 0);

        let read = reader.read(&mut buf[start..]).await?;
        buf.truncate(start + read);
        if read == 0 {
            return Err(TransferError::TruncatedStream {
                expected: n,
                received: buf.len(),
            });
        }
    }
    Ok(buf)
}

/// Read the three header fields, enforcing `limits` before each allocation.
pub async fn read_frame_header<R>(
    reader: &mut R,
    limits: &HeaderLimits,
) -> Result<FrameHeader, TransferError>
where
    R: AsyncRead + Unpin,
{
    let raw = read_exact(reader, NAME_LEN_SIZE).await?;
    let name_len = decode_u32_be([raw[0], raw[1], raw[2], raw[3]]);
    if name_len > limits.max_name_len {
        return Err(TransferError::HeaderRejected(format!(
            "name length {} exceeds limit {}",
            name_len, limits.max_name_len
        )));
    }

    let name_bytes = read_exact(reader, name_len as usize).await?;
    let name = String::from_utf8_lossy(&name_bytes).into_owned();

    let raw = read_exact(reader, FILE_SIZE_SIZE).await?;
    let mut size_bytes = [0u8; FILE_SIZE_SIZE];
    size_bytes.copy_from_slice(&raw);
    let size = decode_u64_be(size_bytes);
    if size > limits.max_file_size {
        return Err(TransferError::HeaderRejected(format!(
            "file size {} exceeds limit {}",
            size, limits.max_file_size
        )));
    }

    Ok(FrameHeader { name, size })
}

/// Reduce a declared name to its final path component.
///
/// Both `/` and `\` count as separators so that names built on either
/// platform cannot climb out of the upload directory. Trailing separators
/// are ignored, so `dir/` names `dir`.
pub fn sanitize_name(raw: &str) -> Option<&str> {
    let trimmed = raw.trim_end_matches(['/', '\\']);
    let base = trimmed.rsplit(['/', '\\']).next().unwrap_or("");
    match base {
        "" | "." | ".." => None,
        _ if base.contains('\0') => None,
        _ => Some(base),
    }
}
