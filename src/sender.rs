//! Client side of one transfer.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::protocol::{encode_frame_header, read_reply, Reply};

/// Default bytes read from the local file per write.
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Verdict derived from the server's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Server answered `OK`.
    Success,
    /// Server answered with anything else.
    Failure { reply: String },
    /// Server closed the connection without answering.
    NoResponse,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success)
    }
}

impl From<Reply> for TransferOutcome {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::None => TransferOutcome::NoResponse,
            Reply::Token(text) if text == "OK" => TransferOutcome::Success,
            Reply::Token(reply) => TransferOutcome::Failure { reply },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sender {
    chunk_size: usize,
}

impl Default for Sender {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl Sender {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Upload `file_path` to `host:port`.
    ///
    /// Fails with `FileNotFound` before connecting if the path is not a
    /// regular file. The connection is dropped before returning on every path.
    pub async fn send(
        &self,
        file_path: &Path,
        host: &str,
        port: u16,
    ) -> Result<TransferOutcome, TransferError> {
        let metadata = tokio::fs::metadata(file_path)
            .await
            .map_err(|_| TransferError::FileNotFound(file_path.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(TransferError::FileNotFound(file_path.to_path_buf()));
        }
        let file = File::open(file_path)
            .await
            .map_err(|_| TransferError::FileNotFound(file_path.to_path_buf()))?;

        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| TransferError::Connect {
                addr: addr.clone(),
                source: e,
            })?;
        info!(file = %file_path.display(), server = %addr, "Starting file transfer");

        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        // Size is taken once at open time and not re-checked.
        let size = file.metadata().await?.len();

        self.send_over(stream, file, &name, size).await
    }

    /// Run the frame/payload/reply exchange over an already open stream.
    ///
    /// If the server stops reading and closes while the payload is still
    /// going out, any token it wrote before closing is returned instead of
    /// the write error.
    pub async fn send_over<S, R>(
        &self,
        mut stream: S,
        mut file: R,
        name: &str,
        size: u64,
    ) -> Result<TransferOutcome, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        if let Err(e) = self.write_frame(&mut stream, &mut file, name, size).await {
            return match read_reply(&mut stream).await {
                Ok(reply @ Reply::Token(_)) => {
                    debug!(error = %e, %reply, "Server replied before payload was complete");
                    Ok(TransferOutcome::from(reply))
                }
                _ => Err(e),
            };
        }

        let reply = read_reply(&mut stream).await?;
        let outcome = TransferOutcome::from(reply);
        debug!(?outcome, "Received reply");
        Ok(outcome)
    }

    async fn write_frame<S, R>(
        &self,
        stream: &mut S,
        file: &mut R,
        name: &str,
        size: u64,
    ) -> Result<(), TransferError>
    where
        S: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        stream.write_all(&encode_frame_header(name, size)).await?;
        debug!(name, size, "Sent frame header");

        let mut buf = vec![0u8; self.chunk_size];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
            sent += n as u64;
        }
        stream.flush().await?;
        debug!(sent, "Finished sending file content");
        Ok(())
    }
}

/// Upload `file_path` to `host:port` with the default chunk size.
pub async fn send(
    file_path: &Path,
    host: &str,
    port: u16,
) -> Result<TransferOutcome, TransferError> {
    Sender::default().send(file_path, host, port).await
}
