//! Server side of one transfer.
//!
//! A session walks `ReadingHeader -> ReceivingBody -> Finalizing` and then
//! closes. The connection is owned by the session and is shut down on every
//! exit path, which is what releases the worker slot.

use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::TransferError;
use crate::progress::{ProgressEvent, ProgressMeter, ProgressSink};
use crate::protocol::{read_frame_header, sanitize_name, StatusToken};

/// Result of a session that got past the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Every declared byte arrived and was written.
    Complete { path: PathBuf, bytes: u64 },
    /// The stream ended early. The partial file stays on disk.
    ShortTransfer {
        path: PathBuf,
        received: u64,
        declared: u64,
    },
}

impl ReceiveOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReceiveOutcome::Complete { .. })
    }

    pub fn path(&self) -> &Path {
        match self {
            ReceiveOutcome::Complete { path, .. } | ReceiveOutcome::ShortTransfer { path, .. } => {
                path
            }
        }
    }

    /// Token written back to the sender for this outcome.
    pub fn token(&self) -> StatusToken {
        if self.is_success() {
            StatusToken::Ok
        } else {
            StatusToken::Error
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    ReadingHeader,
    ReceivingBody,
    Finalizing,
}

struct Session<'a, S> {
    stream: &'a mut S,
    config: &'a SessionConfig,
    sink: &'a dyn ProgressSink,
    state: SessionState,
}

/// Receive one file from `stream` into `config.upload_dir`.
///
/// Header failures close the connection without a token unless
/// `reply_on_failure` is set. With it, anything that goes wrong before the
/// file is opened gets `BAD` and later failures get `ERROR`.
pub async fn receive<S>(
    mut stream: S,
    config: &SessionConfig,
    sink: &dyn ProgressSink,
) -> Result<ReceiveOutcome, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session {
        stream: &mut stream,
        config,
        sink,
        state: SessionState::ReadingHeader,
    };
    let result = session.run().await;

    if let Err(ref e) = result {
        // A token may already be on the wire once finalizing has started.
        let token = match (session.state, e) {
            (SessionState::Finalizing, _) => None,
            (SessionState::ReadingHeader, TransferError::Filesystem { .. }) => {
                Some(StatusToken::Error)
            }
            (SessionState::ReadingHeader, _) => Some(StatusToken::BadHeader),
            (SessionState::ReceivingBody, _) => Some(StatusToken::Error),
        };
        if let Some(token) = token.filter(|_| config.reply_on_failure) {
            if let Err(write_err) = session.write_token(token).await {
                debug!(error = %write_err, "Failed to send failure token");
            }
        }
    }

    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Shutdown after session failed");
    }
    result
}

impl<S> Session<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(&mut self) -> Result<ReceiveOutcome, TransferError> {
        let header = read_frame_header(&mut *self.stream, &self.config.limits).await?;
        debug!(name = %header.name, size = header.size, "Received frame header");

        let safe_name = sanitize_name(&header.name)
            .ok_or_else(|| TransferError::InvalidName(header.name.clone()))?;
        let path = self.config.upload_dir.join(safe_name);
        let mut file = File::create(&path)
            .await
            .map_err(|e| TransferError::Filesystem {
                path: path.clone(),
                source: e,
            })?;

        self.state = SessionState::ReceivingBody;
        self.sink.emit(&ProgressEvent::Started {
            name: safe_name.to_string(),
            declared: header.size,
        });
        let received = self.receive_body(&mut file, &path, header.size).await?;

        file.flush().await.map_err(|e| TransferError::Filesystem {
            path: path.clone(),
            source: e,
        })?;
        drop(file);

        self.state = SessionState::Finalizing;
        let outcome = if received == header.size {
            ReceiveOutcome::Complete {
                path,
                bytes: received,
            }
        } else {
            ReceiveOutcome::ShortTransfer {
                path,
                received,
                declared: header.size,
            }
        };
        self.write_token(outcome.token()).await?;

        info!(
            file = %safe_name,
            success = outcome.is_success(),
            "File {} received: {}",
            safe_name,
            if outcome.is_success() {
                "Success"
            } else {
                "Failure (size mismatch)"
            }
        );
        Ok(outcome)
    }

    /// Copy exactly `declared` bytes, or fewer if the stream ends.
    ///
    /// Reads are capped at the remaining count so nothing past the payload
    /// is ever consumed.
    async fn receive_body(
        &mut self,
        file: &mut File,
        path: &Path,
        declared: u64,
    ) -> Result<u64, TransferError> {
        let mut buf = vec![0u8; self.config.buffer_size];
        let mut meter = ProgressMeter::new(declared, self.config.progress_interval, Instant::now());

        while meter.received() < declared {
            let want = (declared - meter.received()).min(buf.len() as u64) as usize;
            let n = self.stream.read(&mut buf[..want]).await?;
            if n == 0 {
                warn!(
                    received = meter.received(),
                    declared, "Unexpected end of stream"
                );
                break;
            }

            file.write_all(&buf[..n])
                .await
                .map_err(|e| TransferError::Filesystem {
                    path: path.to_path_buf(),
                    source: e,
                })?;

            if let Some(sample) = meter.record(n as u64, Instant::now()) {
                self.sink.emit(&ProgressEvent::Sample(sample));
            }
        }

        if let Some(sample) = meter.finish(Instant::now()) {
            self.sink.emit(&ProgressEvent::Sample(sample));
        }
        self.sink.emit(&ProgressEvent::Finished {
            received: meter.received(),
            declared,
        });
        Ok(meter.received())
    }

    async fn write_token(&mut self, token: StatusToken) -> std::io::Result<()> {
        self.stream.write_all(token.as_bytes()).await?;
        self.stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullSink;
    use crate::protocol::encode_frame_header;
    use std::io;
    use std::sync::Mutex;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn session_config(dir: &Path) -> SessionConfig {
        SessionConfig::new(dir)
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ProgressEvent>>);

    impl ProgressSink for RecordingSink {
        fn emit(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    /// Feed `input` to a receiver, close the write side, return its reply.
    async fn run_session(
        input: Vec<u8>,
        config: &SessionConfig,
    ) -> (Result<ReceiveOutcome, TransferError>, Vec<u8>) {
        let (mut client, server) = duplex(64 * 1024);
        let sink = NullSink;
        let (result, reply) = tokio::join!(receive(server, config, &sink), async {
            client.write_all(&input).await.unwrap();
            client.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client.read_to_end(&mut reply).await.unwrap();
            reply
        });
        (result, reply)
    }

    #[tokio::test]
    async fn test_complete_transfer() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut input = encode_frame_header("data.bin", payload.len() as u64).to_vec();
        input.extend_from_slice(&payload);

        let (result, reply) = run_session(input, &session_config(&dir)).await;
        let outcome = result.unwrap();
        assert!(outcome.is_success());
        assert_eq!(reply, b"OK");
        assert_eq!(std::fs::read(dir.join("data.bin")).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let input = encode_frame_header("empty", 0).to_vec();
        let (result, reply) = run_session(input, &session_config(&dir)).await;
        assert_eq!(
            result.unwrap(),
            ReceiveOutcome::Complete {
                path: dir.join("empty"),
                bytes: 0
            }
        );
        assert_eq!(reply, b"OK");
        assert_eq!(std::fs::metadata(dir.join("empty")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_short_stream_keeps_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let mut input = encode_frame_header("partial.bin", 1000).to_vec();
        input.extend_from_slice(&[7u8; 400]);

        let (result, reply) = run_session(input, &session_config(&dir)).await;
        assert_eq!(
            result.unwrap(),
            ReceiveOutcome::ShortTransfer {
                path: dir.join("partial.bin"),
                received: 400,
                declared: 1000
            }
        );
        assert_eq!(reply, b"ERROR");
        assert_eq!(std::fs::read(dir.join("partial.bin")).unwrap(), vec![7u8; 400]);
    }

    #[tokio::test]
    async fn test_does_not_read_past_declared_size() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let mut input = encode_frame_header("exact.bin", 10).to_vec();
        input.extend_from_slice(b"0123456789TRAILING");

        let (mut client, mut server) = duplex(1024);
        client.write_all(&input).await.unwrap();
        let outcome = {
            let config = session_config(&dir);
            receive(&mut server, &config, &NullSink).await.unwrap()
        };
        assert!(outcome.is_success());

        let mut rest = vec![0u8; 8];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"TRAILING");
        assert_eq!(std::fs::read(dir.join("exact.bin")).unwrap(), b"0123456789");
    }

    #[tokio::test]
    async fn test_truncated_header_sends_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let input = encode_frame_header("never.bin", 5).to_vec();
        let (result, reply) = run_session(input[..7].to_vec(), &session_config(&dir)).await;

        assert!(matches!(result, Err(TransferError::TruncatedStream { .. })));
        assert!(reply.is_empty());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_truncated_header_with_reply_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let mut config = session_config(&dir);
        config.reply_on_failure = true;
        let input = encode_frame_header("never.bin", 5).to_vec();

        let (result, reply) = run_session(input[..3].to_vec(), &config).await;
        assert!(result.is_err());
        assert_eq!(reply, b"BAD");
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_reset_during_header_with_reply_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = session_config(tmp.path());
        config.reply_on_failure = true;
        let header = encode_frame_header("gone.bin", 5);

        let mock = Builder::new()
            .read(&header[..6])
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .write(b"BAD")
            .build();
        let result = receive(mock, &config, &NullSink).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_reset_during_body_with_reply_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = session_config(tmp.path());
        config.reply_on_failure = true;
        let header = encode_frame_header("half.bin", 10);

        let mock = Builder::new()
            .read(&header)
            .read(b"12345")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .write(b"ERROR")
            .build();
        let result = receive(mock, &config, &NullSink).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
        assert!(tmp.path().join("half.bin").exists());
    }

    #[tokio::test]
    async fn test_path_traversal_is_stripped() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let mut input = encode_frame_header("../../escape.txt", 3).to_vec();
        input.extend_from_slice(b"abc");

        let (result, reply) = run_session(input, &session_config(&dir)).await;
        assert_eq!(result.unwrap().path(), dir.join("escape.txt"));
        assert_eq!(reply, b"OK");
        assert!(dir.join("escape.txt").exists());
        assert!(!dir.parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let mut config = session_config(&dir);
        config.reply_on_failure = true;
        let mut input = encode_frame_header("..", 1).to_vec();
        input.push(b'x');

        let (result, reply) = run_session(input, &config).await;
        assert!(matches!(result, Err(TransferError::InvalidName(_))));
        assert_eq!(reply, b"BAD");
    }

    #[tokio::test]
    async fn test_missing_upload_dir_is_filesystem_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("does-not-exist");
        let mut config = session_config(&dir);
        config.reply_on_failure = true;
        let mut input = encode_frame_header("a.txt", 1).to_vec();
        input.push(b'a');

        let (result, reply) = run_session(input, &config).await;
        assert!(matches!(result, Err(TransferError::Filesystem { .. })));
        assert_eq!(reply, b"ERROR");
    }

    #[tokio::test]
    async fn test_emits_progress_events() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        let mut config = session_config(&dir);
        config.progress_interval = std::time::Duration::ZERO;
        config.buffer_size = 100;
        let mut input = encode_frame_header("p.bin", 300).to_vec();
        input.extend_from_slice(&[1u8; 300]);

        let (mut client, server) = duplex(4096);
        client.write_all(&input).await.unwrap();
        let sink = RecordingSink::default();
        let outcome = receive(server, &config, &sink).await.unwrap();
        assert!(outcome.is_success());

        let events = sink.0.lock().unwrap();
        assert!(matches!(
            events.first(),
            Some(ProgressEvent::Started { declared: 300, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::Finished {
                received: 300,
                declared: 300
            })
        ));
        let samples = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Sample(_)))
            .count();
        assert!(samples >= 3);
    }
}
