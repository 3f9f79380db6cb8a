//! filedrop: single-file transfer over TCP.
//!
//! A client streams one file per connection behind a small length-prefixed
//! header; the server writes it into an upload directory and answers with a
//! status token. Connections are served concurrently by a bounded worker pool.
//!
//! Features:
//! - Length-derived framing with no terminators
//! - Path-stripping of declared names
//! - Exact-count body reads that never consume past the payload
//! - Configurable pool size, queue bound and overflow policy
//! - Throughput samples delivered to a pluggable sink

pub mod config;
pub mod error;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;

pub use config::{ServerConfig, SessionConfig};
pub use error::{ConfigError, TransferError};
pub use pool::{OverflowPolicy, PoolSnapshot, WorkerPool};
pub use progress::{NullSink, ProgressEvent, ProgressSample, ProgressSink, TracingSink};
pub use receiver::{receive, ReceiveOutcome};
pub use sender::{send, Sender, TransferOutcome};
pub use server::{Accept, Server};
