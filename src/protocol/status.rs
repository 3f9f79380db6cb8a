//! Status tokens sent from receiver back to sender.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Readers never consume more than this many reply bytes.
pub const MAX_REPLY_LEN: usize = 5;

/// Terminal outcome of a session as written on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusToken {
    /// Payload received byte-exact.
    Ok,
    /// Payload short or session failed after the header.
    Error,
    /// Header unreadable or rejected. Only sent with `reply_on_failure`.
    BadHeader,
}

impl StatusToken {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            StatusToken::Ok => b"OK",
            StatusToken::Error => b"ERROR",
            StatusToken::BadHeader => b"BAD",
        }
    }
}

/// What the sender got back after streaming the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The server closed without writing anything.
    None,
    /// Whatever arrived, decoded lossily.
    Token(String),
}

impl Reply {
    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Token(text) if text == "OK")
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::None => write!(f, "<no response>"),
            Reply::Token(text) => write!(f, "{}", text),
        }
    }
}

/// Read up to `MAX_REPLY_LEN` bytes, stopping early at end of stream.
///
/// A reset that arrives after part of a token has been read ends the reply
/// like end of stream does.
pub async fn read_reply<R>(reader: &mut R) -> io::Result<Reply>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_REPLY_LEN];
    let mut filled = 0;
    while filled < MAX_REPLY_LEN {
        let n = match reader.read(&mut buf[filled..]).await {
            Ok(n) => n,
            Err(e) if filled > 0 && e.kind() == io::ErrorKind::ConnectionReset => break,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == 0 {
        return Ok(Reply::None);
    }
    Ok(Reply::Token(
        String::from_utf8_lossy(&buf[..filled]).into_owned(),
    ))
}
