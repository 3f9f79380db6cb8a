//! Single-file transfer protocol.
//!
//! One connection carries exactly one file, client to server, followed by a
//! short status token from server to client.
//!
//! ## Frame Format
//!
//! All integers are big-endian. There is no version field and no terminator;
//! every boundary is derived from a declared length.
//!
//! ```text
//! offset  size   field
//! 0       4      name length N (u32)
//! 4       N      name bytes (UTF-8)
//! 4+N     8      file size S (u64)
//! 12+N    S      file payload, raw bytes
//! ```
//!
//! ## Reply
//!
//! Raw ASCII with no length prefix: `OK` or `ERROR`. Servers running with
//! `reply_on_failure` also send `BAD` when the header is unreadable. Readers
//! take at most 5 bytes and treat anything other than exactly `OK`, including
//! an empty reply, as failure.

pub mod codec;
pub mod status;

pub use codec::{
    decode_u32_be, decode_u64_be, encode_frame_header, read_exact, read_frame_header,
    sanitize_name, FrameHeader, HeaderLimits,
};
pub use status::{read_reply, Reply, StatusToken, MAX_REPLY_LEN};
