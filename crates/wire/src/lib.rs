//! Wire codecs for the starling group communication core.
//!
//! Two families of layouts live here:
//!
//! - [`FragmentHeader`] and [`fragment_action`]: how an arbitrary-sized
//!   action is split into transport messages no larger than the configured
//!   packet size, and how the header travels in front of every piece.
//! - Control payloads: the byte layouts of library-generated actions
//!   ([`ConfPayload`], [`FlowPayload`], [`JoinPayload`], [`ServicePayload`],
//!   commit cuts).
//!
//! All multi-byte fields are little-endian. Every decoder is length-checked
//! and returns [`WireError`] instead of panicking on short or malformed
//! input.

mod control;
mod fragment;

pub use control::{
    decode_commit_cut, encode_commit_cut, ConfPayload, FlowPayload, JoinPayload, ServicePayload,
};
pub use fragment::{fragment_action, FragmentHeader, FRAG_HEADER_LEN, MIN_PKT_SIZE};

use thiserror::Error;

/// Errors decoding or encoding wire layouts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated buffer: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("packet size {got} below minimum {min}")]
    PktSizeTooSmall { min: usize, got: usize },
    #[error("member count {0} is invalid")]
    BadMemberCount(i64),
    #[error("member name not terminated")]
    UnterminatedMemberName,
    #[error("member name invalid: {0}")]
    BadMemberName(#[from] starling_types::MemberIdError),
    #[error("unknown service kind {0}")]
    UnknownServiceKind(u8),
    #[error("trailing garbage: {0} bytes after payload")]
    TrailingBytes(usize),
}
