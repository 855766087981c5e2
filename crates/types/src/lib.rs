//! Foundation types for the starling group communication core.
//!
//! This crate provides the vocabulary shared by every other layer:
//!
//! - [`Seqno`]: 64-bit signed sequence numbers with reserved sentinels
//! - [`GroupUuid`]: 16-byte identity of a group history epoch
//! - [`Action`] / [`ActionType`]: the unit of totally-ordered delivery
//! - [`MemberId`], [`View`]: group membership
//!
//! This crate sits at the bottom of the workspace: it depends on no other
//! member crate, so every layer above can speak the same vocabulary without
//! dependency cycles.

mod action;
mod group_uuid;
mod member;
mod seqno;

pub use action::{Action, ActionType};
pub use group_uuid::GroupUuid;
pub use member::{MemberId, MemberIdError, View, MEMBER_NAME_MAX};
pub use seqno::Seqno;
