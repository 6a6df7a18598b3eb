//! Codecs for what a change history stores: commit messages with footers,
//! identities, and revision notes holding inline comments.

pub mod footer;
pub mod ident;
pub mod map;
pub mod revision;

pub use footer::{CommitMessage, FooterKey, FooterLine, MessageBuilder};
pub use ident::IdentityCodec;
pub use map::RevisionNoteMap;
pub use revision::RevisionNote;
