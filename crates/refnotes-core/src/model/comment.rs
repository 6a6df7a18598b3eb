use std::fmt;

use chrono::{DateTime, Utc};

use super::{AccountId, PatchSetId};
use crate::repo::ObjectId;

/// Which side of the diff a comment is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Side {
    /// The parent (base) of the patch set.
    Base,
    #[default]
    Revision,
}

impl Side {
    #[must_use]
    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Base => 0,
            Self::Revision => 1,
        }
    }

    /// Any non-positive side value refers to the base.
    #[must_use]
    pub const fn from_i16(value: i16) -> Self {
        if value <= 0 { Self::Base } else { Self::Revision }
    }
}

/// Published comments are visible to everyone; drafts only to their author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommentStatus {
    Published,
    Draft,
}

impl CommentStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Published => "P",
            Self::Draft => "D",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "P" => Some(Self::Published),
            "D" => Some(Self::Draft),
            _ => None,
        }
    }
}

/// Identity of a comment: (patch set, file, author-assigned UUID).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommentKey {
    pub patch_set: PatchSetId,
    pub filename: String,
    pub uuid: String,
}

impl fmt::Display for CommentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.patch_set, self.filename, self.uuid)
    }
}

/// Character range `start_line:start_char-end_line:end_char`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommentRange {
    pub start_line: u32,
    pub start_char: u32,
    pub end_line: u32,
    pub end_char: u32,
}

impl fmt::Display for CommentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.start_line, self.start_char, self.end_line, self.end_char
        )
    }
}

impl CommentRange {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (start, end) = s.split_once('-')?;
        let (start_line, start_char) = start.split_once(':')?;
        let (end_line, end_char) = end.split_once(':')?;
        Some(Self {
            start_line: start_line.parse().ok()?,
            start_char: start_char.parse().ok()?,
            end_line: end_line.parse().ok()?,
            end_char: end_char.parse().ok()?,
        })
    }
}

/// An inline comment on one file of one patch set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub key: CommentKey,
    /// Line number; 0 for a file-level comment. Equals the range's end line
    /// when a range is present.
    pub line: u32,
    pub range: Option<CommentRange>,
    pub side: Side,
    pub parent_uuid: Option<String>,
    pub author: AccountId,
    pub written_on: DateTime<Utc>,
    pub message: String,
    /// Commit the comment's patch set points at.
    pub revision: ObjectId,
}

impl Comment {
    #[must_use]
    pub fn new(
        key: CommentKey,
        author: AccountId,
        written_on: DateTime<Utc>,
        message: impl Into<String>,
        revision: ObjectId,
    ) -> Self {
        Self {
            key,
            line: 0,
            range: None,
            side: Side::Revision,
            parent_uuid: None,
            author,
            written_on,
            message: message.into(),
            revision,
        }
    }

    #[must_use]
    pub fn with_range(mut self, range: CommentRange) -> Self {
        self.line = range.end_line;
        self.range = Some(range);
        self
    }

    #[must_use]
    pub const fn with_line(mut self, line: u32) -> Self {
        self.line = line;
        self.range = None;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_uuid: impl Into<String>) -> Self {
        self.parent_uuid = Some(parent_uuid.into());
        self
    }

    #[must_use]
    pub const fn on_side(mut self, side: Side) -> Self {
        self.side = side;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_round_trips_through_text() {
        let range = CommentRange {
            start_line: 1,
            start_char: 2,
            end_line: 3,
            end_char: 4,
        };
        assert_eq!(range.to_string(), "1:2-3:4");
        assert_eq!(CommentRange::parse("1:2-3:4"), Some(range));
        assert_eq!(CommentRange::parse("1:2"), None);
        assert_eq!(CommentRange::parse("a:2-3:4"), None);
    }

    #[test]
    fn non_positive_side_is_base() {
        assert_eq!(Side::from_i16(-1), Side::Base);
        assert_eq!(Side::from_i16(0), Side::Base);
        assert_eq!(Side::from_i16(1), Side::Revision);
    }
}
