//! One revision note: the published comments (and optional push
//! certificate) attached to a single revision, stored as one blob.
//!
//! Blob layout, comments grouped by block then by file:
//!
//! ```text
//! [certificate version ...
//! -----END PGP SIGNATURE-----
//! ]Revision: <hex>
//! Patch-set: <n>                 (or Base-for-patch-set: <n>)
//! File: <path>
//!
//! <line> | <sl>:<sc>-<el>:<ec>
//! <timestamp>
//! Author: <ident>
//! [Parent: <uuid>]
//! UUID: <uuid>
//! Bytes: <n>
//! <n bytes of message>
//!
//! ```
//!
//! Messages are length-prefixed so they may hold any text, blank lines
//! included.

use std::cmp::Ordering;

use crate::error::NotesError;
use crate::model::{ChangeId, Comment, CommentKey, CommentRange, PatchSetId, Side};
use crate::repo::ObjectId;

use super::IdentityCodec;
use super::footer::{format_timestamp, parse_timestamp};

const CERT_START: &str = "certificate version ";
const CERT_END: &str = "-----END PGP SIGNATURE-----\n";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RevisionNote {
    pub push_cert: Option<String>,
    comments: Vec<Comment>,
}

/// Order comments are kept in so each block and file is contiguous.
fn canonical_order(a: &Comment, b: &Comment) -> Ordering {
    (a.key.patch_set, a.side, a.revision, &a.key.filename, a.line, a.written_on, &a.key.uuid).cmp(&(
        b.key.patch_set,
        b.side,
        b.revision,
        &b.key.filename,
        b.line,
        b.written_on,
        &b.key.uuid,
    ))
}

impl RevisionNote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_comments(comments: impl IntoIterator<Item = Comment>) -> Self {
        let mut note = Self::new();
        for comment in comments {
            note.put(comment);
        }
        note
    }

    #[must_use]
    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    #[must_use]
    pub fn into_comments(self) -> Vec<Comment> {
        self.comments
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.comments.is_empty() && self.push_cert.is_none()
    }

    #[must_use]
    pub fn get(&self, key: &CommentKey) -> Option<&Comment> {
        self.comments.iter().find(|c| &c.key == key)
    }

    /// Insert, replacing any comment with the same key.
    pub fn put(&mut self, comment: Comment) {
        self.comments.retain(|c| c.key != comment.key);
        let at = self
            .comments
            .partition_point(|c| canonical_order(c, &comment) != Ordering::Greater);
        self.comments.insert(at, comment);
    }

    pub fn remove(&mut self, key: &CommentKey) -> Option<Comment> {
        let at = self.comments.iter().position(|c| &c.key == key)?;
        Some(self.comments.remove(at))
    }

    /// Encode to blob bytes. `None` when there is nothing to store.
    #[must_use]
    pub fn encode(&self, codec: &IdentityCodec) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let mut out = String::new();
        if let Some(cert) = &self.push_cert {
            out.push_str(cert);
            if !cert.ends_with('\n') {
                out.push('\n');
            }
        }

        let mut block: Option<(PatchSetId, Side, ObjectId)> = None;
        let mut file: Option<&str> = None;
        for comment in &self.comments {
            let this_block = (comment.key.patch_set, comment.side, comment.revision);
            if block != Some(this_block) {
                out.push_str(&format!("Revision: {}\n", comment.revision));
                match comment.side {
                    Side::Revision => out.push_str(&format!("Patch-set: {}\n", comment.key.patch_set)),
                    Side::Base => {
                        out.push_str(&format!("Base-for-patch-set: {}\n", comment.key.patch_set));
                    }
                }
                block = Some(this_block);
                file = None;
            }
            if file != Some(comment.key.filename.as_str()) {
                out.push_str(&format!("File: {}\n\n", comment.key.filename));
                file = Some(comment.key.filename.as_str());
            }

            match &comment.range {
                Some(range) => out.push_str(&format!("{range}\n")),
                None => out.push_str(&format!("{}\n", comment.line)),
            }
            out.push_str(&format_timestamp(comment.written_on));
            out.push('\n');
            out.push_str(&format!("Author: {}\n", codec.format_footer(comment.author)));
            if let Some(parent) = &comment.parent_uuid {
                out.push_str(&format!("Parent: {parent}\n"));
            }
            out.push_str(&format!("UUID: {}\n", comment.key.uuid));
            out.push_str(&format!("Bytes: {}\n", comment.message.len()));
            out.push_str(&comment.message);
            out.push_str("\n\n");
        }
        Some(out.into_bytes())
    }

    /// Decode a blob.
    ///
    /// # Errors
    ///
    /// [`NotesError::Note`] naming the first malformed field.
    pub fn decode(change: ChangeId, bytes: &[u8], codec: &IdentityCodec) -> Result<Self, NotesError> {
        let mut cursor = Cursor {
            change,
            buf: bytes,
            pos: 0,
        };
        let mut note = Self::new();

        if cursor.rest().starts_with(CERT_START.as_bytes()) {
            let end = find(cursor.rest(), CERT_END.as_bytes())
                .ok_or_else(|| NotesError::note(change, "certificate", "unterminated push certificate"))?;
            let cert = cursor.take(end + CERT_END.len(), "certificate")?;
            note.push_cert = Some(cert.to_string());
        }

        let mut comments = Vec::new();
        while !cursor.at_end() {
            let revision = cursor.header("Revision")?;
            let revision = ObjectId::from_hex(revision)
                .map_err(|e| NotesError::note(change, "Revision", e.to_string()))?;

            let line = cursor.line("Patch-set")?;
            let (side, patch_set) = if let Some(ps) = line.strip_prefix("Patch-set: ") {
                (Side::Revision, ps)
            } else if let Some(ps) = line.strip_prefix("Base-for-patch-set: ") {
                (Side::Base, ps)
            } else {
                return Err(NotesError::note(change, "Patch-set", line));
            };
            let patch_set: PatchSetId = patch_set
                .parse()
                .map_err(|_| NotesError::note(change, "Patch-set", patch_set))?;

            while cursor.peek_prefix("File: ") {
                let filename = cursor.header("File")?.to_string();
                cursor.blank("File")?;
                loop {
                    comments.push(cursor.comment(codec, patch_set, side, revision, &filename)?);
                    if cursor.at_end() || cursor.peek_prefix("File: ") || cursor.peek_prefix("Revision: ") {
                        break;
                    }
                }
            }
            if !cursor.at_end() && !cursor.peek_prefix("Revision: ") {
                return Err(NotesError::note(change, "File", "expected a file header"));
            }
        }
        note.comments = comments;
        Ok(note)
    }
}

struct Cursor<'a> {
    change: ChangeId,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    const fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn peek_prefix(&self, prefix: &str) -> bool {
        self.rest().starts_with(prefix.as_bytes())
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a str, NotesError> {
        if self.buf.len() - self.pos < len {
            return Err(NotesError::note(self.change, field, "unexpected end of note"));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        std::str::from_utf8(bytes).map_err(|_| NotesError::note(self.change, field, "not UTF-8"))
    }

    /// Next line without its terminator. Every line must be terminated.
    fn line(&mut self, field: &'static str) -> Result<&'a str, NotesError> {
        let end = self
            .rest()
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| NotesError::note(self.change, field, "unexpected end of note"))?;
        let line = self.take(end, field)?;
        self.pos += 1;
        Ok(line)
    }

    fn header(&mut self, name: &'static str) -> Result<&'a str, NotesError> {
        let line = self.line(name)?;
        line.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix(": "))
            .ok_or_else(|| NotesError::note(self.change, name, format!("expected {name} header, got {line:?}")))
    }

    fn blank(&mut self, field: &'static str) -> Result<(), NotesError> {
        let line = self.line(field)?;
        if line.is_empty() {
            Ok(())
        } else {
            Err(NotesError::note(self.change, field, format!("expected blank line, got {line:?}")))
        }
    }

    fn comment(
        &mut self,
        codec: &IdentityCodec,
        patch_set: PatchSetId,
        side: Side,
        revision: ObjectId,
        filename: &str,
    ) -> Result<Comment, NotesError> {
        let change = self.change;
        let position = self.line("line")?;
        let (line, range) = if position.contains('-') {
            let range = CommentRange::parse(position)
                .ok_or_else(|| NotesError::note(change, "range", position))?;
            (range.end_line, Some(range))
        } else {
            let line: u32 = position
                .parse()
                .map_err(|_| NotesError::note(change, "line", position))?;
            (line, None)
        };

        let timestamp = self.line("timestamp")?;
        let written_on =
            parse_timestamp(timestamp).ok_or_else(|| NotesError::note(change, "timestamp", timestamp))?;

        let author = self.header("Author")?;
        let author = codec
            .parse_footer(author)
            .ok_or_else(|| NotesError::note(change, "Author", author))?;

        let parent_uuid = if self.peek_prefix("Parent: ") {
            Some(self.header("Parent")?.to_string())
        } else {
            None
        };
        let uuid = self.header("UUID")?.to_string();
        let bytes = self.header("Bytes")?;
        let len: usize = bytes
            .parse()
            .map_err(|_| NotesError::note(change, "Bytes", bytes))?;
        let message = self.take(len, "message")?.to_string();
        if self.take(2, "message")? != "\n\n" {
            return Err(NotesError::note(change, "message", "message length does not match Bytes"));
        }

        let key = CommentKey {
            patch_set,
            filename: filename.to_string(),
            uuid,
        };
        Ok(Comment {
            key,
            line,
            range,
            side,
            parent_uuid,
            author,
            written_on,
            message,
            revision,
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
