//! Object ids and the byte encodings of trees and commits.
//!
//! Trees and commits use git's loose-object layout so that the git backend
//! can store the bytes produced here verbatim and get the same ids git would
//! compute. Backends never interpret object bytes; only this module does.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};

/// A 20-byte object id. The all-zero id stands for "no object".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId([u8; 20]);

/// Error returned when parsing a malformed hex object id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectIdError {
    #[error("object id must be 40 hex characters, got {0}")]
    WrongLength(usize),
    #[error("invalid hex character {0:?} in object id")]
    InvalidHex(char),
}

impl ObjectId {
    pub const LEN: usize = 20;
    pub const ZERO: Self = Self([0; 20]);

    #[must_use]
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Build from a slice of exactly 20 bytes.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 20]
    }

    /// `None` for the zero id, `Some(self)` otherwise.
    #[must_use]
    pub fn non_zero(self) -> Option<Self> {
        if self.is_zero() { None } else { Some(self) }
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        use fmt::Write;
        let mut out = String::with_capacity(40);
        for byte in self.0 {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Parse 40 hex characters (either case).
    ///
    /// # Errors
    ///
    /// Returns [`ObjectIdError`] for wrong length or non-hex input.
    pub fn from_hex(hex: &str) -> Result<Self, ObjectIdError> {
        if hex.len() != 40 {
            return Err(ObjectIdError::WrongLength(hex.len()));
        }
        let mut out = [0u8; 20];
        let bytes = hex.as_bytes();
        for (i, slot) in out.iter_mut().enumerate() {
            let hi = hex_value(bytes[i * 2])?;
            let lo = hex_value(bytes[i * 2 + 1])?;
            *slot = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

fn hex_value(c: u8) -> Result<u8, ObjectIdError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(ObjectIdError::InvalidHex(char::from(c))),
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    /// Name used in git object headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Author or committer line of a commit. Time has second precision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersonIdent {
    pub name: String,
    pub email: String,
    pub when: DateTime<Utc>,
}

impl PersonIdent {
    /// Build an ident, dropping sub-second precision the encoding cannot hold.
    #[must_use]
    pub fn new(name: impl Into<String>, email: impl Into<String>, when: DateTime<Utc>) -> Self {
        Self {
            name: sanitize_ident_part(&name.into()),
            email: sanitize_ident_part(&email.into()),
            when: truncate_to_seconds(when),
        }
    }

    /// Same name and email; time is ignored.
    #[must_use]
    pub fn same_person(&self, other: &Self) -> bool {
        self.name == other.name && self.email == other.email
    }

    fn encode(&self) -> String {
        format!("{} <{}> {} +0000", self.name, self.email, self.when.timestamp())
    }

    fn decode(line: &str) -> Option<Self> {
        let open = line.rfind('<')?;
        let close = line.rfind('>')?;
        if close < open {
            return None;
        }
        let name = line[..open].trim_end().to_string();
        let email = line[open + 1..close].to_string();
        let mut rest = line[close + 1..].split_whitespace();
        let secs: i64 = rest.next()?.parse().ok()?;
        let when = Utc.timestamp_opt(secs, 0).single()?;
        Some(Self { name, email, when })
    }
}

fn sanitize_ident_part(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '<' | '>' | '\n' | '\0'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Drop sub-second precision.
#[must_use]
pub fn truncate_to_seconds(when: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(when.timestamp(), 0).single().unwrap_or(when)
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

const BLOB_MODE: &str = "100644";

/// A flat tree of blobs keyed by path. Notes trees never nest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, ObjectId>,
}

impl Tree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<ObjectId> {
        self.entries.get(path).copied()
    }

    pub fn insert(&mut self, path: impl Into<String>, blob: ObjectId) {
        self.entries.insert(path.into(), blob);
    }

    pub fn remove(&mut self, path: &str) -> Option<ObjectId> {
        self.entries.remove(path)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ObjectId)> {
        self.entries.iter().map(|(path, id)| (path.as_str(), *id))
    }

    /// Git tree encoding: `<mode> <name>\0<20 raw bytes>` per entry.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 70);
        for (path, id) in &self.entries {
            out.extend_from_slice(BLOB_MODE.as_bytes());
            out.push(b' ');
            out.extend_from_slice(path.as_bytes());
            out.push(0);
            out.extend_from_slice(id.as_bytes());
        }
        out
    }

    /// Decode a git tree holding only blob entries.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed entry.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut entries = BTreeMap::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let space = find_byte(bytes, pos, b' ').ok_or("entry without mode separator")?;
            let mode = std::str::from_utf8(&bytes[pos..space]).map_err(|e| e.to_string())?;
            if mode != BLOB_MODE && mode != "100755" {
                return Err(format!("unsupported tree entry mode {mode}"));
            }
            let nul = find_byte(bytes, space + 1, 0).ok_or("entry without name terminator")?;
            let name = std::str::from_utf8(&bytes[space + 1..nul]).map_err(|e| e.to_string())?;
            let id_end = nul + 1 + ObjectId::LEN;
            let id = bytes
                .get(nul + 1..id_end)
                .and_then(ObjectId::from_slice)
                .ok_or("truncated entry id")?;
            entries.insert(name.to_string(), id);
            pos = id_end;
        }
        Ok(Self { entries })
    }
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from..]
        .iter()
        .position(|b| *b == needle)
        .map(|i| i + from)
}

// ---------------------------------------------------------------------------
// Commits
// ---------------------------------------------------------------------------

/// Decoded commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitData {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: PersonIdent,
    pub committer: PersonIdent,
    pub message: String,
}

impl CommitData {
    #[must_use]
    pub fn first_parent(&self) -> Option<ObjectId> {
        self.parents.first().copied()
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256 + self.message.len());
        out.push_str("tree ");
        out.push_str(&self.tree.to_hex());
        out.push('\n');
        for parent in &self.parents {
            out.push_str("parent ");
            out.push_str(&parent.to_hex());
            out.push('\n');
        }
        out.push_str("author ");
        out.push_str(&self.author.encode());
        out.push('\n');
        out.push_str("committer ");
        out.push_str(&self.committer.encode());
        out.push_str("\n\n");
        out.push_str(&self.message);
        out.into_bytes()
    }

    /// Decode a git commit. Unknown headers (`gpgsig`, `encoding`, ...) and
    /// their continuation lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed header.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
        let (headers, message) = text.split_once("\n\n").unwrap_or((text, ""));

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in headers.lines() {
            if line.starts_with(' ') {
                continue;
            }
            let (key, value) = line.split_once(' ').unwrap_or((line, ""));
            match key {
                "tree" => tree = Some(ObjectId::from_hex(value).map_err(|e| e.to_string())?),
                "parent" => parents.push(ObjectId::from_hex(value).map_err(|e| e.to_string())?),
                "author" => {
                    author = Some(PersonIdent::decode(value).ok_or("malformed author line")?);
                }
                "committer" => {
                    committer =
                        Some(PersonIdent::decode(value).ok_or("malformed committer line")?);
                }
                _ => {}
            }
        }

        Ok(Self {
            tree: tree.ok_or("missing tree header")?,
            parents,
            author: author.ok_or("missing author header")?,
            committer: committer.ok_or("missing committer header")?,
            message: message.to_string(),
        })
    }
}
