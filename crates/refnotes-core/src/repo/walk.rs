use super::{CommitData, ObjectId, ObjectReader, RepoError};

/// First-parent history walk from a tip toward the root.
///
/// Change histories are linear, so following first parents visits every
/// commit exactly once, newest first.
pub struct CommitWalk<'a, R: ObjectReader + ?Sized> {
    reader: &'a R,
    next: Option<ObjectId>,
}

impl<'a, R: ObjectReader + ?Sized> CommitWalk<'a, R> {
    /// Start at `tip`; a zero tip yields nothing.
    pub fn new(reader: &'a R, tip: ObjectId) -> Self {
        Self {
            reader,
            next: tip.non_zero(),
        }
    }
}

impl<R: ObjectReader + ?Sized> Iterator for CommitWalk<'_, R> {
    type Item = Result<(ObjectId, CommitData), RepoError>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.reader.read_commit(id) {
            Ok(commit) => {
                self.next = commit.first_parent();
                Some(Ok((id, commit)))
            }
            Err(err) => Some(Err(err)),
        }
    }
}
