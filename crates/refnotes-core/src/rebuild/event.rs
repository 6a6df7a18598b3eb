//! Replay events derived from relational rows.
//!
//! Each row becomes one [`Event`] carrying the acting account, the time and
//! the patch set it applies to. Events are sorted into a single timeline and
//! then grouped into commits by [`super::window::EventList`].

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::model::{
    AccountId, Change, ChangeMessage, ChangeStatus, Comment, PatchSet, PatchSetApproval, PatchSetId,
    ReviewerState,
};

/// What an event does when flushed into an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Writes the change's identity; synthesized when the first event is not
    /// the owner creating a patch set.
    CreateChange,
    PatchSet {
        patch_set: PatchSet,
        create_change: bool,
    },
    Approval(PatchSetApproval),
    Reviewer {
        account: AccountId,
        state: ReviewerState,
    },
    /// A published comment.
    Comment(Comment),
    /// A draft comment; only ever grouped with its author's other drafts.
    Draft(Comment),
    Message(ChangeMessage),
    /// Status implied by a message (`Abandoned`, `Restored`).
    Status(ChangeStatus),
    Hashtags(BTreeSet<String>),
    /// Fixes up whatever the replay left different from the row.
    FinalUpdates,
}

impl EventKind {
    /// Kinds that may appear at most once per commit.
    #[must_use]
    pub const fn unique_per_update(&self) -> bool {
        matches!(
            self,
            Self::CreateChange
                | Self::PatchSet { .. }
                | Self::Message(_)
                | Self::Status(_)
                | Self::Hashtags(_)
                | Self::FinalUpdates
        )
    }

    fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Events that must come after their patch set's creation.
    const fn depends_on_patch_set(&self) -> bool {
        matches!(self, Self::Approval(_) | Self::Comment(_) | Self::Message(_) | Self::Status(_))
    }
}

/// One replayable fact about a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// `None` for server-authored events.
    pub user: Option<AccountId>,
    pub real_user: Option<AccountId>,
    pub when: DateTime<Utc>,
    /// `None` until [`fill_events`] assigns one.
    pub patch_set: Option<PatchSetId>,
    pub tag: Option<String>,
    /// The row is older than the change itself; `when` has been clamped to
    /// the change's creation time.
    pub predates_change: bool,
}

impl Event {
    #[must_use]
    pub fn new(
        kind: EventKind,
        user: Option<AccountId>,
        when: DateTime<Utc>,
        patch_set: Option<PatchSetId>,
        change_created_on: DateTime<Utc>,
    ) -> Self {
        let predates_change = when < change_created_on;
        Self {
            kind,
            user,
            real_user: user,
            when: if predates_change { change_created_on } else { when },
            patch_set,
            tag: None,
            predates_change,
        }
    }

    #[must_use]
    pub fn with_real_user(mut self, real_user: Option<AccountId>) -> Self {
        if real_user.is_some() {
            self.real_user = real_user;
        }
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: Option<String>) -> Self {
        self.tag = tag;
        self
    }

    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self.kind, EventKind::FinalUpdates)
    }

    #[must_use]
    pub fn same_kind(&self, other: &Self) -> bool {
        self.kind.same_kind(&other.kind)
    }

    /// Timeline order: final fixup last, pre-creation rows first, then time,
    /// acting account (server last), patch set.
    #[must_use]
    pub fn timeline_cmp(&self, other: &Self) -> Ordering {
        self.is_final()
            .cmp(&other.is_final())
            .then_with(|| other.predates_change.cmp(&self.predates_change))
            .then_with(|| self.when.cmp(&other.when))
            .then_with(|| nulls_last(self.user, other.user))
            .then_with(|| nulls_last(self.patch_set, other.patch_set))
    }
}

fn nulls_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ----------------------------------------------------------------------
// Message inference
// ----------------------------------------------------------------------

/// Topic change spelled out in a message: `Some(Some(t))` sets, `Some(None)`
/// clears, `None` means the message says nothing about the topic.
#[must_use]
pub fn infer_topic(message: &str) -> Option<Option<String>> {
    let line = message.lines().next()?.trim();
    if let Some(topic) = line.strip_prefix("Topic set to ") {
        return Some(Some(topic.to_string()));
    }
    if let Some(rest) = line.strip_prefix("Topic changed from ") {
        let (_, new) = rest.rsplit_once(" to ")?;
        return Some(Some(new.to_string()));
    }
    if let Some(rest) = line.strip_prefix("Topic ") {
        if let Some(old) = rest.strip_suffix(" removed") {
            if !old.is_empty() {
                return Some(None);
            }
        }
    }
    None
}

/// Status change spelled out in a message.
#[must_use]
pub fn infer_status(message: &str) -> Option<ChangeStatus> {
    if message.starts_with("Abandoned") {
        Some(ChangeStatus::Abandoned)
    } else if message.starts_with("Restored") {
        Some(ChangeStatus::New)
    } else {
        None
    }
}

// ----------------------------------------------------------------------
// Ordering
// ----------------------------------------------------------------------

/// Sort into timeline order, then move any event that depends on a patch
/// set to just after that patch set's creation when it would otherwise come
/// first.
pub fn sort_events(events: &mut Vec<Event>) {
    events.sort_by(Event::timeline_cmp);

    let mut created: BTreeSet<PatchSetId> = BTreeSet::new();
    let mut waiting: HashMap<PatchSetId, Vec<Event>> = HashMap::new();
    let mut sorted = Vec::with_capacity(events.len());
    for event in events.drain(..) {
        if let EventKind::PatchSet { patch_set, .. } = &event.kind {
            let id = patch_set.id;
            created.insert(id);
            sorted.push(event);
            sorted.extend(waiting.remove(&id).unwrap_or_default());
            continue;
        }
        match event.patch_set {
            Some(ps) if event.kind.depends_on_patch_set() && !created.contains(&ps) => {
                waiting.entry(ps).or_default().push(event);
            }
            _ => sorted.push(event),
        }
    }
    // Dependencies on patch sets that never appear were filtered upstream;
    // keep anything left rather than drop it.
    let mut leftovers: Vec<Event> = waiting.into_values().flatten().collect();
    leftovers.sort_by(Event::timeline_cmp);
    sorted.extend(leftovers);
    *events = sorted;
}

/// Mark or synthesize the change creation, then give every event a patch
/// set and a non-decreasing time.
pub fn fill_events(events: &mut Vec<Event>, change: &Change, min_patch_set: PatchSetId) {
    let owner_creates = match events.first() {
        Some(Event {
            kind: EventKind::PatchSet { .. },
            user,
            ..
        }) => *user == Some(change.owner),
        _ => false,
    };
    if owner_creates {
        if let Some(EventKind::PatchSet { create_change, .. }) = events.first_mut().map(|e| &mut e.kind) {
            *create_change = true;
        }
    } else {
        let create = Event::new(
            EventKind::CreateChange,
            Some(change.owner),
            change.created_on,
            Some(min_patch_set),
            change.created_on,
        );
        events.insert(0, create);
    }

    let mut last_ps = min_patch_set;
    let mut last_when: Option<DateTime<Utc>> = None;
    for event in events.iter_mut() {
        match event.patch_set {
            Some(ps) => last_ps = last_ps.max(ps),
            None => event.patch_set = Some(last_ps),
        }
        if let Some(last) = last_when {
            if event.when < last {
                event.when = last;
            }
        }
        last_when = Some(event.when);
    }
}
