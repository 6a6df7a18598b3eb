use chrono::TimeDelta;

use crate::config::RebuildConfig;

use super::event::Event;

/// Time limits for grouping events into one commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windows {
    /// Span from the group's first event.
    pub max_window: TimeDelta,
    /// Gap from the group's previous event.
    pub max_delta: TimeDelta,
}

impl Windows {
    #[must_use]
    pub fn from_config(config: &RebuildConfig) -> Self {
        let millis = |ms: u64| TimeDelta::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1_000_000));
        Self {
            max_window: millis(config.max_window_ms),
            max_delta: millis(config.max_delta_ms),
        }
    }
}

/// Adjacent events that will be written as one commit.
#[derive(Debug, Clone)]
pub struct EventList {
    windows: Windows,
    events: Vec<Event>,
}

impl EventList {
    #[must_use]
    pub const fn new(windows: Windows) -> Self {
        Self {
            windows,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether `event` can join this group: same acting and real account,
    /// same patch set and tag, inside both windows, no second event of a
    /// once-per-commit kind. The final fixup always stands alone.
    #[must_use]
    pub fn can_add(&self, event: &Event) -> bool {
        let (Some(first), Some(last)) = (self.events.first(), self.events.last()) else {
            return true;
        };
        if event.is_final() || last.is_final() {
            return false;
        }
        if event.user != last.user
            || event.real_user != last.real_user
            || event.patch_set != last.patch_set
            || event.tag != last.tag
        {
            return false;
        }
        if event.when - first.when > self.windows.max_window || event.when - last.when > self.windows.max_delta {
            return false;
        }
        !(event.kind.unique_per_update() && self.events.iter().any(|e| e.same_kind(event)))
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Hand back the group and start a new one.
    pub fn take(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

/// Split a sorted, filled timeline into commit-sized groups.
#[must_use]
pub fn group_events(events: Vec<Event>, windows: Windows) -> Vec<Vec<Event>> {
    let mut groups = Vec::new();
    let mut current = EventList::new(windows);
    for event in events {
        if !current.can_add(&event) {
            groups.push(current.take());
        }
        current.push(event);
    }
    if !current.is_empty() {
        groups.push(current.take());
    }
    groups
}
