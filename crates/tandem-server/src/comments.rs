//! Comment store - annotations anchored to document ranges.
//!
//! Comments carry their own version stream, independent of the document
//! version. Every `created`/`deleted` call appends exactly one event to the
//! log and bumps the version, so `events.len() == version` always holds.
//! Clients sync by asking for the events after their comment version.

use crate::error::{InstanceError, Result};
use crate::protocol::CommentEvent;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tandem_transform::{Assoc, Mapping};

/// An annotation on the range `from..to`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: u32,
    pub from: usize,
    pub to: usize,
    pub text: String,
}

impl Comment {
    pub fn new(from: usize, to: usize, text: impl Into<String>, id: u32) -> Self {
        Self {
            id,
            from,
            to,
            text: text.into(),
        }
    }

    /// Create a comment with a random 32-bit id.
    pub fn with_random_id(from: usize, to: usize, text: impl Into<String>) -> Self {
        Self::new(from, to, text, rand::thread_rng().gen())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogEntry {
    Create(u32),
    Delete(u32),
}

/// The live comments of an instance plus their event log.
#[derive(Clone, Debug, Default)]
pub struct Comments {
    comments: Vec<Comment>,
    events: Vec<LogEntry>,
    version: u64,
}

impl Comments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a store from persisted comments. The event log starts empty.
    pub fn from_comments(comments: Vec<Comment>) -> Self {
        Self {
            comments,
            events: Vec::new(),
            version: 0,
        }
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Comment> {
        self.index(id).map(|i| &self.comments[i])
    }

    /// Map every comment through a document change.
    ///
    /// Comments whose range collapses are dropped. This must run before the
    /// events of the same batch are recorded.
    pub fn map_through(&mut self, mapping: &Mapping) {
        self.comments.retain_mut(|comment| {
            let from = mapping.map(comment.from, Assoc::After);
            let to = mapping.map(comment.to, Assoc::Before);
            if from >= to {
                return false;
            }
            comment.from = from;
            comment.to = to;
            true
        });
    }

    pub fn created(&mut self, comment: Comment) {
        self.events.push(LogEntry::Create(comment.id));
        self.comments.push(comment);
        self.version += 1;
    }

    /// Record a deletion. Unknown ids still produce an event.
    pub fn deleted(&mut self, id: u32) {
        if let Some(found) = self.index(id) {
            self.comments.remove(found);
        }
        self.events.push(LogEntry::Delete(id));
        self.version += 1;
    }

    fn index(&self, id: u32) -> Option<usize> {
        self.comments.iter().position(|c| c.id == id)
    }

    /// Translate a client's comment version into an index into the event log.
    pub fn event_start(&self, version: u64) -> Result<usize> {
        if version > self.version {
            return Err(InstanceError::InvalidCommentVersion(version));
        }
        Ok(self.events.len() - (self.version - version) as usize)
    }

    /// Events from `start` on, with creates resolved against live state.
    ///
    /// A create whose comment has since disappeared is skipped.
    pub fn events_after(&self, start: usize) -> Vec<CommentEvent> {
        self.events
            .iter()
            .skip(start)
            .filter_map(|event| match *event {
                LogEntry::Delete(id) => Some(CommentEvent::Delete { id }),
                LogEntry::Create(id) => self.get(id).map(|c| CommentEvent::Create {
                    id,
                    from: c.from,
                    to: c.to,
                    text: c.text.clone(),
                }),
            })
            .collect()
    }
}
