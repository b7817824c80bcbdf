//! Client-side comment state.

use tandem_server::{Comment, CommentEvent};
use tandem_transform::{Assoc, Mapping};

/// A comment action not yet acknowledged by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnsentAction {
    New(u32),
    Delete(u32),
}

/// Live comments in local coordinates, plus unsent actions.
#[derive(Clone, Debug, Default)]
pub struct CommentState {
    comments: Vec<Comment>,
    version: u64,
    unsent: Vec<UnsentAction>,
}

impl CommentState {
    pub fn new(version: u64, comments: Vec<Comment>) -> Self {
        Self {
            comments,
            version,
            unsent: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn get(&self, id: u32) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == id)
    }

    pub fn unsent(&self) -> &[UnsentAction] {
        &self.unsent
    }

    pub fn has_unsent(&self) -> bool {
        !self.unsent.is_empty()
    }

    /// Comments strictly surrounding `pos`.
    pub fn comments_at(&self, pos: usize) -> Vec<&Comment> {
        self.comments
            .iter()
            .filter(|c| c.from < pos && c.to > pos)
            .collect()
    }

    /// Add a comment made locally.
    pub fn create(&mut self, comment: Comment) {
        self.unsent.push(UnsentAction::New(comment.id));
        self.insert(comment);
    }

    /// Delete a comment locally. Returns `false` when it does not exist.
    pub fn delete(&mut self, id: u32) -> bool {
        if self.remove(id) {
            self.unsent.push(UnsentAction::Delete(id));
            true
        } else {
            false
        }
    }

    fn insert(&mut self, comment: Comment) {
        if self.get(comment.id).is_none() {
            self.comments.push(comment);
        }
    }

    fn remove(&mut self, id: u32) -> bool {
        let before = self.comments.len();
        self.comments.retain(|c| c.id != id);
        self.comments.len() != before
    }

    /// Map every comment through a local document change, dropping the ones
    /// whose range collapses.
    pub fn map_through(&mut self, mapping: &Mapping) {
        self.comments.retain_mut(|comment| {
            let from = mapping.map(comment.from, Assoc::After);
            let to = mapping.map(comment.to, Assoc::Before);
            comment.from = from;
            comment.to = to;
            from < to
        });
    }

    /// Unsent actions as wire events, with creates resolved against the
    /// current ranges. Creates of comments deleted since are left out.
    pub fn unsent_events(&self) -> Vec<CommentEvent> {
        self.unsent
            .iter()
            .filter_map(|action| match *action {
                UnsentAction::New(id) => self.get(id).map(|c| CommentEvent::Create {
                    id,
                    from: c.from,
                    to: c.to,
                    text: c.text.clone(),
                }),
                UnsentAction::Delete(id) => Some(CommentEvent::Delete { id }),
            })
            .collect()
    }

    /// Apply comment events from the server.
    ///
    /// `to_local` carries server positions into the local document. Events
    /// are idempotent: known creates and unknown deletes are ignored.
    pub fn receive(&mut self, version: u64, events: Vec<CommentEvent>, to_local: &Mapping) {
        for event in events {
            match event {
                CommentEvent::Delete { id } => {
                    self.remove(id);
                }
                CommentEvent::Create { id, from, to, text } => {
                    let from = to_local.map(from, Assoc::After);
                    let to = to_local.map(to, Assoc::Before);
                    if from < to {
                        self.insert(Comment::new(from, to, text, id));
                    }
                }
            }
        }
        self.version = version;
    }

    /// The server accepted our first `actions` unsent actions, which went
    /// out as `events` wire events.
    ///
    /// The server's comment version is adopted only when it accounts for
    /// exactly our events; otherwise others commented in between and the
    /// next poll has to fetch their events.
    pub fn confirm_sent(&mut self, server_version: u64, actions: usize, events: usize) {
        let actions = actions.min(self.unsent.len());
        self.unsent.drain(..actions);
        if server_version == self.version + events as u64 {
            self.version = server_version;
        }
    }
}
