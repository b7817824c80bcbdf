//! Change tracking: a commit log over document edits, a blame map telling
//! which commit wrote each range, and reverting individual commits.
//!
//! Changes accumulate as uncommitted steps until [`TrackState::apply_commit`]
//! bundles them into a [`Commit`]. Ranges written since the last commit are
//! attributed to the commit that will be created next.

use crate::error::{ClientError, Result};
use chrono::{DateTime, Utc};
use tandem_transform::{Assoc, Doc, Mapping, Step, StepError, StepMap, Transform};

/// A range of the document and the commit that wrote it.
///
/// `commit` is `None` for text that predates tracking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub from: usize,
    pub to: usize,
    pub commit: Option<usize>,
}

impl Span {
    fn new(from: usize, to: usize, commit: Option<usize>) -> Self {
        Self { from, to, commit }
    }
}

/// A committed group of changes.
#[derive(Clone, Debug)]
pub struct Commit {
    pub message: String,
    pub time: DateTime<Utc>,
    /// Inverted steps, each applicable to the document right after the
    /// step it undoes.
    pub steps: Vec<Step>,
    pub maps: Vec<StepMap>,
}

#[derive(Clone, Debug, Default)]
pub struct TrackState {
    blame_map: Vec<Span>,
    commits: Vec<Commit>,
    uncommitted_steps: Vec<Step>,
    uncommitted_maps: Vec<StepMap>,
}

impl TrackState {
    /// Start tracking `doc`. Its existing text belongs to no commit.
    pub fn new(doc: &Doc) -> Self {
        let size = doc.content_size();
        let blame_map = if size > 0 {
            vec![Span::new(0, size, None)]
        } else {
            Vec::new()
        };
        Self {
            blame_map,
            ..Self::default()
        }
    }

    pub fn blame_map(&self) -> &[Span] {
        &self.blame_map
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn has_uncommitted(&self) -> bool {
        !self.uncommitted_steps.is_empty()
    }

    /// Record the changes made by `tr`.
    pub fn apply_transform(&mut self, tr: &Transform) -> Result<()> {
        let inverted = tr
            .steps()
            .iter()
            .zip(tr.docs())
            .map(|(step, doc)| step.invert(doc))
            .collect::<std::result::Result<Vec<_>, StepError>>()?;

        self.blame_map = update_blame_map(&self.blame_map, tr.mapping(), self.commits.len());
        self.uncommitted_steps.extend(inverted);
        self.uncommitted_maps.extend(tr.mapping().maps().iter().cloned());
        Ok(())
    }

    /// Bundle the uncommitted changes into a commit. Returns `false` when
    /// there was nothing to commit.
    pub fn apply_commit(&mut self, message: impl Into<String>, time: DateTime<Utc>) -> bool {
        if self.uncommitted_steps.is_empty() {
            return false;
        }
        self.commits.push(Commit {
            message: message.into(),
            time,
            steps: std::mem::take(&mut self.uncommitted_steps),
            maps: std::mem::take(&mut self.uncommitted_maps),
        });
        true
    }

    /// Build a transform over `doc` (the current document) that undoes
    /// commit `index`, with its steps rebased over everything after it.
    /// Steps that no longer apply are skipped.
    pub fn revert_commit(&self, index: usize, doc: &Doc) -> Result<Transform> {
        let commit = self
            .commits
            .get(index)
            .ok_or(ClientError::NoSuchCommit(index))?;
        if self.has_uncommitted() {
            return Err(ClientError::UncommittedChanges);
        }

        // From the document before the commit to the current one.
        let mut remap = Mapping::from_maps(
            self.commits[index..]
                .iter()
                .flat_map(|c| c.maps.iter().cloned())
                .collect(),
        );
        let mut tr = Transform::new(doc.clone());
        for (i, step) in commit.steps.iter().enumerate().rev() {
            let Some(remapped) = step.map(&remap.slice_from(i + 1)) else {
                continue;
            };
            if tr.step(remapped.clone()).is_ok() {
                remap.append_map(remapped.get_map(), Some(i));
            }
        }
        Ok(tr)
    }

    pub fn revert_message(&self, index: usize) -> Option<String> {
        self.commits
            .get(index)
            .map(|commit| format!("Revert '{}'", commit.message))
    }

    /// The commit that wrote the text at `pos`.
    pub fn find_in_blame_map(&self, pos: usize) -> Option<usize> {
        self.blame_map
            .iter()
            .find(|span| span.to >= pos)
            .and_then(|span| span.commit)
    }

    /// Ranges written by commit `index`.
    pub fn spans_for(&self, index: usize) -> impl Iterator<Item = &Span> {
        self.blame_map
            .iter()
            .filter(move |span| span.commit == Some(index))
    }
}

fn update_blame_map(map: &[Span], mapping: &Mapping, commit: usize) -> Vec<Span> {
    let mut result: Vec<Span> = map
        .iter()
        .filter_map(|span| {
            let from = mapping.map(span.from, Assoc::After);
            let to = mapping.map(span.to, Assoc::Before);
            (from < to).then_some(Span::new(from, to, span.commit))
        })
        .collect();

    for (i, step_map) in mapping.maps().iter().enumerate() {
        let after = mapping.slice_from(i + 1);
        step_map.for_each(|_, _, start, end| {
            insert_into_blame_map(
                &mut result,
                after.map(start, Assoc::After),
                after.map(end, Assoc::Before),
                commit,
            );
        });
    }

    coalesce(&mut result);
    result
}

/// Paint `from..to` as written by `commit`, trimming or removing the spans
/// it covers and absorbing touching spans of the same commit.
fn insert_into_blame_map(map: &mut Vec<Span>, mut from: usize, mut to: usize, commit: usize) {
    if from >= to {
        return;
    }
    let commit = Some(commit);

    let mut pos = 0;
    while pos < map.len() {
        let next = map[pos];
        if next.commit == commit {
            if next.to >= from {
                break;
            }
        } else if next.to > from {
            // Keep the part sticking out on the left; the right side is
            // handled below.
            if next.from < from {
                let left = Span::new(next.from, from, next.commit);
                if next.to > to {
                    map.insert(pos, left);
                } else {
                    map[pos] = left;
                }
                pos += 1;
            }
            break;
        }
        pos += 1;
    }

    while pos < map.len() {
        let next = map[pos];
        if next.commit == commit {
            if next.from > to {
                break;
            }
            from = from.min(next.from);
            to = to.max(next.to);
            map.remove(pos);
        } else {
            if next.from >= to {
                break;
            }
            if next.to > to {
                map[pos] = Span::new(to, next.to, next.commit);
                break;
            }
            map.remove(pos);
        }
    }

    map.insert(pos, Span::new(from, to, commit));
}

fn coalesce(map: &mut Vec<Span>) {
    map.dedup_by(|next, prev| {
        if prev.commit == next.commit && prev.to == next.from {
            prev.to = next.to;
            true
        } else {
            false
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edit(track: &mut TrackState, doc: &Doc, steps: Vec<Step>) -> Doc {
        let mut tr = Transform::new(doc.clone());
        for step in steps {
            tr.step(step).unwrap();
        }
        track.apply_transform(&tr).unwrap();
        tr.doc().clone()
    }

    #[test]
    fn test_new_covers_document() {
        assert_eq!(
            TrackState::new(&Doc::new("abc")).blame_map(),
            &[Span::new(0, 3, None)]
        );
        assert!(TrackState::new(&Doc::empty()).blame_map().is_empty());
    }

    #[test]
    fn test_insert_is_attributed_to_next_commit() {
        let doc = Doc::new("hello");
        let mut track = TrackState::new(&doc);
        edit(&mut track, &doc, vec![Step::insert(5, " world")]);

        assert_eq!(
            track.blame_map(),
            &[Span::new(0, 5, None), Span::new(5, 11, Some(0))]
        );
        assert_eq!(track.find_in_blame_map(8), Some(0));
        assert_eq!(track.find_in_blame_map(2), None);
    }

    #[test]
    fn test_overwrite_splits_span() {
        let doc = Doc::empty();
        let mut track = TrackState::new(&doc);
        let doc = edit(&mut track, &doc, vec![Step::insert(0, "aaaa")]);
        assert!(track.apply_commit("first", Utc::now()));
        edit(&mut track, &doc, vec![Step::new(1, 3, "bb")]);

        assert_eq!(
            track.blame_map(),
            &[
                Span::new(0, 1, Some(0)),
                Span::new(1, 3, Some(1)),
                Span::new(3, 4, Some(0)),
            ]
        );
        assert_eq!(track.spans_for(0).count(), 2);
    }

    #[test]
    fn test_same_commit_spans_merge() {
        let doc = Doc::new("xy");
        let mut track = TrackState::new(&doc);
        let doc = edit(&mut track, &doc, vec![Step::insert(1, "ab")]);
        // Deleting the original text between two pieces of new text joins them.
        let doc = edit(&mut track, &doc, vec![Step::insert(4, "cd"), Step::delete(3, 4)]);

        assert_eq!(doc.text(), "xabcd");
        assert_eq!(
            track.blame_map(),
            &[Span::new(0, 1, None), Span::new(1, 5, Some(0))]
        );
    }

    #[test]
    fn test_commit_requires_changes() {
        let mut track = TrackState::new(&Doc::new("abc"));
        assert!(!track.apply_commit("nothing", Utc::now()));
        assert!(track.commits().is_empty());
    }

    #[test]
    fn test_revert_commit() {
        let doc = Doc::empty();
        let mut track = TrackState::new(&doc);
        let doc = edit(&mut track, &doc, vec![Step::insert(0, "Type something")]);
        track.apply_commit("Initial commit", Utc::now());
        let doc = edit(&mut track, &doc, vec![Step::insert(0, "> "), Step::insert(16, ".")]);
        track.apply_commit("Decorate", Utc::now());
        assert_eq!(doc.text(), "> Type something.");

        let tr = track.revert_commit(0, &doc).unwrap();
        assert_eq!(tr.doc().text(), "> .");
        assert_eq!(track.revert_message(0).unwrap(), "Revert 'Initial commit'");

        track.apply_transform(&tr).unwrap();
        assert!(track.apply_commit(track.revert_message(0).unwrap(), Utc::now()));
        assert_eq!(track.commits().len(), 3);
    }

    #[test]
    fn test_revert_over_later_edit_inside() {
        let doc = Doc::empty();
        let mut track = TrackState::new(&doc);
        let doc = edit(&mut track, &doc, vec![Step::insert(0, "abc"), Step::insert(3, "def")]);
        track.apply_commit("one", Utc::now());
        let doc = edit(&mut track, &doc, vec![Step::insert(6, "!")]);
        track.apply_commit("two", Utc::now());

        let tr = track.revert_commit(0, &doc).unwrap();
        assert_eq!(tr.doc().text(), "!");
    }

    #[test]
    fn test_revert_refuses_uncommitted() {
        let doc = Doc::new("abc");
        let mut track = TrackState::new(&doc);
        let doc = edit(&mut track, &doc, vec![Step::insert(0, "x")]);
        track.apply_commit("x", Utc::now());
        let doc = edit(&mut track, &doc, vec![Step::insert(0, "y")]);

        assert!(matches!(
            track.revert_commit(0, &doc),
            Err(ClientError::UncommittedChanges)
        ));
        assert!(matches!(
            track.revert_commit(5, &doc),
            Err(ClientError::NoSuchCommit(5))
        ));
    }
}
