//! Client half of the step-log protocol.
//!
//! The client keeps its document at the last confirmed server version plus
//! a list of unconfirmed local steps applied on top. When remote steps
//! arrive, the unconfirmed steps are undone, the remote steps applied, and
//! the local steps mapped over them and re-applied. Mirror pairs between
//! each undo and its re-application keep positions inside locally inserted
//! content stable across the rebase.

use crate::error::Result;
use tandem_server::{ClientId, CommentEvent, SubmitEvents};
use tandem_transform::{Doc, Mapping, Step, Transform};
use tracing::debug;

/// A local step together with its inverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rebaseable {
    pub step: Step,
    pub inverted: Step,
}

/// Steps that can be submitted, with the version they are based on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sendable {
    pub version: u64,
    pub steps: Vec<Step>,
    pub client_id: ClientId,
}

impl Sendable {
    pub fn into_submit(self, comment: Vec<CommentEvent>) -> SubmitEvents {
        SubmitEvents {
            version: self.version,
            steps: self.steps,
            client_id: self.client_id,
            comment,
        }
    }
}

/// The outcome of receiving steps.
#[derive(Clone, Debug)]
pub struct Received {
    /// Every change the local document went through.
    pub transform: Transform,
    to_local: Mapping,
}

impl Received {
    /// Maps positions in the server's document (after the received steps)
    /// to the new local document, that is through the unconfirmed steps
    /// still applied on top of it.
    pub fn remote_to_local(&self) -> &Mapping {
        &self.to_local
    }
}

/// Local document state relative to the server.
#[derive(Clone, Debug)]
pub struct CollabState {
    doc: Doc,
    version: u64,
    unconfirmed: Vec<Rebaseable>,
    client_id: ClientId,
}

impl CollabState {
    pub fn new(doc: Doc, version: u64, client_id: ClientId) -> Self {
        Self {
            doc,
            version,
            unconfirmed: Vec::new(),
            client_id,
        }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// The last confirmed server version.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn unconfirmed(&self) -> &[Rebaseable] {
        &self.unconfirmed
    }

    pub fn has_sendable_steps(&self) -> bool {
        !self.unconfirmed.is_empty()
    }

    /// Apply local steps. Nothing changes when one of them fails.
    pub fn apply_local(&mut self, steps: Vec<Step>) -> Result<Transform> {
        let mut tr = Transform::new(self.doc.clone());
        for step in steps {
            tr.step(step)?;
        }
        let rebaseable = tr
            .steps()
            .iter()
            .zip(tr.docs())
            .map(|(step, before)| {
                Ok(Rebaseable {
                    step: step.clone(),
                    inverted: step.invert(before)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.doc = tr.doc().clone();
        self.unconfirmed.extend(rebaseable);
        Ok(tr)
    }

    pub fn sendable_steps(&self) -> Option<Sendable> {
        if self.unconfirmed.is_empty() {
            return None;
        }
        Some(Sendable {
            version: self.version,
            steps: self.unconfirmed.iter().map(|r| r.step.clone()).collect(),
            client_id: self.client_id,
        })
    }

    /// Take in steps from the server, in server order.
    ///
    /// A leading run of our own steps confirms that many unconfirmed steps.
    /// Nothing changes when a remote step does not apply.
    pub fn receive(&mut self, steps: &[Step], client_ids: &[ClientId]) -> Result<Received> {
        let ours = client_ids
            .iter()
            .take_while(|id| **id == self.client_id)
            .count()
            .min(steps.len());
        let version = self.version + steps.len() as u64;
        let confirmed = ours.min(self.unconfirmed.len());
        let unconfirmed = &self.unconfirmed[confirmed..];
        let remote = &steps[ours..];

        let mut tr = Transform::new(self.doc.clone());
        if remote.is_empty() {
            // The local document stays as it is; the server document sits
            // below the unconfirmed steps that remain.
            self.unconfirmed.drain(..confirmed);
            self.version = version;
            let to_local =
                Mapping::from_maps(self.unconfirmed.iter().map(|r| r.step.get_map()).collect());
            return Ok(Received {
                transform: tr,
                to_local,
            });
        }

        let rebased = rebase_steps(unconfirmed, remote, &mut tr)?;
        let local_start = unconfirmed.len() + remote.len();
        debug!(
            remote = remote.len(),
            rebased = rebased.len(),
            dropped = unconfirmed.len() - rebased.len(),
            "received remote steps"
        );

        self.doc = tr.doc().clone();
        self.unconfirmed = rebased;
        self.version = version;
        let to_local = tr.mapping().slice_from(local_start);
        Ok(Received {
            transform: tr,
            to_local,
        })
    }
}

/// Undo `steps`, apply `over`, then map and re-apply `steps`.
///
/// Local steps that no longer apply are dropped.
fn rebase_steps(steps: &[Rebaseable], over: &[Step], tr: &mut Transform) -> Result<Vec<Rebaseable>> {
    for rebaseable in steps.iter().rev() {
        tr.step(rebaseable.inverted.clone())?;
    }
    for step in over {
        tr.step(step.clone())?;
    }

    let mut result = Vec::with_capacity(steps.len());
    let mut map_from = steps.len();
    for rebaseable in steps {
        let mapped = rebaseable.step.map(&tr.mapping().slice_from(map_from));
        map_from -= 1;
        let Some(mapped) = mapped else {
            continue;
        };
        let before = tr.doc().clone();
        if tr.step(mapped.clone()).is_err() {
            continue;
        }
        let last = tr.mapping().len() - 1;
        tr.mapping_mut().set_mirror(map_from, last);
        result.push(Rebaseable {
            inverted: mapped.invert(&before)?,
            step: mapped,
        });
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_transform::Assoc;

    const ME: ClientId = ClientId(1);
    const OTHER: ClientId = ClientId(2);

    #[test]
    fn test_local_steps_are_sendable() {
        let mut state = CollabState::new(Doc::new("abc"), 4, ME);
        assert!(state.sendable_steps().is_none());

        state.apply_local(vec![Step::insert(3, "d")]).unwrap();
        let sendable = state.sendable_steps().unwrap();
        assert_eq!(sendable.version, 4);
        assert_eq!(sendable.steps, vec![Step::insert(3, "d")]);
        assert_eq!(state.doc().text(), "abcd");
    }

    #[test]
    fn test_failed_local_batch_changes_nothing() {
        let mut state = CollabState::new(Doc::new("abc"), 0, ME);
        assert!(state
            .apply_local(vec![Step::insert(0, "x"), Step::delete(3, 9)])
            .is_err());
        assert_eq!(state.doc().text(), "abc");
        assert!(!state.has_sendable_steps());
    }

    #[test]
    fn test_own_steps_confirm() {
        let mut state = CollabState::new(Doc::new(""), 0, ME);
        state.apply_local(vec![Step::insert(0, "a")]).unwrap();
        state.apply_local(vec![Step::insert(1, "b")]).unwrap();

        let received = state.receive(&[Step::insert(0, "a")], &[ME]).unwrap();
        assert!(!received.transform.doc_changed());
        assert_eq!(state.version(), 1);
        assert_eq!(state.unconfirmed().len(), 1);
        assert_eq!(state.doc().text(), "ab");
    }

    #[test]
    fn test_remote_steps_without_local_changes() {
        let mut state = CollabState::new(Doc::new("world"), 3, ME);
        state.receive(&[Step::insert(0, "hello ")], &[OTHER]).unwrap();
        assert_eq!(state.doc().text(), "hello world");
        assert_eq!(state.version(), 4);
    }

    #[test]
    fn test_rebase_over_remote_insert() {
        let mut state = CollabState::new(Doc::new("abc"), 0, ME);
        state.apply_local(vec![Step::insert(3, "!")]).unwrap();

        let received = state.receive(&[Step::insert(0, "xy")], &[OTHER]).unwrap();
        assert_eq!(state.doc().text(), "xyabc!");
        assert_eq!(state.unconfirmed()[0].step, Step::insert(5, "!"));
        assert_eq!(state.version(), 1);

        // A position inside our own insertion survives the rebase.
        assert_eq!(received.transform.mapping().map(4, Assoc::Before), 6);
        // Server positions map past our re-applied insertion.
        assert_eq!(received.remote_to_local().map(5, Assoc::After), 6);
    }

    #[test]
    fn test_remote_deletion_swallows_local_edit() {
        let mut state = CollabState::new(Doc::new("0123456789"), 0, ME);
        state.apply_local(vec![Step::delete(3, 5)]).unwrap();

        state.receive(&[Step::delete(2, 8)], &[OTHER]).unwrap();
        assert_eq!(state.doc().text(), "0189");
        assert!(state.unconfirmed().is_empty());
    }

    #[test]
    fn test_mixed_confirmation_and_remote() {
        let mut state = CollabState::new(Doc::new("ab"), 0, ME);
        state.apply_local(vec![Step::insert(2, "1")]).unwrap();
        state.apply_local(vec![Step::insert(3, "2")]).unwrap();

        // Our first step landed, then someone else's, our second is still pending.
        state
            .receive(&[Step::insert(2, "1"), Step::insert(0, ">")], &[ME, OTHER])
            .unwrap();
        assert_eq!(state.version(), 2);
        assert_eq!(state.doc().text(), ">ab12");
        assert_eq!(state.unconfirmed().len(), 1);
        assert_eq!(state.unconfirmed()[0].step, Step::insert(4, "2"));
    }

    #[test]
    fn test_server_positions_map_over_pending_steps() {
        let mut state = CollabState::new(Doc::new("hello"), 2, ME);
        state.apply_local(vec![Step::insert(0, "abc")]).unwrap();

        // Nothing but comment events arrived, the local insertion is pending.
        let received = state.receive(&[], &[]).unwrap();
        assert!(!received.transform.doc_changed());
        let to_local = received.remote_to_local();
        assert_eq!(to_local.map(0, Assoc::After), 3);
        assert_eq!(to_local.map(2, Assoc::Before), 5);
        assert_eq!(state.version(), 2);
    }

    #[test]
    fn test_failed_remote_step_changes_nothing() {
        let mut state = CollabState::new(Doc::new("abc"), 0, ME);
        state.apply_local(vec![Step::insert(0, "x")]).unwrap();
        assert!(state.receive(&[Step::delete(0, 40)], &[OTHER]).is_err());
        assert_eq!(state.doc().text(), "xabc");
        assert_eq!(state.version(), 0);
        assert_eq!(state.unconfirmed().len(), 1);
    }
}
