//! The editor connection state machine.
//!
//! [`EditorConnection`] does no I/O. Every [`Action`] or [`Response`] fed to
//! it may produce one [`Request`] for the driver to perform; a new request
//! replaces whatever was in flight, and responses to replaced requests are
//! ignored. At most one request is outstanding at any time.

use crate::collab::CollabState;
use crate::comments::{CommentState, UnsentAction};
use crate::error::{ClientError, RequestError, Result};
use crate::report::{Reporter, Status};
use std::collections::VecDeque;
use std::time::Duration;
use tandem_server::{
    ClientId, Comment, CommentEvent, DocSnapshot, EventsResponse, SubmitEvents, Versions,
};
use tandem_transform::{Assoc, Doc, Mapping, Step, Transform};
use tracing::{debug, warn};

/// Tuning for the connection.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// First retry delay after a transient failure (in milliseconds).
    pub initial_backoff_ms: u64,
    /// Upper bound for the retry delay (in milliseconds).
    pub max_backoff_ms: u64,
    /// A delay is reported once the backoff grows past this (in milliseconds).
    pub delay_report_ms: u64,
    /// Documents larger than this are detached from the server.
    pub max_doc_size: usize,
    /// How long a reported failure survives later successes (in milliseconds).
    pub failure_sticky_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 60_000,
            delay_report_ms: 1000,
            max_doc_size: 40_000,
            failure_sticky_ms: 10_000,
        }
    }
}

impl ConnectionConfig {
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::new()
    }
}

/// Builder for connection configuration.
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
}

impl ConnectionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
        }
    }

    pub fn initial_backoff(mut self, ms: u64) -> Self {
        self.config.initial_backoff_ms = ms;
        self
    }

    pub fn max_backoff(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn delay_report(mut self, ms: u64) -> Self {
        self.config.delay_report_ms = ms;
        self
    }

    pub fn max_doc_size(mut self, size: usize) -> Self {
        self.config.max_doc_size = size;
        self
    }

    pub fn failure_sticky(mut self, ms: u64) -> Self {
        self.config.failure_sticky_ms = ms;
        self
    }

    pub fn build(self) -> ConnectionConfig {
        self.config
    }
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A change to the editor state.
#[derive(Clone, Debug)]
pub enum Transaction {
    /// Steps made by the local user.
    Local(Vec<Step>),
    NewComment {
        from: usize,
        to: usize,
        text: String,
    },
    DeleteComment(u32),
    /// Events received from a poll.
    Receive {
        steps: Vec<Step>,
        client_ids: Vec<ClientId>,
        comment_version: u64,
        comment_events: Vec<CommentEvent>,
    },
    /// The server accepted a submission.
    Confirm {
        steps: Vec<Step>,
        comment_version: u64,
        comment_actions: usize,
        comment_events: usize,
    },
}

impl Transaction {
    fn is_remote(&self) -> bool {
        matches!(self, Transaction::Receive { .. } | Transaction::Confirm { .. })
    }
}

/// Local revisions whose changes are kept for mapping late edits.
const MAX_REVISION_HISTORY: usize = 500;

/// What goes out with the next submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outgoing {
    pub submit: SubmitEvents,
    /// Unsent comment actions covered by `submit`.
    pub comment_actions: usize,
}

/// The document and comments as the editor sees them.
///
/// Every change to the local document bumps the local revision. Edits made
/// against an older revision are mapped over the changes since then before
/// they are applied (see [`EditState::rebase_local`]).
#[derive(Clone, Debug)]
pub struct EditState {
    collab: CollabState,
    comments: CommentState,
    revision: u64,
    /// Mappings of the most recent revisions, oldest first.
    history: VecDeque<Mapping>,
}

impl EditState {
    pub fn from_snapshot(snapshot: DocSnapshot, client_id: ClientId) -> Self {
        Self {
            collab: CollabState::new(snapshot.doc, snapshot.version, client_id),
            comments: CommentState::new(snapshot.comment_version, snapshot.comments),
            revision: 0,
            history: VecDeque::new(),
        }
    }

    /// The local revision of the document.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn doc(&self) -> &Doc {
        self.collab.doc()
    }

    pub fn collab(&self) -> &CollabState {
        &self.collab
    }

    pub fn comments(&self) -> &CommentState {
        &self.comments
    }

    /// Apply a transaction. Nothing changes when it fails.
    pub fn apply(&mut self, transaction: Transaction) -> Result<Transform> {
        let tr = self.apply_transaction(transaction)?;
        if !tr.mapping().is_empty() {
            self.history.push_back(tr.mapping().clone());
            if self.history.len() > MAX_REVISION_HISTORY {
                self.history.pop_front();
            }
            self.revision += 1;
        }
        Ok(tr)
    }

    /// The changes from `revision` to the current document, if still known.
    fn mapping_since(&self, revision: u64) -> Option<Mapping> {
        let oldest = self.revision - self.history.len() as u64;
        if revision < oldest || revision > self.revision {
            return None;
        }
        let mut mapping = Mapping::new();
        for changes in self.history.iter().skip((revision - oldest) as usize) {
            mapping.append_mapping(changes);
        }
        Some(mapping)
    }

    /// Rewrite a local transaction made against `revision` so that it applies
    /// to the current document.
    ///
    /// Steps whose range was deleted in the meantime are left out. A comment
    /// whose range collapsed is an error. Edits older than the retained
    /// history are passed through unchanged.
    pub fn rebase_local(&self, revision: u64, transaction: Transaction) -> Result<Transaction> {
        if revision == self.revision {
            return Ok(transaction);
        }
        let Some(since) = self.mapping_since(revision) else {
            debug!(revision, current = self.revision, "edit predates kept history");
            return Ok(transaction);
        };
        match transaction {
            Transaction::Local(steps) => Ok(Transaction::Local(map_steps(&steps, &since))),
            Transaction::NewComment { from, to, text } => {
                let mapped_from = since.map(from, Assoc::After);
                let mapped_to = since.map(to, Assoc::Before);
                if mapped_from >= mapped_to {
                    return Err(ClientError::InvalidComment { from, to });
                }
                Ok(Transaction::NewComment {
                    from: mapped_from,
                    to: mapped_to,
                    text,
                })
            }
            other => Ok(other),
        }
    }

    fn apply_transaction(&mut self, transaction: Transaction) -> Result<Transform> {
        match transaction {
            Transaction::Local(steps) => {
                let tr = self.collab.apply_local(steps)?;
                self.comments.map_through(tr.mapping());
                Ok(tr)
            }
            Transaction::NewComment { from, to, text } => {
                if from >= to || to > self.doc().content_size() {
                    return Err(ClientError::InvalidComment { from, to });
                }
                self.comments.create(Comment::with_random_id(from, to, text));
                Ok(Transform::new(self.doc().clone()))
            }
            Transaction::DeleteComment(id) => {
                if !self.comments.delete(id) {
                    debug!(comment = id, "deleting unknown comment");
                }
                Ok(Transform::new(self.doc().clone()))
            }
            Transaction::Receive {
                steps,
                client_ids,
                comment_version,
                comment_events,
            } => {
                let received = self.collab.receive(&steps, &client_ids)?;
                self.comments.map_through(received.transform.mapping());
                self.comments
                    .receive(comment_version, comment_events, received.remote_to_local());
                Ok(received.transform)
            }
            Transaction::Confirm {
                steps,
                comment_version,
                comment_actions,
                comment_events,
            } => {
                let own = vec![self.collab.client_id(); steps.len()];
                let received = self.collab.receive(&steps, &own)?;
                self.comments
                    .confirm_sent(comment_version, comment_actions, comment_events);
                Ok(received.transform)
            }
        }
    }

    /// The next submission, if there is anything to send.
    pub fn sendable(&self) -> Option<Outgoing> {
        let comment = self.comments.unsent_events();
        let submit = match self.collab.sendable_steps() {
            Some(sendable) => sendable.into_submit(comment),
            None if self.comments.has_unsent() => SubmitEvents {
                version: self.collab.version(),
                steps: Vec::new(),
                client_id: self.collab.client_id(),
                comment,
            },
            None => return None,
        };
        Some(Outgoing {
            submit,
            comment_actions: self.comments.unsent().len(),
        })
    }

    /// Carry unconfirmed work from a state that lost its server connection
    /// over onto this freshly loaded one, as far as it still applies.
    ///
    /// Revisions continue from the old state. The reload itself cannot be
    /// mapped, so edits made before it are applied as they are.
    pub fn replay_from(&mut self, old: &EditState) {
        self.revision = old.revision + 1;
        self.history.clear();
        let mut dropped = 0;
        for rebaseable in old.collab.unconfirmed() {
            if self
                .apply(Transaction::Local(vec![rebaseable.step.clone()]))
                .is_err()
            {
                dropped += 1;
            }
        }
        for action in old.comments.unsent() {
            match *action {
                UnsentAction::New(id) => {
                    let Some(comment) = old.comments.get(id) else {
                        continue;
                    };
                    if comment.to <= self.doc().content_size() {
                        self.comments.create(comment.clone());
                    } else {
                        dropped += 1;
                    }
                }
                UnsentAction::Delete(id) => {
                    self.comments.delete(id);
                }
            }
        }
        if dropped > 0 {
            warn!(dropped, "some unsent changes no longer apply after reload");
        }
    }
}

/// Map `steps`, each made on the document the previous ones produced, over
/// `since`. Steps whose whole range was deleted are left out.
fn map_steps(steps: &[Step], since: &Mapping) -> Vec<Step> {
    let undo = steps.iter().rev().map(|step| step.get_map().invert()).collect();
    let mut mapping = Mapping::from_maps(undo);
    mapping.append_mapping(since);

    let mut mapped_steps = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        let undo = steps.len() - 1 - i;
        let Some(mapped) = step.map(&mapping.slice_from(undo + 1)) else {
            debug!(?step, "local step deleted by remote changes");
            continue;
        };
        mapping.append_map(mapped.get_map(), Some(undo));
        mapped_steps.push(mapped);
    }
    mapped_steps
}

/// What the connection is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comm {
    Start,
    Poll,
    Send,
    Recover,
    Detached,
    Failed,
}

/// Inputs that change the connection state.
#[derive(Clone, Debug)]
pub enum Action {
    Loaded(DocSnapshot),
    Restart,
    Poll,
    Recover(RequestError),
    Edit {
        transaction: Transaction,
        request_done: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// Work for the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Start,
    Poll { version: u64, comment_version: u64 },
    Send(SubmitEvents),
    /// Wait, then report [`Response::BackoffElapsed`].
    Backoff(Duration),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
}

/// Outcome of a [`Request`].
#[derive(Clone, Debug)]
pub enum Response {
    Doc(DocSnapshot),
    Events(EventsResponse),
    Sent(Versions),
    BackoffElapsed,
    Failed(RequestError),
}

#[derive(Clone, Debug)]
enum Pending {
    Start,
    Poll,
    Send {
        steps: Vec<Step>,
        comment_actions: usize,
        comment_events: usize,
    },
    Backoff,
}

/// Connection between one editor and the collaboration server.
#[derive(Debug)]
pub struct EditorConnection {
    client_id: ClientId,
    config: ConnectionConfig,
    edit: Option<EditState>,
    comm: Comm,
    current: Option<(RequestId, Pending)>,
    next_id: u64,
    backoff: Duration,
    reporter: Reporter,
    users: usize,
}

impl EditorConnection {
    pub fn new(client_id: ClientId, config: ConnectionConfig) -> Self {
        let reporter = Reporter::new(Duration::from_millis(config.failure_sticky_ms));
        Self {
            client_id,
            config,
            edit: None,
            comm: Comm::Start,
            current: None,
            next_id: 0,
            backoff: Duration::ZERO,
            reporter,
            users: 0,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn comm(&self) -> Comm {
        self.comm
    }

    pub fn edit(&self) -> Option<&EditState> {
        self.edit.as_ref()
    }

    pub fn status(&self) -> &Status {
        self.reporter.status()
    }

    pub fn users(&self) -> usize {
        self.users
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Fetch the document from scratch.
    pub fn start(&mut self) -> Request {
        self.comm = Comm::Start;
        self.issue(RequestKind::Start, Pending::Start)
    }

    pub fn dispatch(&mut self, action: Action) -> Option<Request> {
        match action {
            Action::Loaded(snapshot) => {
                self.users = snapshot.users;
                let mut edit = EditState::from_snapshot(snapshot, self.client_id);
                if let Some(old) = self.edit.take() {
                    edit.replay_from(&old);
                }
                self.edit = Some(edit);
                self.send_or_poll()
            }
            Action::Restart => Some(self.start()),
            Action::Poll => self.poll(),
            Action::Recover(err) => self.recover(err),
            Action::Edit {
                transaction,
                request_done,
            } => self.apply_edit(transaction, request_done),
        }
    }

    /// Apply an edit the local user made against local revision `revision`.
    ///
    /// Remote changes received since then are mapped over first. Unlike
    /// [`Action::Edit`], a rejected edit is reported back.
    pub fn edit_at(&mut self, revision: u64, transaction: Transaction) -> Result<Option<Request>> {
        let edit = self.edit.as_ref().ok_or(ClientError::NotLoaded)?;
        let transaction = edit.rebase_local(revision, transaction)?;
        self.try_apply_edit(transaction, false)
    }

    /// Feed the outcome of a request. Outcomes of replaced requests are dropped.
    pub fn on_response(&mut self, id: RequestId, response: Response) -> Option<Request> {
        match &self.current {
            Some((current, _)) if *current == id => {}
            _ => {
                debug!(?id, "ignoring response to a replaced request");
                return None;
            }
        }
        let (_, pending) = self.current.take()?;

        match (pending, response) {
            (_, Response::Doc(snapshot)) => {
                self.reporter.success();
                self.backoff = Duration::ZERO;
                self.dispatch(Action::Loaded(snapshot))
            }
            (_, Response::Events(events)) => {
                self.reporter.success();
                self.backoff = Duration::ZERO;
                if let Some(users) = events.users {
                    self.users = users;
                }
                if events.is_empty() {
                    return self.send_or_poll();
                }
                self.dispatch(Action::Edit {
                    transaction: Transaction::Receive {
                        steps: events.steps,
                        client_ids: events.client_ids,
                        comment_version: events.comment_version,
                        comment_events: events.comment,
                    },
                    request_done: true,
                })
            }
            (
                Pending::Send {
                    steps,
                    comment_actions,
                    comment_events,
                },
                Response::Sent(versions),
            ) => {
                self.reporter.success();
                self.backoff = Duration::ZERO;
                self.dispatch(Action::Edit {
                    transaction: Transaction::Confirm {
                        steps,
                        comment_version: versions.comment_version,
                        comment_actions,
                        comment_events,
                    },
                    request_done: true,
                })
            }
            (Pending::Backoff, Response::BackoffElapsed) => {
                if self.comm == Comm::Recover {
                    self.send_or_poll()
                } else {
                    None
                }
            }
            (Pending::Start, Response::Failed(err)) => {
                self.reporter.failure(err.to_string());
                self.comm = Comm::Failed;
                None
            }
            (Pending::Poll, Response::Failed(err)) => {
                if err.is_gone() || err.is_bad_version() {
                    self.reporter.failure(err.to_string());
                    self.dispatch(Action::Restart)
                } else {
                    self.dispatch(Action::Recover(err))
                }
            }
            (Pending::Send { .. }, Response::Failed(err)) => {
                if err.is_conflict() {
                    self.backoff = Duration::ZERO;
                    self.dispatch(Action::Poll)
                } else if err.is_bad_version() {
                    self.reporter.failure(err.to_string());
                    self.dispatch(Action::Restart)
                } else {
                    self.dispatch(Action::Recover(err))
                }
            }
            (pending, response) => {
                warn!(?pending, ?response, "response does not match the request");
                None
            }
        }
    }

    fn recover(&mut self, err: RequestError) -> Option<Request> {
        if err.is_client_error() {
            self.reporter.failure(err.to_string());
            self.comm = Comm::Failed;
            self.current = None;
            return None;
        }

        let initial = Duration::from_millis(self.config.initial_backoff_ms);
        let max = Duration::from_millis(self.config.max_backoff_ms);
        let threshold = Duration::from_millis(self.config.delay_report_ms);
        let old = self.backoff;
        let new = if old.is_zero() {
            initial
        } else {
            (old * 2).min(max)
        };
        if new > threshold && old < threshold {
            self.reporter.delay(err.to_string());
        }
        debug!(backoff_ms = new.as_millis() as u64, error = %err, "retrying after backoff");
        self.backoff = new;
        self.comm = Comm::Recover;
        Some(self.issue(RequestKind::Backoff(new), Pending::Backoff))
    }

    fn apply_edit(&mut self, transaction: Transaction, request_done: bool) -> Option<Request> {
        match self.try_apply_edit(transaction, request_done) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "dropping local edit");
                None
            }
        }
    }

    /// Errors only for local edits; remote changes that fail trigger a reload.
    fn try_apply_edit(
        &mut self,
        transaction: Transaction,
        request_done: bool,
    ) -> Result<Option<Request>> {
        let remote = transaction.is_remote();
        let edit = self.edit.as_mut().ok_or(ClientError::NotLoaded)?;
        if let Err(err) = edit.apply(transaction) {
            if remote {
                warn!(error = %err, "server changes did not apply, reloading");
                return Ok(self.dispatch(Action::Restart));
            }
            return Err(err);
        }
        let too_big = edit.doc().content_size() > self.config.max_doc_size;
        let sendable = edit.sendable().is_some();

        if too_big {
            if self.comm != Comm::Detached {
                self.reporter.failure("Document too big. Detached.");
            }
            self.comm = Comm::Detached;
            self.current = None;
            return Ok(None);
        }
        Ok(match self.comm {
            Comm::Detached | Comm::Failed => None,
            _ if (self.comm == Comm::Poll || request_done) && sendable => self.send(),
            _ if request_done => self.poll(),
            _ => None,
        })
    }

    fn send_or_poll(&mut self) -> Option<Request> {
        let sendable = self.edit.as_ref().and_then(EditState::sendable).is_some();
        if sendable {
            self.send()
        } else {
            self.poll()
        }
    }

    fn poll(&mut self) -> Option<Request> {
        let edit = self.edit.as_ref()?;
        let kind = RequestKind::Poll {
            version: edit.collab.version(),
            comment_version: edit.comments.version(),
        };
        self.comm = Comm::Poll;
        Some(self.issue(kind, Pending::Poll))
    }

    fn send(&mut self) -> Option<Request> {
        let outgoing = self.edit.as_ref()?.sendable()?;
        let pending = Pending::Send {
            steps: outgoing.submit.steps.clone(),
            comment_actions: outgoing.comment_actions,
            comment_events: outgoing.submit.comment.len(),
        };
        self.comm = Comm::Send;
        Some(self.issue(RequestKind::Send(outgoing.submit), pending))
    }

    fn issue(&mut self, kind: RequestKind, pending: Pending) -> Request {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        self.current = Some((id, pending));
        Request { id, kind }
    }
}
