//! Authoritative state of one collaboratively edited document.
//!
//! An [`Instance`] owns the document, the retained step history, the comment
//! store, the set of active users and the long-poll waiters. All mutation
//! happens through `&mut self`, so wrapping it in a lock (see
//! [`InstanceHandle`]) makes every operation atomic with respect to other
//! requests.
//!
//! Versioning is optimistic: a client may only append steps when the version
//! it last saw is the current one. Anything else is a conflict and the client
//! has to catch up first.

use crate::comments::{Comment, Comments};
use crate::error::{InstanceError, Result};
use crate::protocol::{
    ClientId, CommentEvent, DocSnapshot, EventsResponse, PersistedInstance, Versions,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tandem_transform::{Doc, Step, Transform};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

/// Default number of retained steps.
pub const MAX_STEP_HISTORY: usize = 10_000;

/// A step in the history together with the client that submitted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredStep {
    pub step: Step,
    pub client_id: ClientId,
}

/// Everything a client at some version is missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Events {
    pub version: u64,
    pub comment_version: u64,
    pub steps: Vec<StoredStep>,
    pub comment: Vec<CommentEvent>,
    pub users: usize,
}

impl Events {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.comment.is_empty()
    }
}

impl From<Events> for EventsResponse {
    fn from(events: Events) -> Self {
        let (steps, client_ids) = events
            .steps
            .into_iter()
            .map(|stored| (stored.step, stored.client_id))
            .unzip();
        EventsResponse {
            version: events.version,
            comment_version: events.comment_version,
            steps,
            client_ids,
            comment: events.comment,
            users: Some(events.users),
        }
    }
}

struct Waiting {
    ip: String,
    notify: oneshot::Sender<()>,
}

/// Server-side state of a single document.
pub struct Instance {
    id: String,
    doc: Doc,
    comments: Comments,
    version: u64,
    steps: VecDeque<StoredStep>,
    max_step_history: usize,
    users: HashSet<String>,
    collecting: bool,
    collector: Option<AbortHandle>,
    waiting: HashMap<u64, Waiting>,
    next_waiter: u64,
    last_active: Instant,
}

impl Instance {
    pub fn new(id: impl Into<String>, doc: Doc, comments: Vec<Comment>) -> Self {
        Self {
            id: id.into(),
            doc,
            comments: Comments::from_comments(comments),
            version: 0,
            steps: VecDeque::new(),
            max_step_history: MAX_STEP_HISTORY,
            users: HashSet::new(),
            collecting: false,
            collector: None,
            waiting: HashMap::new(),
            next_waiter: 0,
            last_active: Instant::now(),
        }
    }

    pub fn with_max_step_history(mut self, max: usize) -> Self {
        self.max_step_history = max;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn comments(&self) -> &Comments {
        &self.comments
    }

    /// Number of retained steps.
    pub fn history_len(&self) -> usize {
        self.steps.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    fn check_version(&self, version: u64) -> Result<()> {
        if version > self.version {
            return Err(InstanceError::InvalidVersion(version));
        }
        Ok(())
    }

    /// Append a batch of steps and comment events.
    ///
    /// Returns `Ok(None)` when `version` is not the current version. A batch
    /// containing a step that does not apply, or a comment whose range is
    /// empty or outside the resulting document, is rejected as a whole.
    pub fn add_events(
        &mut self,
        version: u64,
        steps: Vec<Step>,
        comment: Vec<CommentEvent>,
        client_id: ClientId,
    ) -> Result<Option<Versions>> {
        self.check_version(version)?;
        if version != self.version {
            debug!(instance = %self.id, version, current = self.version, "version conflict");
            return Ok(None);
        }

        let mut tr = Transform::new(self.doc.clone());
        for step in &steps {
            tr.step(step.clone())?;
        }
        let size = tr.doc().content_size();
        for event in &comment {
            if let CommentEvent::Create { from, to, .. } = *event {
                if from >= to || to > size {
                    return Err(InstanceError::InvalidComment { from, to });
                }
            }
        }

        self.doc = tr.doc().clone();
        self.version += steps.len() as u64;
        self.steps
            .extend(steps.into_iter().map(|step| StoredStep { step, client_id }));
        while self.steps.len() > self.max_step_history {
            self.steps.pop_front();
        }

        self.comments.map_through(tr.mapping());
        for event in comment {
            match event {
                CommentEvent::Create { id, from, to, text } => {
                    self.comments.created(Comment::new(from, to, text, id))
                }
                CommentEvent::Delete { id } => self.comments.deleted(id),
            }
        }

        self.send_updates();
        Ok(Some(Versions {
            version: self.version,
            comment_version: self.comments.version(),
        }))
    }

    /// The steps and comment events after the given versions.
    ///
    /// Returns `Ok(None)` when the steps after `version` are no longer retained.
    pub fn get_events(&self, version: u64, comment_version: u64) -> Result<Option<Events>> {
        self.check_version(version)?;
        let behind = (self.version - version) as usize;
        if behind > self.steps.len() {
            return Ok(None);
        }
        let start = self.steps.len() - behind;
        let comment_start = self.comments.event_start(comment_version)?;

        Ok(Some(Events {
            version: self.version,
            comment_version: self.comments.version(),
            steps: self.steps.iter().skip(start).cloned().collect(),
            comment: self.comments.events_after(comment_start),
            users: self.user_count(),
        }))
    }

    /// Full state for a client that is (re)starting.
    pub fn snapshot(&self) -> DocSnapshot {
        DocSnapshot {
            doc: self.doc.clone(),
            users: self.user_count(),
            version: self.version,
            comments: self.comments.comments().to_vec(),
            comment_version: self.comments.version(),
        }
    }

    pub fn persisted(&self) -> PersistedInstance {
        PersistedInstance {
            doc: self.doc.clone(),
            comments: self.comments.comments().to_vec(),
        }
    }

    /// Record an access from `ip`.
    ///
    /// Returns `true` when the caller must schedule a user collection.
    pub fn register_user(&mut self, ip: &str) -> bool {
        if self.users.contains(ip) {
            return false;
        }
        let schedule = self.insert_user(ip);
        self.send_updates();
        schedule
    }

    fn insert_user(&mut self, ip: &str) -> bool {
        if !self.users.insert(ip.to_string()) || self.collecting {
            return false;
        }
        self.collecting = true;
        true
    }

    /// Recount users from the requests that are currently waiting.
    ///
    /// Returns `true` when another collection must be scheduled.
    pub fn collect_users(&mut self) -> bool {
        let old_count = self.users.len();
        self.users.clear();
        self.collecting = false;
        self.collector = None;

        let ips: Vec<String> = self.waiting.values().map(|w| w.ip.clone()).collect();
        let mut schedule = false;
        for ip in ips {
            schedule |= self.insert_user(&ip);
        }
        if self.users.len() != old_count {
            trace!(instance = %self.id, users = self.users.len(), "user count changed");
            self.send_updates();
        }
        schedule
    }

    fn attach_collector(&mut self, handle: AbortHandle) {
        self.collector = Some(handle);
    }

    fn add_waiter(&mut self, ip: &str) -> (u64, oneshot::Receiver<()>) {
        let (notify, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.waiting.insert(
            id,
            Waiting {
                ip: ip.to_string(),
                notify,
            },
        );
        (id, rx)
    }

    fn remove_waiter(&mut self, id: u64) {
        self.waiting.remove(&id);
    }

    /// Wake every waiting request so it re-queries its events.
    fn send_updates(&mut self) {
        for (_, waiting) in self.waiting.drain() {
            let _ = waiting.notify.send(());
        }
    }

    /// Shut the instance down: cancel the collection timer and release all
    /// waiters, which then answer with a keepalive.
    pub fn stop(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
        self.collecting = false;
        self.waiting.clear();
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(collector) = self.collector.take() {
            collector.abort();
        }
    }
}

/// Outcome of starting a poll.
pub enum PollStart {
    /// There is something to send right away.
    Ready(Events),
    /// The requested history is no longer retained.
    Gone,
    /// Nothing new yet; await the waiter.
    Wait(Waiter),
}

/// Shared, lockable handle to an instance.
///
/// The handle also owns the timers that act on the instance, which is why
/// user registration goes through it.
#[derive(Clone)]
pub struct InstanceHandle {
    inner: Arc<Mutex<Instance>>,
    collect_interval: Duration,
}

impl InstanceHandle {
    pub fn new(instance: Instance, collect_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(instance)),
            collect_interval,
        }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Instance> {
        self.inner.lock()
    }

    /// Register an access and arm the collection timer if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn register_user(&self, ip: &str) {
        let mut instance = self.inner.lock();
        instance.touch();
        if instance.register_user(ip) {
            self.schedule_collect(&mut instance);
        }
    }

    fn schedule_collect(&self, instance: &mut Instance) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.collect_interval;
        let task = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = weak.upgrade() {
                let handle = InstanceHandle {
                    inner,
                    collect_interval: interval,
                };
                let mut instance = handle.inner.lock();
                if instance.collect_users() {
                    handle.schedule_collect(&mut instance);
                }
            }
        });
        instance.attach_collector(task.abort_handle());
    }

    pub fn get_events(&self, version: u64, comment_version: u64) -> Result<Option<Events>> {
        self.inner.lock().get_events(version, comment_version)
    }

    /// Fetch events, or register a waiter when there are none.
    ///
    /// Both happen under one lock, so no update can slip in between.
    pub fn events_or_wait(&self, version: u64, comment_version: u64, ip: &str) -> Result<PollStart> {
        let mut instance = self.inner.lock();
        match instance.get_events(version, comment_version)? {
            None => Ok(PollStart::Gone),
            Some(events) if !events.is_empty() => Ok(PollStart::Ready(events)),
            Some(_) => {
                let (id, rx) = instance.add_waiter(ip);
                Ok(PollStart::Wait(Waiter {
                    id,
                    rx,
                    instance: Arc::downgrade(&self.inner),
                }))
            }
        }
    }
}

/// A registered long-poll request.
///
/// Dropping the waiter removes its registration, which covers timeouts and
/// disconnected clients alike.
pub struct Waiter {
    id: u64,
    rx: oneshot::Receiver<()>,
    instance: Weak<Mutex<Instance>>,
}

impl Waiter {
    /// Resolves with `true` when the instance changed, `false` when it stopped.
    pub async fn wait(&mut self) -> bool {
        (&mut self.rx).await.is_ok()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.upgrade() {
            instance.lock().remove_waiter(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn instance(text: &str) -> Instance {
        Instance::new("test", Doc::new(text), Vec::new())
    }

    #[test]
    fn test_add_events_advances_version() {
        let mut inst = instance("");
        let versions = inst
            .add_events(0, vec![Step::insert(0, "hi"), Step::insert(2, "!")], vec![], A)
            .unwrap()
            .unwrap();

        assert_eq!(versions.version, 2);
        assert_eq!(inst.doc().text(), "hi!");

        let events = inst.get_events(0, 0).unwrap().unwrap();
        assert_eq!(events.steps.len(), 2);
        assert_eq!(events.steps[0].client_id, A);
        assert_eq!(events.version, 2);
    }

    #[test]
    fn test_conflict_does_not_mutate() {
        let mut inst = instance("abc");
        inst.add_events(0, vec![Step::insert(0, "x")], vec![], A)
            .unwrap()
            .unwrap();

        let result = inst
            .add_events(0, vec![Step::insert(0, "y")], vec![], B)
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(inst.version(), 1);
        assert_eq!(inst.doc().text(), "xabc");
        assert_eq!(inst.history_len(), 1);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut inst = instance("abc");
        assert_eq!(
            inst.add_events(3, vec![], vec![], A).unwrap_err(),
            InstanceError::InvalidVersion(3)
        );
        assert!(inst.get_events(1, 0).is_err());
        assert!(inst.get_events(0, 1).is_err());
    }

    #[test]
    fn test_failing_step_rejects_batch() {
        let mut inst = instance("abc");
        let err = inst
            .add_events(0, vec![Step::insert(0, "x"), Step::delete(2, 10)], vec![], A)
            .unwrap_err();
        assert!(matches!(err, InstanceError::Step(_)));
        assert_eq!(inst.version(), 0);
        assert_eq!(inst.doc().text(), "abc");
    }

    #[test]
    fn test_invalid_comment_rejects_batch() {
        let mut inst = instance("abc");
        let create = |from, to| CommentEvent::Create {
            id: 1,
            from,
            to,
            text: "c".into(),
        };

        let err = inst
            .add_events(0, vec![Step::insert(0, "x")], vec![create(2, 2)], A)
            .unwrap_err();
        assert_eq!(err, InstanceError::InvalidComment { from: 2, to: 2 });
        let err = inst.add_events(0, vec![], vec![create(3, 1)], A).unwrap_err();
        assert_eq!(err, InstanceError::InvalidComment { from: 3, to: 1 });
        let err = inst.add_events(0, vec![], vec![create(1, 4)], A).unwrap_err();
        assert_eq!(err, InstanceError::InvalidComment { from: 1, to: 4 });

        assert_eq!(inst.version(), 0);
        assert_eq!(inst.doc().text(), "abc");
        assert!(inst.comments().is_empty());

        // Ranges are checked against the document after the batch's steps.
        inst.add_events(0, vec![Step::insert(0, "x")], vec![create(1, 4)], A)
            .unwrap()
            .unwrap();
        assert_eq!(inst.comments().comments()[0].to, 4);
    }

    #[test]
    fn test_history_truncation() {
        let mut inst = instance("").with_max_step_history(3);
        for v in 0..5 {
            inst.add_events(v, vec![Step::insert(0, "a")], vec![], A)
                .unwrap()
                .unwrap();
        }
        assert_eq!(inst.history_len(), 3);
        assert_eq!(inst.get_events(0, 0).unwrap(), None);
        assert_eq!(inst.get_events(1, 0).unwrap(), None);

        let events = inst.get_events(2, 0).unwrap().unwrap();
        assert_eq!(events.steps.len(), 3);
        assert!(inst.get_events(5, 0).unwrap().unwrap().is_empty());
    }

    #[test]
    fn test_comments_remapped_before_new_events() {
        let mut inst = instance("hello world");
        inst.add_events(
            0,
            vec![],
            vec![CommentEvent::Create {
                id: 9,
                from: 6,
                to: 11,
                text: "planet?".into(),
            }],
            A,
        )
        .unwrap()
        .unwrap();

        // The new comment's range is already in post-step coordinates.
        let versions = inst
            .add_events(
                0,
                vec![Step::insert(0, ">> ")],
                vec![CommentEvent::Create {
                    id: 10,
                    from: 0,
                    to: 2,
                    text: "quote".into(),
                }],
                B,
            )
            .unwrap()
            .unwrap();
        assert_eq!(versions.comment_version, 2);

        let snapshot = inst.snapshot();
        assert_eq!(snapshot.comments[0].from, 9);
        assert_eq!(snapshot.comments[0].to, 14);
        assert_eq!(snapshot.comments[1].from, 0);
        assert_eq!(snapshot.comments[1].to, 2);
    }

    #[test]
    fn test_comment_events_after_version() {
        let mut inst = instance("abcdef");
        inst.add_events(
            0,
            vec![],
            vec![CommentEvent::Create {
                id: 1,
                from: 1,
                to: 3,
                text: "c".into(),
            }],
            A,
        )
        .unwrap();
        inst.add_events(0, vec![], vec![CommentEvent::Delete { id: 1 }], A)
            .unwrap();

        let events = inst.get_events(0, 1).unwrap().unwrap();
        assert_eq!(events.comment, vec![CommentEvent::Delete { id: 1 }]);
        assert_eq!(events.comment_version, 2);
    }

    #[test]
    fn test_user_registration_and_collection() {
        let mut inst = instance("");
        assert!(inst.register_user("10.0.0.1"));
        assert!(!inst.register_user("10.0.0.2"));
        assert!(!inst.register_user("10.0.0.1"));
        assert_eq!(inst.user_count(), 2);

        // Nobody is waiting, so everyone is forgotten.
        assert!(!inst.collect_users());
        assert_eq!(inst.user_count(), 0);
    }

    #[test]
    fn test_collection_keeps_waiting_users() {
        let mut inst = instance("");
        inst.register_user("10.0.0.1");
        inst.register_user("10.0.0.2");
        let (_id, _rx) = inst.add_waiter("10.0.0.2");

        assert!(inst.collect_users());
        assert_eq!(inst.user_count(), 1);
    }

    #[test]
    fn test_events_response_conversion() {
        let mut inst = instance("");
        inst.add_events(0, vec![Step::insert(0, "x")], vec![], B)
            .unwrap();
        let response = EventsResponse::from(inst.get_events(0, 0).unwrap().unwrap());
        assert_eq!(response.steps, vec![Step::insert(0, "x")]);
        assert_eq!(response.client_ids, vec![B]);
        assert_eq!(response.users, Some(0));
    }

    #[tokio::test]
    async fn test_waiter_woken_by_add_events() {
        let handle = InstanceHandle::new(instance(""), Duration::from_secs(5));
        let PollStart::Wait(mut waiter) = handle.events_or_wait(0, 0, "ip").unwrap() else {
            panic!("expected to wait");
        };
        assert_eq!(handle.lock().waiting_count(), 1);

        handle
            .lock()
            .add_events(0, vec![Step::insert(0, "a")], vec![], A)
            .unwrap();
        assert!(waiter.wait().await);
        assert_eq!(handle.lock().waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_removed() {
        let handle = InstanceHandle::new(instance(""), Duration::from_secs(5));
        let start = handle.events_or_wait(0, 0, "ip").unwrap();
        assert_eq!(handle.lock().waiting_count(), 1);
        drop(start);
        assert_eq!(handle.lock().waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_releases_waiters() {
        let handle = InstanceHandle::new(instance(""), Duration::from_secs(5));
        let PollStart::Wait(mut waiter) = handle.events_or_wait(0, 0, "ip").unwrap() else {
            panic!("expected to wait");
        };
        handle.lock().stop();
        assert!(!waiter.wait().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_collected_after_interval() {
        let handle = InstanceHandle::new(instance(""), Duration::from_secs(5));
        handle.register_user("10.0.0.1");
        handle.register_user("10.0.0.2");
        assert_eq!(handle.lock().user_count(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(handle.lock().user_count(), 0);
    }

    #[tokio::test]
    async fn test_ready_events_skip_waiting() {
        let handle = InstanceHandle::new(instance(""), Duration::from_secs(5));
        handle
            .lock()
            .add_events(0, vec![Step::insert(0, "a")], vec![], A)
            .unwrap();
        assert!(matches!(
            handle.events_or_wait(0, 0, "ip").unwrap(),
            PollStart::Ready(_)
        ));
        assert!(matches!(
            handle.events_or_wait(1, 0, "ip").unwrap(),
            PollStart::Wait(_)
        ));
    }
}
