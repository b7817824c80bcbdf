//! Wire types for the JSON/HTTP collaboration protocol.
//!
//! | Method | Path | Body | Response |
//! |---|---|---|---|
//! | GET | `/docs` | - | `[InstanceInfo]` |
//! | GET | `/docs/{id}` | - | [`DocSnapshot`] |
//! | GET | `/docs/{id}/events?version=V&commentVersion=C` | - | [`EventsResponse`] or `{}` |
//! | POST | `/docs/{id}/events` | [`SubmitEvents`] | [`Versions`] |

use crate::comments::Comment;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_transform::{Doc, Step};

/// Identifies the client that submitted a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u32);

impl ClientId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A comment log event as exchanged with clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CommentEvent {
    Create {
        id: u32,
        from: usize,
        to: usize,
        text: String,
    },
    Delete {
        id: u32,
    },
}

impl CommentEvent {
    pub fn id(&self) -> u32 {
        match self {
            CommentEvent::Create { id, .. } | CommentEvent::Delete { id } => *id,
        }
    }
}

/// Entry of the instance listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub users: usize,
}

/// Full state of a document instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSnapshot {
    pub doc: Doc,
    pub users: usize,
    pub version: u64,
    pub comments: Vec<Comment>,
    pub comment_version: u64,
}

/// Events since a client's version.
///
/// A long poll that times out answers with `{}`, so every field defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsResponse {
    pub version: u64,
    pub comment_version: u64,
    pub steps: Vec<Step>,
    #[serde(rename = "clientIDs")]
    pub client_ids: Vec<ClientId>,
    pub comment: Vec<CommentEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<usize>,
}

impl EventsResponse {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.comment.is_empty()
    }
}

/// Body of an event submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitEvents {
    pub version: u64,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(rename = "clientID")]
    pub client_id: ClientId,
    #[serde(default)]
    pub comment: Vec<CommentEvent>,
}

/// Versions after a successful submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Versions {
    pub version: u64,
    pub comment_version: u64,
}

/// Durable form of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedInstance {
    pub doc: Doc,
    pub comments: Vec<Comment>,
}

/// Durable form of the whole registry, keyed by instance id.
pub type PersistedState = BTreeMap<String, PersistedInstance>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_keepalive_parses() {
        let events: EventsResponse = serde_json::from_str("{}").unwrap();
        assert!(events.is_empty());
        assert_eq!(events.users, None);
    }

    #[test]
    fn test_events_wire_names() {
        let events = EventsResponse {
            version: 3,
            comment_version: 1,
            steps: vec![Step::insert(0, "hi")],
            client_ids: vec![ClientId(7)],
            comment: vec![CommentEvent::Delete { id: 4 }],
            users: Some(2),
        };
        let json = serde_json::to_value(&events).unwrap();
        assert_eq!(json["commentVersion"], 1);
        assert_eq!(json["clientIDs"][0], 7);
        assert_eq!(json["comment"][0]["type"], "delete");
        assert_eq!(json["users"], 2);
    }

    #[test]
    fn test_submit_parses_without_comments() {
        let body = r#"{"version":2,"steps":[{"from":0,"to":0,"text":"a"}],"clientID":99}"#;
        let submit: SubmitEvents = serde_json::from_str(body).unwrap();
        assert_eq!(submit.version, 2);
        assert_eq!(submit.client_id, ClientId(99));
        assert!(submit.comment.is_empty());
    }

    #[test]
    fn test_comment_event_tagging() {
        let event: CommentEvent =
            serde_json::from_str(r#"{"type":"create","id":1,"from":2,"to":5,"text":"note"}"#)
                .unwrap();
        assert_eq!(
            event,
            CommentEvent::Create {
                id: 1,
                from: 2,
                to: 5,
                text: "note".into()
            }
        );
        assert_eq!(event.id(), 1);
    }
}
