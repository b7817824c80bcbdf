//! # tandem-server
//!
//! Authoritative server for collaborative editing over a step log.
//!
//! Every document lives in an [`Instance`] holding the current text, a
//! version number and the recently applied steps. Clients append steps only
//! when they are caught up with the current version; everyone else long-polls
//! for the steps they are missing. Comments are kept alongside and mapped
//! through every change.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem_server::{ClientId, MemoryStorage, Registry, ServerConfig, SubmitEvents};
//! use tandem_transform::Step;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Arc::new(Registry::new(
//!     ServerConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//! ));
//!
//! let submit = SubmitEvents {
//!     version: 0,
//!     steps: vec![Step::insert(0, "Hello. ")],
//!     client_id: ClientId(1),
//!     comment: Vec::new(),
//! };
//! let versions = registry.add_events("notes", "127.0.0.1", submit).unwrap();
//! assert_eq!(versions.map(|v| v.version), Some(1));
//! # }
//! ```
//!
//! - [`instance`] - Per-document state, waiters and user presence
//! - [`comments`] - Comment store with its event log
//! - [`registry`] - Instance lifecycle, long polls and debounced saving
//! - [`storage`] - Durable storage backends
//! - [`http`] - axum endpoints
//! - [`protocol`] - Wire types

pub mod comments;
pub mod config;
pub mod error;
pub mod http;
pub mod instance;
pub mod protocol;
pub mod registry;
pub mod seed;
pub mod storage;

pub use comments::{Comment, Comments};
pub use config::{ServerConfig, ServerConfigBuilder};
pub use error::{InstanceError, Result, ServerError, StorageError};
pub use http::{router, serve, ApiError, ClientKey};
pub use instance::{Events, Instance, InstanceHandle, PollStart, StoredStep, Waiter};
pub use protocol::{
    ClientId, CommentEvent, DocSnapshot, EventsResponse, InstanceInfo, PersistedInstance,
    PersistedState, SubmitEvents, Versions,
};
pub use registry::{PollResult, Registry};
pub use storage::{JsonFileStorage, MemoryStorage, Storage};
