//! # tandem-client
//!
//! Client side of Tandem collaborative editing.
//!
//! An editor keeps its document at the last version the server confirmed,
//! with its own unconfirmed steps applied on top. Remote steps are received
//! by undoing the local ones, applying the remote ones and rebasing the
//! local steps over them.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tandem_client::{connect, ConnectionConfig, LocalTransport};
//! use tandem_server::{ClientId, MemoryStorage, Registry, ServerConfig};
//! use tandem_transform::{Doc, Step};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Arc::new(Registry::new(
//!     ServerConfig::default(),
//!     Arc::new(MemoryStorage::new()),
//! ));
//! registry.create("notes", Doc::new("Hello"), Vec::new());
//!
//! let transport = LocalTransport::new(registry.clone(), "notes", "me");
//! let (handle, driver) = connect(transport, ClientId::random(), ConnectionConfig::default());
//! driver.spawn();
//!
//! let loaded = handle.wait_for(|s| s.doc.is_some()).await.unwrap();
//! handle
//!     .edit(loaded.revision, vec![Step::insert(5, ", world")])
//!     .await
//!     .unwrap();
//! let status = handle.wait_for(|s| s.is_synced() && s.version == 1).await.unwrap();
//! assert_eq!(status.text(), Some("Hello, world"));
//! # }
//! ```
//!
//! - [`collab`] - Unconfirmed steps and rebasing
//! - [`comments`] - Comment state with unsent actions
//! - [`connection`] - The editor connection state machine
//! - [`driver`] - Async driver running a connection over a transport
//! - [`transport`] - HTTP and in-process transports
//! - [`report`] - User-visible connection status
//! - [`track`] - Commit log, blame map and commit reverts

pub mod collab;
pub mod comments;
pub mod connection;
pub mod driver;
pub mod error;
pub mod report;
pub mod track;
pub mod transport;

pub use collab::{CollabState, Rebaseable, Received, Sendable};
pub use comments::{CommentState, UnsentAction};
pub use connection::{
    Action, Comm, ConnectionConfig, ConnectionConfigBuilder, EditState, EditorConnection,
    Outgoing, Request, RequestId, RequestKind, Response, Transaction,
};
pub use driver::{connect, Command, ConnectionHandle, ConnectionStatus, Driver};
pub use error::{ClientError, RequestError, Result};
pub use report::{Reporter, Status};
pub use track::{Commit, Span, TrackState};
pub use transport::{CollabTransport, HttpTransport, LocalTransport};
