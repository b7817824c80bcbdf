//! Runs an [`EditorConnection`] against a transport.
//!
//! The [`Driver`] owns the connection and performs the requests it issues,
//! one at a time. Editors talk to it through a [`ConnectionHandle`]: edits go
//! in over a channel and the resulting state comes back on a watch channel.
//!
//! Edits carry the local revision of the [`ConnectionStatus`] they were made
//! against, so changes that arrive in between are mapped over. An edit
//! resolves once the driver has applied it and published the new status.

use crate::connection::{
    Action, Comm, ConnectionConfig, EditorConnection, Request, RequestId, RequestKind, Response,
    Transaction,
};
use crate::error::{ClientError, Result};
use crate::report::Status;
use crate::transport::CollabTransport;
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use std::sync::Arc;
use tandem_server::{ClientId, Comment};
use tandem_transform::{Doc, Step};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Commands sent from the editor to the driver.
#[derive(Debug)]
pub enum Command {
    /// A local edit made against local revision `revision`. Whether it was
    /// applied goes back on `done`.
    Edit {
        revision: u64,
        transaction: Transaction,
        done: oneshot::Sender<Result<()>>,
    },
    Restart,
}

/// Published view of the connection.
#[derive(Clone, Debug)]
pub struct ConnectionStatus {
    pub comm: Comm,
    pub report: Status,
    /// `None` until the document has been loaded.
    pub doc: Option<Doc>,
    /// Local revision of `doc`, for stamping edits made against it.
    pub revision: u64,
    pub version: u64,
    pub comment_version: u64,
    pub comments: Vec<Comment>,
    /// Local steps not yet confirmed by the server.
    pub unconfirmed: usize,
    /// Comment actions not yet confirmed by the server.
    pub unsent_comments: usize,
    pub users: usize,
}

impl ConnectionStatus {
    fn of(connection: &EditorConnection) -> Self {
        let edit = connection.edit();
        Self {
            comm: connection.comm(),
            report: connection.status().clone(),
            doc: edit.map(|e| e.doc().clone()),
            revision: edit.map_or(0, |e| e.revision()),
            version: edit.map_or(0, |e| e.collab().version()),
            comment_version: edit.map_or(0, |e| e.comments().version()),
            comments: edit.map_or_else(Vec::new, |e| e.comments().comments().to_vec()),
            unconfirmed: edit.map_or(0, |e| e.collab().unconfirmed().len()),
            unsent_comments: edit.map_or(0, |e| e.comments().unsent().len()),
            users: connection.users(),
        }
    }

    /// Everything local has been confirmed and the connection is polling.
    pub fn is_synced(&self) -> bool {
        self.comm == Comm::Poll && self.unconfirmed == 0 && self.unsent_comments == 0
    }

    pub fn text(&self) -> Option<&str> {
        self.doc.as_ref().map(Doc::text)
    }
}

/// Editor-side handle to a running [`Driver`].
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    async fn submit(&self, revision: u64, transaction: Transaction) -> Result<()> {
        let (done, applied) = oneshot::channel();
        self.send(Command::Edit {
            revision,
            transaction,
            done,
        })
        .await?;
        applied.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Apply steps the local user made on the document at `revision`
    /// (see [`ConnectionStatus::revision`]).
    pub async fn edit(&self, revision: u64, steps: Vec<Step>) -> Result<()> {
        self.submit(revision, Transaction::Local(steps)).await
    }

    /// Comment on `from..to` of the document at `revision`.
    pub async fn add_comment(
        &self,
        revision: u64,
        from: usize,
        to: usize,
        text: impl Into<String>,
    ) -> Result<()> {
        let text = text.into();
        self.submit(revision, Transaction::NewComment { from, to, text })
            .await
    }

    pub async fn delete_comment(&self, id: u32) -> Result<()> {
        let revision = self.status.borrow().revision;
        self.submit(revision, Transaction::DeleteComment(id)).await
    }

    /// Drop the server state and load the document again.
    pub async fn restart(&self) -> Result<()> {
        self.send(Command::Restart).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Wait until the published status satisfies `f`.
    pub async fn wait_for(
        &self,
        f: impl FnMut(&ConnectionStatus) -> bool,
    ) -> Result<ConnectionStatus> {
        let mut status = self.status.clone();
        let found = status
            .wait_for(f)
            .await
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(ConnectionStatus::clone(&found))
    }
}

type InFlight = BoxFuture<'static, (RequestId, Response)>;

/// Performs the requests of one editor connection.
pub struct Driver<T: CollabTransport> {
    transport: Arc<T>,
    connection: EditorConnection,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<ConnectionStatus>,
}

/// Create a connection to the document behind `transport`.
///
/// Nothing happens until the returned driver runs.
pub fn connect<T: CollabTransport>(
    transport: T,
    client_id: ClientId,
    config: ConnectionConfig,
) -> (ConnectionHandle, Driver<T>) {
    let connection = EditorConnection::new(client_id, config);
    let (command_tx, command_rx) = mpsc::channel(64);
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::of(&connection));
    let handle = ConnectionHandle {
        commands: command_tx,
        status: status_rx,
    };
    let driver = Driver {
        transport: Arc::new(transport),
        connection,
        commands: command_rx,
        status: status_tx,
    };
    (handle, driver)
}

impl<T: CollabTransport> Driver<T> {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every [`ConnectionHandle`] is dropped.
    pub async fn run(mut self) {
        info!(client = %self.connection.client_id(), "connecting");
        let start = self.connection.start();
        let mut in_flight: Option<InFlight> = Some(self.perform(start));
        self.publish();

        loop {
            let mut ack = None;
            tokio::select! {
                Some((id, response)) = OptionFuture::from(in_flight.as_mut()) => {
                    in_flight = None;
                    if let Some(request) = self.connection.on_response(id, response) {
                        in_flight = Some(self.perform(request));
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    let request = match command {
                        Command::Edit { revision, transaction, done } => {
                            match self.connection.edit_at(revision, transaction) {
                                Ok(request) => {
                                    ack = Some((done, Ok(())));
                                    request
                                }
                                Err(err) => {
                                    warn!(error = %err, "dropping local edit");
                                    ack = Some((done, Err(err)));
                                    None
                                }
                            }
                        }
                        Command::Restart => self.connection.dispatch(Action::Restart),
                    };
                    if let Some(request) = request {
                        // Replacing the future drops the request in flight.
                        in_flight = Some(self.perform(request));
                    }
                }
            }
            self.publish();
            if let Some((done, result)) = ack {
                // The editor may have stopped waiting.
                let _ = done.send(result);
            }
        }
        debug!(client = %self.connection.client_id(), "all handles dropped, stopping");
    }

    fn publish(&self) {
        self.status.send_replace(ConnectionStatus::of(&self.connection));
    }

    fn perform(&self, request: Request) -> InFlight {
        let transport = self.transport.clone();
        let Request { id, kind } = request;
        async move {
            let response = match kind {
                RequestKind::Start => match transport.fetch_doc().await {
                    Ok(snapshot) => Response::Doc(snapshot),
                    Err(err) => Response::Failed(err),
                },
                RequestKind::Poll {
                    version,
                    comment_version,
                } => match transport.poll_events(version, comment_version).await {
                    Ok(events) => Response::Events(events),
                    Err(err) => Response::Failed(err),
                },
                RequestKind::Send(submit) => match transport.send_events(&submit).await {
                    Ok(versions) => Response::Sent(versions),
                    Err(err) => Response::Failed(err),
                },
                RequestKind::Backoff(delay) => {
                    tokio::time::sleep(delay).await;
                    Response::BackoffElapsed
                }
            };
            (id, response)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use tandem_server::{MemoryStorage, Registry, ServerConfig};

    #[tokio::test]
    async fn test_edit_reaches_server() {
        let registry = Arc::new(Registry::new(
            ServerConfig::default(),
            Arc::new(MemoryStorage::new()),
        ));
        registry.create("notes", Doc::new("abc"), Vec::new());

        let transport = LocalTransport::new(registry.clone(), "notes", "editor");
        let (handle, driver) = connect(transport, ClientId(1), ConnectionConfig::default());
        driver.spawn();

        let loaded = handle.wait_for(|s| s.doc.is_some()).await.unwrap();
        handle
            .edit(loaded.revision, vec![Step::insert(3, "d")])
            .await
            .unwrap();
        // The edit is applied by the time it resolves.
        assert_eq!(handle.status().text(), Some("abcd"));

        let status = handle
            .wait_for(|s| s.is_synced() && s.version == 1)
            .await
            .unwrap();
        assert_eq!(status.text(), Some("abcd"));
        assert_eq!(registry.snapshot("notes", "editor").doc.text(), "abcd");
    }

    #[tokio::test]
    async fn test_rejected_edit_is_reported() {
        let registry = Arc::new(Registry::new(
            ServerConfig::default(),
            Arc::new(MemoryStorage::new()),
        ));
        registry.create("notes", Doc::new("abc"), Vec::new());
        let transport = LocalTransport::new(registry, "notes", "editor");
        let (handle, driver) = connect(transport, ClientId(1), ConnectionConfig::default());
        driver.spawn();

        let loaded = handle.wait_for(|s| s.doc.is_some()).await.unwrap();
        let err = handle
            .edit(loaded.revision, vec![Step::delete(1, 9)])
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Step(_)), "{err}");
        let err = handle
            .add_comment(loaded.revision, 2, 2, "empty")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidComment { .. }), "{err}");
        assert_eq!(handle.status().text(), Some("abc"));
    }

    #[tokio::test]
    async fn test_driver_stops_with_handles() {
        let registry = Arc::new(Registry::new(
            ServerConfig::default(),
            Arc::new(MemoryStorage::new()),
        ));
        let transport = LocalTransport::new(registry, "notes", "editor");
        let (handle, driver) = connect(transport, ClientId(1), ConnectionConfig::default());
        let task = driver.spawn();

        handle.wait_for(|s| s.comm == Comm::Poll).await.unwrap();
        drop(handle);
        task.await.unwrap();
    }
}
