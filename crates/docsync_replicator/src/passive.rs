//! The passive side of a replication connection.
//!
//! A passive session answers a replicator: it authenticates the `Hello`,
//! streams its database's changes on `SubChanges`, stores pushed revisions
//! and records the peer's checkpoint. Listeners run one per accepted
//! connection; local database endpoints run one over an in-process pipe.

use crate::error::ReplicationError;
use docsync_protocol::{
    parse_basic_authorization, Connection, ErrorCode, Hello, Message, ProtocolError, Rejection,
    Revs, RevsAck, SubChanges, Welcome, PROTOCOL_VERSION,
};
use docsync_store::{ApplyOutcome, ChangeEvent, Database, RevisionId};
use docsync_tls::Authenticator;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Policy applied by a passive session.
#[derive(Debug, Clone)]
pub struct PassiveOptions {
    /// Reject pushed revisions with `Forbidden`.
    pub read_only: bool,
    /// Listener-side authenticator. Only [`Authenticator::Password`] is
    /// checked here; certificates are checked during the TLS handshake.
    pub authenticator: Authenticator,
    /// Advertised delta sync support.
    pub delta_sync: bool,
    /// Maximum revisions per batch sent to the peer.
    pub batch_size: usize,
}

impl Default for PassiveOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            authenticator: Authenticator::None,
            delta_sync: false,
            batch_size: 100,
        }
    }
}

/// How a passive session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassiveExit {
    /// The peer closed the connection.
    Completed,
    /// The handshake was refused with this code.
    Rejected(ErrorCode),
    /// The session was told to shut down and said goodbye to the peer.
    ShutDown,
    /// The session failed.
    Failed(ReplicationError),
}

/// Resolves once `true` is sent on the channel. Never resolves if the
/// sender is dropped without sending.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// State of one passive connection.
struct PassiveSession<'a> {
    conn: Connection,
    db: Arc<Database>,
    options: &'a PassiveOptions,
    /// Changes subscription for continuous pulls.
    feed: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
    /// Highest local sequence already sent to the peer.
    sent_sequence: u64,
    /// Revisions the peer pushed to us, not to be echoed back.
    received: HashSet<(String, RevisionId)>,
}

/// Serves one replication connection against `db` until the peer leaves or
/// `shutdown` fires. `on_active` runs once the handshake is accepted.
pub async fn serve_passive<F>(
    conn: Connection,
    db: Arc<Database>,
    options: &PassiveOptions,
    mut shutdown: watch::Receiver<bool>,
    on_active: F,
) -> PassiveExit
where
    F: FnOnce(),
{
    let mut session = PassiveSession {
        conn,
        db,
        options,
        feed: None,
        sent_sequence: 0,
        received: HashSet::new(),
    };

    let hello = tokio::select! {
        biased;
        _ = shutdown_requested(&mut shutdown) => {
            return session.going_away().await;
        }
        msg = session.conn.recv() => match msg {
            Ok(Message::Hello(hello)) => hello,
            Ok(other) => {
                let _ = session
                    .conn
                    .send(&Message::error(ErrorCode::PROTOCOL, format!("expected Hello, got {}", other.kind())))
                    .await;
                return PassiveExit::Rejected(ErrorCode::PROTOCOL);
            }
            Err(ProtocolError::ConnectionClosed) => return PassiveExit::Completed,
            Err(e) => return PassiveExit::Failed(e.into()),
        },
    };

    if let Err((code, reason)) = session.check_hello(&hello) {
        tracing::info!(peer = %session.conn.peer(), %code, reason, "rejecting replication");
        let _ = session.conn.send(&Message::error(code, reason)).await;
        session.conn.shutdown().await;
        return PassiveExit::Rejected(code);
    }

    let welcome = match session.db.peer_checkpoint(&hello.checkpoint_id) {
        Ok(remote_checkpoint) => Welcome {
            database_uuid: session.db.uuid(),
            remote_checkpoint,
        },
        Err(e) => {
            let _ = session
                .conn
                .send(&Message::error(ErrorCode::INTERNAL, e.to_string()))
                .await;
            return PassiveExit::Failed(e.into());
        }
    };
    if let Err(e) = session.conn.send(&Message::Welcome(welcome)).await {
        return PassiveExit::Failed(e.into());
    }
    tracing::debug!(
        peer = %session.conn.peer(),
        checkpoint_id = %hello.checkpoint_id,
        headers = ?hello.headers,
        "replication session accepted"
    );
    on_active();

    match session.run(&mut shutdown).await {
        Ok(exit) => exit,
        Err(e) => {
            tracing::debug!(peer = %session.conn.peer(), error = %e, "passive session failed");
            PassiveExit::Failed(e)
        }
    }
}

impl PassiveSession<'_> {
    fn check_hello(&self, hello: &Hello) -> Result<(), (ErrorCode, &'static str)> {
        if hello.protocol_version != PROTOCOL_VERSION {
            return Err((ErrorCode::UPGRADE_REQUIRED, "unsupported protocol version"));
        }
        if hello.database != self.db.name() {
            return Err((ErrorCode::NOT_FOUND, "no such database"));
        }
        if let Authenticator::Password(check) = &self.options.authenticator {
            let accepted = hello
                .authorization
                .as_deref()
                .and_then(parse_basic_authorization)
                .is_some_and(|(user, pass)| check(&user, &pass));
            if !accepted {
                return Err((ErrorCode::UNAUTHORIZED, "authentication required"));
            }
        }
        Ok(())
    }

    async fn going_away(&mut self) -> PassiveExit {
        let _ = self
            .conn
            .send(&Message::close(ErrorCode::GOING_AWAY, "listener stopping"))
            .await;
        self.conn.shutdown().await;
        PassiveExit::ShutDown
    }

    async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<PassiveExit, ReplicationError> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {
                    return Ok(self.going_away().await);
                }
                msg = self.conn.recv() => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(ProtocolError::ConnectionClosed) => return Ok(PassiveExit::Completed),
                        Err(e) => return Err(e.into()),
                    };
                    if let Some(exit) = self.handle(msg).await? {
                        return Ok(exit);
                    }
                }
                Some(_) = next_event(&mut self.feed) => {
                    if let Some(feed) = self.feed.as_mut() {
                        while feed.try_recv().is_ok() {}
                    }
                    let batch = self.options.batch_size;
                    self.sent_sequence = self.send_changes(self.sent_sequence, batch).await?;
                }
            }
        }
    }

    async fn handle(&mut self, msg: Message) -> Result<Option<PassiveExit>, ReplicationError> {
        match msg {
            Message::SubChanges(sub) => self.subscribe(sub).await?,
            Message::Revs(revs) => self.receive(revs).await?,
            Message::SetCheckpoint {
                checkpoint_id,
                sequence,
            } => self.db.set_peer_checkpoint(&checkpoint_id, sequence)?,
            Message::Ping => self.conn.send(&Message::Pong).await?,
            Message::Pong => {}
            Message::Close { .. } => {
                self.conn.shutdown().await;
                return Ok(Some(PassiveExit::Completed));
            }
            other => {
                let reason = format!("unexpected {}", other.kind());
                self.conn
                    .send(&Message::error(ErrorCode::PROTOCOL, reason.clone()))
                    .await?;
                return Err(ReplicationError::Protocol(reason));
            }
        }
        Ok(None)
    }

    async fn subscribe(&mut self, sub: SubChanges) -> Result<(), ReplicationError> {
        // Subscribe before reading the backlog so no change falls in between.
        if sub.continuous {
            self.feed = Some(self.db.subscribe());
        }
        let batch = usize::try_from(sub.batch_size)
            .unwrap_or(usize::MAX)
            .clamp(1, self.options.batch_size.max(1));
        let sent = self.send_changes(sub.since, batch).await?;
        self.sent_sequence = sent;
        self.conn.send(&Message::CaughtUp { sequence: sent }).await?;
        Ok(())
    }

    /// Sends every change after `since` in batches. Returns the highest
    /// sequence sent.
    async fn send_changes(&mut self, since: u64, batch: usize) -> Result<u64, ReplicationError> {
        let mut since = since;
        loop {
            let changes = self.db.changes_since(since, batch)?;
            let Some(last) = changes.last() else {
                return Ok(since);
            };
            since = last.sequence;
            let full = changes.len() >= batch;

            let revisions: Vec<_> = changes
                .into_iter()
                .filter(|rev| !self.received.remove(&(rev.doc_id.clone(), rev.rev_id.clone())))
                .collect();
            if !revisions.is_empty() {
                self.conn
                    .send(&Message::Revs(Revs {
                        revisions,
                        sequence: since,
                    }))
                    .await?;
            }
            if !full {
                return Ok(since);
            }
        }
    }

    async fn receive(&mut self, revs: Revs) -> Result<(), ReplicationError> {
        if self.options.read_only {
            tracing::debug!(peer = %self.conn.peer(), "refusing push to read-only database");
            self.conn
                .send(&Message::error(ErrorCode::FORBIDDEN, "database is read-only"))
                .await?;
            return Ok(());
        }

        let mut ack = RevsAck::default();
        for rev in revs.revisions {
            let code = match self.db.apply_revision(&rev) {
                Ok(ApplyOutcome::Inserted(_) | ApplyOutcome::FastForwarded(_)) => {
                    self.received.insert((rev.doc_id.clone(), rev.rev_id.clone()));
                    None
                }
                Ok(ApplyOutcome::AlreadyKnown) => None,
                Ok(ApplyOutcome::Conflict { .. }) => Some(ErrorCode::CONFLICT),
                Err(e) => {
                    tracing::warn!(doc_id = %rev.doc_id, error = %e, "failed to store pushed revision");
                    Some(ErrorCode::INTERNAL)
                }
            };
            match code {
                None => ack.accepted.push((rev.doc_id, rev.rev_id)),
                Some(code) => ack.rejected.push(Rejection {
                    doc_id: rev.doc_id,
                    rev_id: rev.rev_id,
                    code,
                }),
            }
        }
        self.conn.send(&Message::RevsAck(ack)).await?;
        Ok(())
    }
}

async fn next_event(feed: &mut Option<mpsc::UnboundedReceiver<ChangeEvent>>) -> Option<ChangeEvent> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::basic_authorization;
    use docsync_store::Document;
    use std::collections::BTreeMap;

    fn hello(db: &str, authorization: Option<String>) -> Hello {
        Hello {
            protocol_version: PROTOCOL_VERSION,
            database: db.into(),
            checkpoint_id: "cp-test".into(),
            authorization,
            headers: BTreeMap::new(),
            delta_sync: false,
        }
    }

    fn start(db: Arc<Database>, options: PassiveOptions) -> (Connection, watch::Sender<bool>, tokio::task::JoinHandle<PassiveExit>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = watch::channel(false);
        let server = Connection::new(Box::new(b), "active");
        let task = tokio::spawn(async move { serve_passive(server, db, &options, rx, || {}).await });
        (Connection::new(Box::new(a), "passive"), tx, task)
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let db = Arc::new(Database::open_in_memory("db").unwrap());
        let options = PassiveOptions {
            authenticator: Authenticator::password(|u, p| u == "daniel" && p == "123"),
            ..PassiveOptions::default()
        };
        let (mut client, _tx, task) = start(db, options);
        client
            .send(&Message::Hello(hello("db", Some(basic_authorization("daniel", "456")))))
            .await
            .unwrap();
        match client.recv().await.unwrap() {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::UNAUTHORIZED),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(task.await.unwrap(), PassiveExit::Rejected(ErrorCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn unknown_database_is_not_found() {
        let db = Arc::new(Database::open_in_memory("db").unwrap());
        let (mut client, _tx, task) = start(db, PassiveOptions::default());
        client.send(&Message::Hello(hello("other", None))).await.unwrap();
        assert!(matches!(
            client.recv().await.unwrap(),
            Message::Error { code: ErrorCode::NOT_FOUND, .. }
        ));
        assert_eq!(task.await.unwrap(), PassiveExit::Rejected(ErrorCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn pull_backlog_then_checkpoint() {
        let db = Arc::new(Database::open_in_memory("db").unwrap());
        for i in 0..5 {
            db.save(&Document::new(format!("doc-{i}")).with_value("i", i)).unwrap();
        }
        let options = PassiveOptions {
            batch_size: 2,
            ..PassiveOptions::default()
        };
        let (mut client, _tx, _task) = start(Arc::clone(&db), options);
        client.send(&Message::Hello(hello("db", None))).await.unwrap();
        let Message::Welcome(welcome) = client.recv().await.unwrap() else {
            panic!("expected Welcome");
        };
        assert_eq!(welcome.database_uuid, db.uuid());
        assert_eq!(welcome.remote_checkpoint, None);

        client
            .send(&Message::SubChanges(SubChanges {
                since: 0,
                continuous: false,
                batch_size: 100,
            }))
            .await
            .unwrap();
        let mut received = 0;
        let caught_up = loop {
            match client.recv().await.unwrap() {
                Message::Revs(revs) => {
                    assert!(revs.revisions.len() <= 2);
                    received += revs.revisions.len();
                }
                Message::CaughtUp { sequence } => break sequence,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert_eq!(received, 5);
        assert_eq!(caught_up, db.last_sequence());

        client
            .send(&Message::SetCheckpoint {
                checkpoint_id: "cp-test".into(),
                sequence: caught_up,
            })
            .await
            .unwrap();
        client.send(&Message::Ping).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Message::Pong);
        assert_eq!(db.peer_checkpoint("cp-test").unwrap(), Some(caught_up));
    }

    #[tokio::test]
    async fn read_only_refuses_push() {
        let db = Arc::new(Database::open_in_memory("db").unwrap());
        let options = PassiveOptions {
            read_only: true,
            ..PassiveOptions::default()
        };
        let (mut client, _tx, _task) = start(Arc::clone(&db), options);
        client.send(&Message::Hello(hello("db", None))).await.unwrap();
        assert_eq!(client.recv().await.unwrap().kind(), "Welcome");

        let source = Database::open_in_memory("src").unwrap();
        source.save(&Document::new("a").with_value("x", 1)).unwrap();
        let revisions = source.changes_since(0, 10).unwrap();
        client
            .send(&Message::Revs(Revs {
                revisions,
                sequence: 1,
            }))
            .await
            .unwrap();
        assert!(matches!(
            client.recv().await.unwrap(),
            Message::Error { code: ErrorCode::FORBIDDEN, .. }
        ));
        assert_eq!(db.document_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_sends_going_away() {
        let db = Arc::new(Database::open_in_memory("db").unwrap());
        let (mut client, tx, task) = start(db, PassiveOptions::default());
        client.send(&Message::Hello(hello("db", None))).await.unwrap();
        assert_eq!(client.recv().await.unwrap().kind(), "Welcome");

        tx.send_replace(true);
        assert!(matches!(
            client.recv().await.unwrap(),
            Message::Close { code: ErrorCode::GOING_AWAY, .. }
        ));
        assert_eq!(task.await.unwrap(), PassiveExit::ShutDown);
    }
}
