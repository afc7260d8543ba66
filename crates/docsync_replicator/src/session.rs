//! One connection's worth of active replication.
//!
//! A session dials the endpoint, performs the handshake, then runs pull and
//! push concurrently over the same connection until it is stopped, the
//! peer goes away, or (one-shot) both directions have caught up.
//!
//! ```text
//! pull:  SubChanges ──▶            push:  Revs ──────▶
//!        ◀── Revs*                        ◀── RevsAck
//!        ◀── CaughtUp                     (repeat while pending)
//!        SetCheckpoint ──▶
//! ```

use crate::config::{DocumentFlags, ReplicationFilter};
use crate::error::{ReplicationError, ReplicationResult};
use crate::endpoint::Endpoint;
use crate::passive::shutdown_requested;
use crate::replicator::Shared;
use crate::resolver::{resolve_conflict, ConflictResolver, DefaultConflictResolver};
use crate::status::{ActivityLevel, DocumentReplication, Progress, ReplicatedDocument, ReplicationDirection};
use crate::transport::dial;
use docsync_protocol::{
    basic_authorization, Connection, ErrorCode, Hello, Message, Revs, RevsAck, SubChanges,
    PROTOCOL_VERSION,
};
use docsync_store::{ApplyOutcome, ChangeEvent, Database, Document, Revision, RevisionId};
use docsync_tls::Authenticator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

/// How long a stopping session waits for the acknowledgement of a push
/// batch already sent.
const IN_FLIGHT_GRACE: Duration = Duration::from_secs(2);

/// Returns true if `filter` admits the revision. No filter admits everything.
pub(crate) fn passes_filter(filter: Option<&ReplicationFilter>, rev: &Revision) -> bool {
    match filter {
        Some(filter) => filter(&Document::from_revision(rev), DocumentFlags { deleted: rev.deleted }),
        None => true,
    }
}

/// Outcome of applying one pulled batch.
struct PulledBatch {
    documents: Vec<ReplicatedDocument>,
    /// Revisions that passed the filter; the peer has all of them.
    known: Vec<(String, RevisionId)>,
    /// Lowest peer sequence the pull filter turned away.
    filtered_floor: Option<u64>,
}

/// Applies pulled revisions, resolving conflicts. Blocking.
fn apply_pulled(
    db: &Database,
    filter: Option<&ReplicationFilter>,
    resolver: &dyn ConflictResolver,
    revisions: &[Revision],
) -> ReplicationResult<PulledBatch> {
    let mut batch = PulledBatch {
        documents: Vec::with_capacity(revisions.len()),
        known: Vec::with_capacity(revisions.len()),
        filtered_floor: None,
    };
    for rev in revisions {
        if !passes_filter(filter, rev) {
            tracing::trace!(doc_id = %rev.doc_id, "pull filter rejected revision");
            batch.filtered_floor = Some(batch.filtered_floor.map_or(rev.sequence, |f| f.min(rev.sequence)));
            continue;
        }
        batch.known.push((rev.doc_id.clone(), rev.rev_id.clone()));

        let error = match db.apply_revision(rev)? {
            ApplyOutcome::Inserted(_) | ApplyOutcome::FastForwarded(_) | ApplyOutcome::AlreadyKnown => None,
            ApplyOutcome::Conflict { local } => match resolve_conflict(db, resolver, rev, local) {
                Ok(_) => None,
                Err(e @ ReplicationError::Conflict { .. }) => Some(e),
                Err(e) => return Err(e),
            },
        };
        batch.documents.push(ReplicatedDocument {
            id: rev.doc_id.clone(),
            flags: DocumentFlags { deleted: rev.deleted },
            error,
        });
    }
    Ok(batch)
}

/// A revision waiting for the peer's acknowledgement.
struct InFlight {
    doc_id: String,
    deleted: bool,
}

struct ActiveSession<'a> {
    shared: &'a Shared,
    db: Arc<Database>,
    conn: Connection,
    resolver: Arc<dyn ConflictResolver>,
    continuous: bool,

    pull_enabled: bool,
    pull_caught_up: bool,
    /// Pull checkpoints stay below this peer sequence so filtered revisions
    /// are offered again on the next pass.
    pull_floor: Option<u64>,
    pull: Progress,

    push_enabled: bool,
    /// Local changes may need pushing.
    push_dirty: bool,
    feed: Option<mpsc::UnboundedReceiver<ChangeEvent>>,
    in_flight: Option<Vec<InFlight>>,
    /// Revisions the peer refused, skipped until the document changes.
    rejected: HashMap<String, (RevisionId, ReplicationError)>,
    push: Progress,

    last_heard: Instant,
}

/// Runs one session. `Ok` means the session ended normally (stopped or
/// one-shot complete). `connected` is set once the handshake succeeds.
pub(crate) async fn run_session(
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
    connected: &mut bool,
) -> ReplicationResult<()> {
    let config = &shared.config;

    let mut conn = tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => return Ok(()),
        conn = dial(config, &shared.server_certificate) => conn?,
    };

    let database = match &config.endpoint {
        Endpoint::Url(url) => url.database().to_string(),
        Endpoint::Database(target) => target.name().to_string(),
    };
    let authorization = match &config.authenticator {
        Authenticator::Basic { username, password } => Some(basic_authorization(username, password)),
        _ => None,
    };
    conn.send(&Message::Hello(Hello {
        protocol_version: PROTOCOL_VERSION,
        database,
        checkpoint_id: shared.checkpoint_id.clone(),
        authorization,
        headers: config.headers.clone(),
        delta_sync: false,
    }))
    .await?;

    let welcome = tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => {
            conn.shutdown().await;
            return Ok(());
        }
        reply = tokio::time::timeout(config.timeouts.connect, conn.recv()) => match reply {
            Err(_) => {
                return Err(ReplicationError::NetworkUnreachable(
                    "timed out waiting for handshake reply".into(),
                ))
            }
            Ok(Ok(Message::Welcome(welcome))) => welcome,
            Ok(Ok(Message::Error { code, message })) | Ok(Ok(Message::Close { code, reason: message })) => {
                return Err(ReplicationError::from_peer(code, &message));
            }
            Ok(Ok(other)) => {
                return Err(ReplicationError::Protocol(format!(
                    "expected Welcome, got {}",
                    other.kind()
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
        },
    };
    *connected = true;
    tracing::info!(
        endpoint = ?config.endpoint,
        peer_database = %welcome.database_uuid,
        "replicator connected"
    );

    let db = Arc::clone(&config.database);
    let checkpoint = db.checkpoint(&shared.checkpoint_id)?;
    let since = welcome
        .remote_checkpoint
        .map_or(0, |remote| remote.min(checkpoint.pull_sequence));

    let status = shared.status();
    let mut session = ActiveSession {
        shared,
        db,
        conn,
        resolver: config
            .conflict_resolver
            .clone()
            .unwrap_or_else(|| Arc::new(DefaultConflictResolver)),
        continuous: config.continuous,
        pull_enabled: config.replicator_type.is_pull(),
        pull_caught_up: false,
        pull_floor: None,
        pull: status.pull_progress,
        push_enabled: config.replicator_type.is_push(),
        push_dirty: true,
        feed: None,
        in_flight: None,
        rejected: HashMap::new(),
        push: status.push_progress,
        last_heard: Instant::now(),
    };
    shared.update_status(|s| {
        s.activity = ActivityLevel::Busy;
        s.error = None;
    });

    if session.push_enabled && session.continuous {
        session.feed = Some(session.db.subscribe());
    }
    if session.pull_enabled {
        tracing::debug!(since, "subscribing to peer changes");
        session
            .conn
            .send(&Message::SubChanges(SubChanges {
                since,
                continuous: session.continuous,
                batch_size: config.batch_size,
            }))
            .await?;
    }

    session.run(shutdown).await
}

impl ActiveSession<'_> {
    async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> ReplicationResult<()> {
        let heartbeat_every = self.shared.config.timeouts.heartbeat;
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            if self.push_enabled && self.in_flight.is_none() && self.push_dirty {
                self.push_next_batch().await?;
            }

            let settled = self.is_settled();
            self.shared.update_status(|s| {
                s.activity = if settled {
                    ActivityLevel::Idle
                } else {
                    ActivityLevel::Busy
                };
            });
            if settled && !self.continuous {
                return self.complete().await;
            }

            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {
                    self.settle_in_flight().await;
                    let _ = self
                        .conn
                        .send(&Message::close(ErrorCode::NORMAL, "replicator stopped"))
                        .await;
                    self.conn.shutdown().await;
                    return Ok(());
                }
                msg = self.conn.recv() => {
                    self.last_heard = Instant::now();
                    self.handle(msg?).await?;
                }
                Some(_) = next_change(&mut self.feed) => {
                    if let Some(feed) = self.feed.as_mut() {
                        while feed.try_recv().is_ok() {}
                    }
                    self.push_dirty = true;
                }
                _ = heartbeat.tick() => {
                    if self.last_heard.elapsed() > heartbeat_every * 2 {
                        return Err(ReplicationError::Network("peer stopped responding".into()));
                    }
                    self.conn.send(&Message::Ping).await?;
                }
            }
        }
    }

    /// Waits up to [`IN_FLIGHT_GRACE`] for the peer to acknowledge the push
    /// batch in flight. Anything unacknowledged stays pending.
    async fn settle_in_flight(&mut self) {
        let deadline = tokio::time::Instant::now() + IN_FLIGHT_GRACE;
        while self.in_flight.is_some() {
            match tokio::time::timeout_at(deadline, self.conn.recv()).await {
                Ok(Ok(Message::RevsAck(ack))) => {
                    if let Err(e) = self.receive_ack(ack) {
                        tracing::debug!(error = %e, "acknowledgement after stop failed");
                        return;
                    }
                }
                // Pulled changes are not applied once stopping; the
                // checkpoint has not moved past them.
                Ok(Ok(Message::Revs(_) | Message::CaughtUp { .. } | Message::Ping | Message::Pong)) => {}
                Ok(Ok(_) | Err(_)) | Err(_) => return,
            }
        }
    }

    fn is_settled(&self) -> bool {
        let pull_done = !self.pull_enabled || self.pull_caught_up;
        let push_done = !self.push_enabled || (self.in_flight.is_none() && !self.push_dirty);
        pull_done && push_done
    }

    /// Ends a one-shot session whose work is done.
    async fn complete(&mut self) -> ReplicationResult<()> {
        let _ = self
            .conn
            .send(&Message::close(ErrorCode::NORMAL, "replication complete"))
            .await;
        self.conn.shutdown().await;

        // A rejection still matching the current revision was never settled.
        for (doc_id, (rev_id, error)) in &self.rejected {
            let current = self.db.current_revision(doc_id)?;
            if current.is_some_and(|rev| &rev.rev_id == rev_id) {
                return Err(error.clone());
            }
        }
        tracing::info!(
            pushed = self.push.completed,
            pulled = self.pull.completed,
            "one-shot replication complete"
        );
        Ok(())
    }

    async fn handle(&mut self, msg: Message) -> ReplicationResult<()> {
        match msg {
            Message::Revs(revs) if self.pull_enabled => self.receive_revs(revs).await,
            Message::CaughtUp { sequence } if self.pull_enabled => {
                self.pull_caught_up = true;
                self.save_pull_sequence(sequence, Vec::new()).await
            }
            Message::RevsAck(ack) if self.in_flight.is_some() => self.receive_ack(ack),
            Message::Ping => Ok(self.conn.send(&Message::Pong).await?),
            Message::Pong => Ok(()),
            Message::Error { code, message } => Err(ReplicationError::from_peer(code, &message)),
            Message::Close { code, reason } => Err(ReplicationError::from_peer(code, &reason)),
            other => Err(ReplicationError::Protocol(format!(
                "unexpected {} from peer",
                other.kind()
            ))),
        }
    }

    // ========================================================================
    // Pull
    // ========================================================================

    async fn receive_revs(&mut self, revs: Revs) -> ReplicationResult<()> {
        let count = revs.revisions.len() as u64;
        self.pull.total += count;
        self.report_progress();

        let db = Arc::clone(&self.db);
        let filter = self.shared.config.pull_filter.clone();
        let resolver = Arc::clone(&self.resolver);
        let revisions = revs.revisions;
        let batch = tokio::task::spawn_blocking(move || {
            apply_pulled(&db, filter.as_ref(), resolver.as_ref(), &revisions)
        })
        .await
        .map_err(|e| ReplicationError::Database(format!("pull task failed: {e}")))??;

        for doc in batch.documents.iter().filter(|d| d.error.is_some()) {
            tracing::warn!(doc_id = %doc.id, "pulled revision left unresolved");
        }
        if let Some(floor) = batch.filtered_floor {
            self.pull_floor = Some(self.pull_floor.map_or(floor, |f| f.min(floor)));
        }
        self.pull.completed += count;
        self.report_progress();
        if !batch.documents.is_empty() {
            self.shared.post_documents(DocumentReplication {
                direction: ReplicationDirection::Pull,
                documents: batch.documents,
            });
        }
        self.save_pull_sequence(revs.sequence, batch.known).await
    }

    /// Records pull progress locally and on the peer.
    async fn save_pull_sequence(
        &mut self,
        sequence: u64,
        known: Vec<(String, RevisionId)>,
    ) -> ReplicationResult<()> {
        let sequence = match self.pull_floor {
            Some(floor) => sequence.min(floor.saturating_sub(1)),
            None => sequence,
        };
        self.db.update_checkpoint(&self.shared.checkpoint_id, |cp| {
            cp.pull_sequence = cp.pull_sequence.max(sequence);
            for (doc_id, rev_id) in known {
                cp.mark_known(doc_id, rev_id);
            }
        })?;
        self.conn
            .send(&Message::SetCheckpoint {
                checkpoint_id: self.shared.checkpoint_id.clone(),
                sequence,
            })
            .await?;
        Ok(())
    }

    // ========================================================================
    // Push
    // ========================================================================

    async fn push_next_batch(&mut self) -> ReplicationResult<()> {
        let shared = self.shared;
        let config = &shared.config;
        let limit = usize::try_from(config.batch_size).unwrap_or(usize::MAX);
        let batch: Vec<Revision> = self
            .db
            .unsynced_revisions(&self.shared.checkpoint_id)?
            .into_iter()
            .filter(|rev| {
                self.rejected
                    .get(&rev.doc_id)
                    .map_or(true, |(rejected, _)| rejected != &rev.rev_id)
            })
            .filter(|rev| passes_filter(config.push_filter.as_ref(), rev))
            .take(limit)
            .collect();

        let Some(last) = batch.last() else {
            self.push_dirty = false;
            return Ok(());
        };
        let sequence = last.sequence;
        self.push.total += batch.len() as u64;
        self.report_progress();
        self.in_flight = Some(
            batch
                .iter()
                .map(|rev| InFlight {
                    doc_id: rev.doc_id.clone(),
                    deleted: rev.deleted,
                })
                .collect(),
        );
        tracing::debug!(count = batch.len(), sequence, "pushing revisions");
        self.conn
            .send(&Message::Revs(Revs {
                revisions: batch,
                sequence,
            }))
            .await?;
        Ok(())
    }

    fn receive_ack(&mut self, ack: RevsAck) -> ReplicationResult<()> {
        let in_flight = self.in_flight.take().unwrap_or_default();
        let deleted = |doc_id: &str| {
            in_flight
                .iter()
                .any(|f| f.doc_id == doc_id && f.deleted)
        };

        if let Some(rejection) = ack.rejected.iter().find(|r| r.code == ErrorCode::FORBIDDEN) {
            return Err(ReplicationError::HttpForbidden(format!(
                "peer refused {}",
                rejection.doc_id
            )));
        }

        self.db.update_checkpoint(&self.shared.checkpoint_id, |cp| {
            for (doc_id, rev_id) in &ack.accepted {
                cp.mark_known(doc_id.clone(), rev_id.clone());
            }
        })?;

        let mut documents = Vec::with_capacity(ack.accepted.len() + ack.rejected.len());
        for (doc_id, _) in &ack.accepted {
            self.rejected.remove(doc_id);
            documents.push(ReplicatedDocument {
                id: doc_id.clone(),
                flags: DocumentFlags {
                    deleted: deleted(doc_id),
                },
                error: None,
            });
        }
        for rejection in ack.rejected {
            let error = if rejection.code == ErrorCode::CONFLICT {
                ReplicationError::Conflict {
                    doc_id: rejection.doc_id.clone(),
                }
            } else {
                ReplicationError::from_peer(rejection.code, "revision rejected")
            };
            tracing::debug!(doc_id = %rejection.doc_id, error = %error, "push rejected");
            documents.push(ReplicatedDocument {
                id: rejection.doc_id.clone(),
                flags: DocumentFlags {
                    deleted: deleted(&rejection.doc_id),
                },
                error: Some(error.clone()),
            });
            self.rejected
                .insert(rejection.doc_id, (rejection.rev_id, error));
        }

        self.push.completed += documents.len() as u64;
        self.push_dirty = true;
        self.report_progress();
        self.shared.post_documents(DocumentReplication {
            direction: ReplicationDirection::Push,
            documents,
        });
        Ok(())
    }

    fn report_progress(&self) {
        let (push, pull) = (self.push, self.pull);
        self.shared.update_status(|s| s.set_progress(push, pull));
    }
}

async fn next_change(feed: &mut Option<mpsc::UnboundedReceiver<ChangeEvent>>) -> Option<ChangeEvent> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
