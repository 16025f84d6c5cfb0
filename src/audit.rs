//! Tamper-evident audit chain.
//!
//! Append-only, hash-linked event log. Every event's hash covers its own
//! fields plus the previous event's hash, so any retroactive modification
//! breaks the chain at a detectable position.
//!
//! ## Single-writer invariant
//!
//! Each event's hash depends on the immediately preceding stored hash, so
//! concurrent appends must be queued, never interleaved. A dedicated
//! appender task owns the tail hash and sequence counter; callers talk to
//! it through a cloneable [`AuditHandle`] over an mpsc channel and await a
//! per-command ack. Append position, not caller identity, defines global
//! order.
//!
//! ## Durability
//!
//! With the JSONL backend, an event is acked only after its line is written
//! and flushed. A storage failure is returned to the caller and the tail
//! does not advance: an event that could not be durably appended has not
//! occurred.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::GatewayError;

/// Sentinel `prev_hash` for the first event in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Queue depth for the appender channel.
const COMMAND_BUFFER: usize = 256;

/// Recognized audit event kinds.
///
/// Treated as an open enumeration: new kinds may be added, but existing
/// ordinals are never reused; the ordinal participates in event hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AuditEventType {
    /// A routing decision was made for a task.
    RoutingDecision = 0,
    /// A governed provider call was dispatched.
    RequestIssued = 1,
    /// A provider call completed (successfully or not).
    ResponseReceived = 2,
    /// An ensemble reconciliation completed.
    EnsembleEvaluation = 3,
    /// A governed call was served from cache.
    CacheHit = 4,
    /// A governed call missed the cache.
    CacheMiss = 5,
    /// A call was rejected by the rate limiter.
    RateLimitExceeded = 6,
    /// A call was rejected by budget enforcement.
    BudgetAlert = 7,
    /// A security-relevant event.
    SecurityEvent = 8,
    /// An administrative action.
    AdminAction = 9,
}

impl AuditEventType {
    /// Stable ordinal of this kind; participates in event hashes.
    pub fn ordinal(self) -> u8 {
        self as u8
    }
}

/// One immutable entry in the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Zero-based position in the chain.
    pub sequence: u64,
    /// Time of append (UTC).
    pub timestamp: DateTime<Utc>,
    /// Kind of event.
    pub event_type: AuditEventType,
    /// Structured event detail.
    pub payload: serde_json::Value,
    /// Hash of the preceding event ([`GENESIS_HASH`] for the first).
    pub prev_hash: String,
    /// SHA-256 over this event's fields and `prev_hash`, lowercase hex.
    pub hash: String,
}

/// Outcome of replaying the chain against its stored hashes.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    /// Whether every stored hash matched its recomputation.
    pub is_valid: bool,
    /// Number of events examined (stops at the first break).
    pub total_events: u64,
    /// Position of the first broken link, if any.
    pub first_invalid_index: Option<u64>,
    /// Hash recomputed from the stored fields at the broken position.
    pub expected_hash: Option<String>,
    /// Hash actually stored at the broken position.
    pub actual_hash: Option<String>,
}

/// Compute the hash of an event from its fields and the previous hash.
fn compute_hash(
    sequence: u64,
    timestamp: &DateTime<Utc>,
    event_type: AuditEventType,
    payload: &serde_json::Value,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_be_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    hasher.update([event_type.ordinal()]);
    hasher.update(payload.to_string().as_bytes());
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Replay a stored event sequence, recomputing each hash from its fields
/// and the previous *stored* hash, and comparing against the hash stored at
/// that position.
///
/// Verification halts at the first mismatch: later entries' validity is
/// contingent on the broken link before them. Pure function, so exported
/// chains can be verified outside the process too.
pub fn verify_chain(events: &[AuditEvent]) -> IntegrityReport {
    let mut prev_hash = GENESIS_HASH;

    for (index, event) in events.iter().enumerate() {
        let expected = compute_hash(
            event.sequence,
            &event.timestamp,
            event.event_type,
            &event.payload,
            prev_hash,
        );
        if expected != event.hash {
            return IntegrityReport {
                is_valid: false,
                total_events: index as u64 + 1,
                first_invalid_index: Some(index as u64),
                expected_hash: Some(expected),
                actual_hash: Some(event.hash.clone()),
            };
        }
        prev_hash = &event.hash;
    }

    IntegrityReport {
        is_valid: true,
        total_events: events.len() as u64,
        first_invalid_index: None,
        expected_hash: None,
        actual_hash: None,
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

/// Append-only event store. Existing entries are never rewritten.
enum AuditStore {
    /// Process-local store.
    Memory(Vec<AuditEvent>),
    /// Process-local store mirrored to an append-only JSONL file.
    Jsonl {
        /// In-memory view for verification and export.
        events: Vec<AuditEvent>,
        /// Durable sink; one JSON line per event.
        file: std::fs::File,
    },
}

impl AuditStore {
    fn events(&self) -> &[AuditEvent] {
        match self {
            Self::Memory(events) => events,
            Self::Jsonl { events, .. } => events,
        }
    }

    /// Durably append one event. On any error the store is unchanged from
    /// the chain's point of view (the in-memory view is only extended after
    /// the durable write succeeds).
    fn persist(&mut self, event: AuditEvent) -> Result<(), GatewayError> {
        match self {
            Self::Memory(events) => {
                events.push(event);
                Ok(())
            }
            Self::Jsonl { events, file } => {
                let line = serde_json::to_string(&event)
                    .map_err(|e| GatewayError::AuditStorage(format!("serialize: {e}")))?;
                writeln!(file, "{line}")
                    .map_err(|e| GatewayError::AuditStorage(format!("write: {e}")))?;
                file.flush()
                    .map_err(|e| GatewayError::AuditStorage(format!("flush: {e}")))?;
                events.push(event);
                Ok(())
            }
        }
    }
}

// ── Serial appender state ────────────────────────────────────────────────

/// The appender's owned state: store, tail hash, next sequence number.
struct ChainState {
    store: AuditStore,
    tail_hash: String,
    next_sequence: u64,
}

impl ChainState {
    /// Build the appender state, resuming from the store's last event if it
    /// already holds any (a reopened JSONL file), so the chain stays one
    /// unbroken sequence across process restarts.
    fn new(store: AuditStore) -> Self {
        let (tail_hash, next_sequence) = match store.events().last() {
            Some(last) => (last.hash.clone(), last.sequence + 1),
            None => (GENESIS_HASH.to_string(), 0),
        };
        Self {
            store,
            tail_hash,
            next_sequence,
        }
    }

    /// Append one event at the given instant. The tail only advances after
    /// the durable write succeeds.
    fn append_at(
        &mut self,
        event_type: AuditEventType,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<AuditEvent, GatewayError> {
        let hash = compute_hash(self.next_sequence, &now, event_type, &payload, &self.tail_hash);
        let event = AuditEvent {
            sequence: self.next_sequence,
            timestamp: now,
            event_type,
            payload,
            prev_hash: self.tail_hash.clone(),
            hash,
        };

        self.store.persist(event.clone())?;
        self.tail_hash = event.hash.clone();
        self.next_sequence += 1;
        Ok(event)
    }

    fn export(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<AuditEvent> {
        self.store
            .events()
            .iter()
            .filter(|e| start.map_or(true, |s| e.timestamp >= s))
            .filter(|e| end.map_or(true, |s| e.timestamp <= s))
            .cloned()
            .collect()
    }
}

// ── Appender task and handle ─────────────────────────────────────────────

enum Command {
    Append {
        event_type: AuditEventType,
        payload: serde_json::Value,
        ack: oneshot::Sender<Result<AuditEvent, GatewayError>>,
    },
    Verify {
        ack: oneshot::Sender<IntegrityReport>,
    },
    Export {
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        ack: oneshot::Sender<Vec<AuditEvent>>,
    },
    Len {
        ack: oneshot::Sender<u64>,
    },
}

/// Constructors for audit chains. Each constructor spawns the serial
/// appender task and returns a handle to it.
pub struct AuditChain;

impl AuditChain {
    /// Spawn a chain backed by process memory only.
    pub fn spawn_memory() -> AuditHandle {
        Self::spawn(AuditStore::Memory(Vec::new()))
    }

    /// Spawn a chain mirrored to an append-only JSONL file.
    ///
    /// If the file already holds events from an earlier run, the chain
    /// resumes from its last line: new appends link to the stored tail hash
    /// and continue the sequence, keeping the file one verifiable chain
    /// across restarts.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AuditStorage`] if the file cannot be read or
    /// opened for appending, or if an existing line does not parse as an
    /// event.
    pub fn spawn_jsonl(path: &Path) -> Result<AuditHandle, GatewayError> {
        let events = read_jsonl(path)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                GatewayError::AuditStorage(format!("open {}: {e}", path.display()))
            })?;
        Ok(Self::spawn(AuditStore::Jsonl { events, file }))
    }

    fn spawn(store: AuditStore) -> AuditHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run_appender(rx, ChainState::new(store)));
        AuditHandle { tx }
    }
}

/// Load the events already stored in a JSONL file, in line order. A missing
/// file is an empty chain; an unparseable line is a storage error, since
/// appending past it would hide the corruption.
fn read_jsonl(path: &Path) -> Result<Vec<AuditEvent>, GatewayError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(GatewayError::AuditStorage(format!(
                "read {}: {e}",
                path.display()
            )))
        }
    };
    content
        .lines()
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                GatewayError::AuditStorage(format!("corrupt line in {}: {e}", path.display()))
            })
        })
        .collect()
}

async fn run_appender(mut rx: mpsc::Receiver<Command>, mut state: ChainState) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Append {
                event_type,
                payload,
                ack,
            } => {
                let result = state.append_at(event_type, payload, Utc::now());
                if let Err(e) = &result {
                    error!(error = %e, "audit append failed");
                } else {
                    debug!(
                        sequence = state.next_sequence - 1,
                        event_type = ?event_type,
                        "audit event appended"
                    );
                }
                let _ = ack.send(result);
            }
            Command::Verify { ack } => {
                let _ = ack.send(verify_chain(state.store.events()));
            }
            Command::Export { start, end, ack } => {
                let _ = ack.send(state.export(start, end));
            }
            Command::Len { ack } => {
                let _ = ack.send(state.next_sequence);
            }
        }
    }
}

/// Cloneable handle to the serial appender task.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<Command>,
}

impl AuditHandle {
    /// Append one event, awaiting durable storage.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::AuditStorage`] if the event could not be durably
    ///   written; the chain is unchanged and the triggering operation must
    ///   fail.
    /// - [`GatewayError::AuditChannelClosed`] if the appender task is gone.
    pub async fn append(
        &self,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Result<AuditEvent, GatewayError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Append {
                event_type,
                payload,
                ack,
            })
            .await
            .map_err(|_| GatewayError::AuditChannelClosed)?;
        rx.await.map_err(|_| GatewayError::AuditChannelClosed)?
    }

    /// Replay the chain and report integrity. Read-only and idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AuditChannelClosed`] if the appender task is
    /// gone.
    pub async fn verify(&self) -> Result<IntegrityReport, GatewayError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Verify { ack })
            .await
            .map_err(|_| GatewayError::AuditChannelClosed)?;
        rx.await.map_err(|_| GatewayError::AuditChannelClosed)
    }

    /// Export all events in `[start, end]` (either bound optional) in
    /// append order. Read-only; suitable for compliance reporting.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AuditChannelClosed`] if the appender task is
    /// gone.
    pub async fn export(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>, GatewayError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Export { start, end, ack })
            .await
            .map_err(|_| GatewayError::AuditChannelClosed)?;
        rx.await.map_err(|_| GatewayError::AuditChannelClosed)
    }

    /// Number of events appended so far.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AuditChannelClosed`] if the appender task is
    /// gone.
    pub async fn len(&self) -> Result<u64, GatewayError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(Command::Len { ack })
            .await
            .map_err(|_| GatewayError::AuditChannelClosed)?;
        rx.await.map_err(|_| GatewayError::AuditChannelClosed)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
