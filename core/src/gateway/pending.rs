//! The pending-request table: correlation id -> deadline + resolver.
//!
//! Every registration hands back a [`PendingGuard`]. Dropping the guard
//! removes the entry and aborts the dispatch task, so an entry can never
//! outlive the attempt that created it, whichever way that attempt ends.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::types::{CorrelationId, PartialText};
use crate::backends::{BackendId, RawReply};
use crate::errors::TransportError;

pub type ReplyOutcome = Result<RawReply, TransportError>;

struct PendingEntry {
    backend: BackendId,
    deadline: Instant,
    reply: oneshot::Sender<ReplyOutcome>,
    partials: Option<mpsc::UnboundedSender<PartialText>>,
}

#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<CorrelationId, PendingEntry>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new entry under a fresh id.
    pub(crate) fn register(
        &self,
        backend: BackendId,
        deadline: Instant,
        partials: Option<mpsc::UnboundedSender<PartialText>>,
    ) -> (PendingGuard, oneshot::Receiver<ReplyOutcome>) {
        let (reply, receiver) = oneshot::channel();
        let mut entries = self.entries.lock();
        let id = loop {
            let candidate = CorrelationId::new();
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            id,
            PendingEntry {
                backend,
                deadline,
                reply,
                partials,
            },
        );
        let guard = PendingGuard {
            table: self.clone(),
            id,
            dispatch: None,
        };
        (guard, receiver)
    }

    /// Deliver the reply for `id`. Returns `false` when nothing is waiting
    /// for it any more (timed out, abandoned or already resolved); the reply
    /// is then dropped.
    pub fn resolve(&self, id: &CorrelationId, outcome: ReplyOutcome) -> bool {
        let entry = self.entries.lock().remove(id);
        match entry {
            Some(entry) => entry.reply.send(outcome).is_ok(),
            None => {
                debug!("discarding reply for {id}: no pending request");
                false
            }
        }
    }

    /// Forward a streaming fragment for `id`. Late fragments are dropped.
    pub fn notify_partial(&self, id: &CorrelationId, text: &str) -> bool {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(id) else {
            debug!("discarding partial for {id}: no pending request");
            return false;
        };
        match &entry.partials {
            Some(tx) => tx
                .send(PartialText {
                    correlation_id: *id,
                    backend: entry.backend.clone(),
                    text: text.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Drop every entry whose deadline is at or before `now`. The waiting
    /// side observes a closed channel and reports a timeout.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.deadline > now);
        before - entries.len()
    }

    pub fn sink(&self, id: CorrelationId) -> PartialSink {
        PartialSink {
            table: self.clone(),
            id,
        }
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: &CorrelationId) -> bool {
        self.entries.lock().remove(id).is_some()
    }
}

/// Owns one table entry for the duration of an attempt.
pub struct PendingGuard {
    table: PendingTable,
    id: CorrelationId,
    dispatch: Option<AbortHandle>,
}

impl PendingGuard {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub(crate) fn attach(&mut self, dispatch: AbortHandle) {
        self.dispatch = Some(dispatch);
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.table.remove(&self.id) {
            debug!("released pending request {}", self.id);
        }
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.abort();
        }
    }
}

/// Handle a transport uses to report streaming fragments for its call.
#[derive(Clone)]
pub struct PartialSink {
    table: PendingTable,
    id: CorrelationId,
}

impl PartialSink {
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    pub fn emit(&self, text: &str) -> bool {
        self.table.notify_partial(&self.id, text)
    }
}
