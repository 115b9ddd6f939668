//! Call Tracking
//!
//! Every outbound call is registered in the peer's [`OutboundCallTable`]
//! under its id until it reaches a final stage.
//!
//! # Stages
//!
//! ```text
//! plain:    Pending ─► Sent ─► Completed
//! compute:  Pending ─► Sent ─► ResultReceived ─► Invalidated
//!                        └──────────────────────────┘ (lost before result)
//! ```
//!
//! A compute call stays registered after its result arrives, because the
//! server may still invalidate it. It leaves the table when invalidated,
//! which happens exactly once: on a server `$sys.invalidate`, on reconnect,
//! or when the peer stops.
//!
//! Inbound calls are tracked in the [`InboundCallTable`] only so they can be
//! cancelled by the remote side or when the connection drops.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::message::ArgumentData;
use crate::error::Error;
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Plain,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStage {
    /// Registered, waiting for a connection.
    Pending,
    Sent,
    /// Compute calls only: result known, invalidation pending.
    ResultReceived,
    /// Plain calls only: final.
    Completed,
    /// Compute calls only: final.
    Invalidated,
}

struct CallState {
    stage: CallStage,
    epoch: u64,
    answered: bool,
}

pub(crate) struct CallEntry {
    id: i64,
    kind: CallKind,
    service: String,
    method: String,
    state: Mutex<CallState>,
    result: watch::Sender<Option<Outcome<ArgumentData>>>,
    invalidated: watch::Sender<bool>,
}

impl CallEntry {
    pub(crate) fn new(id: i64, kind: CallKind, service: &str, method: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            service: service.to_string(),
            method: method.to_string(),
            state: Mutex::new(CallState {
                stage: CallStage::Pending,
                epoch: 0,
                answered: false,
            }),
            result: watch::channel(None).0,
            invalidated: watch::channel(false).0,
        })
    }

    pub(crate) fn id(&self) -> i64 {
        self.id
    }

    pub(crate) fn kind(&self) -> CallKind {
        self.kind
    }

    pub(crate) fn service(&self) -> &str {
        &self.service
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn stage(&self) -> CallStage {
        self.state.lock().stage
    }

    /// Record that the call went out on connection `epoch`.
    pub(crate) fn mark_sent(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.stage != CallStage::Pending {
            return false;
        }
        state.stage = CallStage::Sent;
        state.epoch = epoch;
        true
    }

    /// Accept a result sent by the remote peer.
    ///
    /// A compute call moves to ResultReceived even when the result is an
    /// error: the server cached that error and will invalidate it later.
    pub(crate) fn set_remote_result(&self, outcome: Outcome<ArgumentData>) -> bool {
        {
            let mut state = self.state.lock();
            if !matches!(state.stage, CallStage::Pending | CallStage::Sent) {
                return false;
            }
            state.stage = match self.kind {
                CallKind::Plain => CallStage::Completed,
                CallKind::Compute => CallStage::ResultReceived,
            };
            state.answered = true;
        }
        self.result.send_replace(Some(outcome));
        true
    }

    /// Resolve an unanswered call locally (disconnect, timeout, stop,
    /// cancellation). Compute calls end up invalidated.
    pub(crate) fn fail(&self, outcome: Outcome<ArgumentData>) -> bool {
        {
            let mut state = self.state.lock();
            if !matches!(state.stage, CallStage::Pending | CallStage::Sent) {
                return false;
            }
            state.stage = match self.kind {
                CallKind::Plain => CallStage::Completed,
                CallKind::Compute => CallStage::Invalidated,
            };
        }
        self.result.send_replace(Some(outcome));
        if self.kind == CallKind::Compute {
            self.invalidated.send_replace(true);
        }
        true
    }

    /// Invalidate a compute call. Returns `true` only the first time.
    ///
    /// A call still waiting for its result resolves with `reason`.
    pub(crate) fn invalidate(&self, reason: Error) -> bool {
        let had_result = {
            let mut state = self.state.lock();
            if self.kind != CallKind::Compute || state.stage == CallStage::Invalidated {
                return false;
            }
            let had_result = state.stage == CallStage::ResultReceived;
            state.stage = CallStage::Invalidated;
            had_result
        };
        if !had_result {
            self.result.send_replace(Some(Outcome::Err(reason)));
        }
        self.invalidated.send_replace(true);
        true
    }

    /// Whether the call went out on a connection no newer than `epoch` and
    /// is still waiting for its result.
    fn is_unanswered_on(&self, epoch: u64) -> bool {
        let state = self.state.lock();
        state.stage == CallStage::Sent && state.epoch <= epoch
    }

    /// Whether the result came from the remote peer rather than a local
    /// failure.
    pub(crate) fn is_answered(&self) -> bool {
        self.state.lock().answered
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        *self.invalidated.borrow()
    }

    pub(crate) fn try_result(&self) -> Option<Outcome<ArgumentData>> {
        self.result.borrow().clone()
    }

    pub(crate) async fn wait_result(&self) -> Outcome<ArgumentData> {
        let mut receiver = self.result.subscribe();
        let outcome = match receiver.wait_for(|result| result.is_some()).await {
            Ok(result) => (*result).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Outcome::Err(Error::Internal(format!(
            "call {} lost its result",
            self.id
        ))))
    }

    pub(crate) async fn wait_invalidated(&self) {
        let mut receiver = self.invalidated.subscribe();
        let _ = receiver.wait_for(|invalidated| *invalidated).await;
    }
}

#[derive(Default)]
pub(crate) struct OutboundCallTable {
    calls: DashMap<i64, Arc<CallEntry>>,
}

impl OutboundCallTable {
    pub(crate) fn register(&self, entry: Arc<CallEntry>) {
        self.calls.insert(entry.id(), entry);
    }

    pub(crate) fn get(&self, id: i64) -> Option<Arc<CallEntry>> {
        self.calls.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, id: i64) -> Option<Arc<CallEntry>> {
        self.calls.remove(&id).map(|(_, entry)| entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    fn snapshot(&self) -> Vec<Arc<CallEntry>> {
        self.calls.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Fail every call sent on connection `epoch` or earlier that has no
    /// result yet. Compute calls with a result are left alone.
    pub(crate) fn fail_unanswered(&self, epoch: u64, error: &Error) -> usize {
        let mut failed = 0;
        for entry in self.snapshot() {
            if entry.is_unanswered_on(epoch) && entry.fail(Outcome::Err(error.clone())) {
                self.calls.remove(&entry.id());
                failed += 1;
            }
        }
        failed
    }

    /// Invalidate every compute call holding a result.
    pub(crate) fn invalidate_received(&self, reason: &Error) -> usize {
        let mut invalidated = 0;
        for entry in self.snapshot() {
            if entry.stage() == CallStage::ResultReceived && entry.invalidate(reason.clone()) {
                self.calls.remove(&entry.id());
                invalidated += 1;
            }
        }
        invalidated
    }

    /// Resolve everything: used when the peer stops.
    pub(crate) fn abort_all(&self, error: &Error) -> usize {
        let mut resolved = 0;
        for entry in self.snapshot() {
            let changed = match entry.stage() {
                CallStage::ResultReceived => entry.invalidate(error.clone()),
                _ => entry.fail(Outcome::Err(error.clone())),
            };
            if changed {
                resolved += 1;
            }
            self.calls.remove(&entry.id());
        }
        resolved
    }
}

#[derive(Default)]
pub(crate) struct InboundCallTable {
    calls: DashMap<i64, CancellationToken>,
}

impl InboundCallTable {
    pub(crate) fn register(&self, id: i64, cancel: CancellationToken) {
        if let Some(previous) = self.calls.insert(id, cancel) {
            previous.cancel();
        }
    }

    pub(crate) fn cancel(&self, id: i64) -> bool {
        match self.calls.remove(&id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&self, id: i64) {
        self.calls.remove(&id);
    }

    pub(crate) fn clear(&self) -> usize {
        let ids: Vec<i64> = self.calls.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }
}
