//! Flow Worker
//!
//! One worker owns one flow and processes its events strictly one at a time,
//! in the order they were queued.
//!
//! ```text
//!            handle_event
//!                 │
//!                 ▼
//!   ┌──────── Mailbox ────────┐
//!   │  e1  e2  e3 ...          │──► run loop: step ─► save ─► reply
//!   └──────────────────────────┘          │ failure: discard working copy
//!                                         ▼
//!   idle for keep_alive_for ──► close_if_idle ──► exit
//!   host stop ──► close ──► drain for graceful_dispose_delay ──► cancel step
//! ```
//!
//! Every step runs on a working copy of the flow. The copy replaces the
//! committed flow only once it has been saved, so a failing step (or a
//! failing save) leaves the flow exactly as it was.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::flow::{Event, FlowCore, StepContext};
use super::host::HostInner;
use super::registry::AnyFlow;
use super::id::FlowId;
use super::store::{Flows, Started};
use crate::channel::Mailbox;
use crate::error::{Error, Result};
use crate::outcome::Outcome;

/// Upper bound on chained immediate transitions per event.
const MAX_IMMEDIATE_STEPS: usize = 64;

pub(crate) struct QueueEntry {
    event: Option<Event>,
    cancel: CancellationToken,
    result: oneshot::Sender<Outcome<i64>>,
}

impl QueueEntry {
    fn resolve(self, outcome: Outcome<i64>) {
        let _ = self.result.send(outcome);
    }
}

pub struct FlowWorker {
    id: FlowId,
    serial: u64,
    mailbox: Mailbox<QueueEntry>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FlowWorker {
    pub(crate) fn start(host: &Arc<HostInner>, id: FlowId, serial: u64) -> Arc<Self> {
        let worker = Arc::new(Self {
            id,
            serial,
            mailbox: Mailbox::new(),
            stop: host.stop.child_token(),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&worker).run(Arc::clone(host)));
        *worker.task.lock() = Some(task);
        worker
    }

    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether the worker stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub fn queue_len(&self) -> usize {
        self.mailbox.len()
    }

    /// Queue `event`. The returned future resolves with the flow version
    /// after the event is applied, or with `ChannelClosed` if the worker shut
    /// down before processing it.
    pub fn handle_event(
        &self,
        event: Option<Event>,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Outcome<i64>> + Send + 'static {
        let (result, receiver) = oneshot::channel();
        let queued = self
            .mailbox
            .push(QueueEntry {
                event,
                cancel,
                result,
            })
            .is_ok();
        async move {
            if !queued {
                return Outcome::Err(Error::ChannelClosed);
            }
            receiver.await.unwrap_or(Outcome::Err(Error::ChannelClosed))
        }
    }

    /// Begin a graceful stop.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub(crate) fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    async fn run(self: Arc<Self>, host: Arc<HostInner>) {
        let graceful = CancellationToken::new();
        let graceful_stop = {
            let stop = self.stop.clone();
            let graceful = graceful.clone();
            let worker = Arc::downgrade(&self);
            let delay = host.options.graceful_dispose_delay;
            tokio::spawn(async move {
                stop.cancelled().await;
                if let Some(worker) = worker.upgrade() {
                    worker.mailbox.close();
                }
                tokio::time::sleep(delay).await;
                graceful.cancel();
            })
        };

        self.process(&host, &graceful).await;

        graceful_stop.abort();
        host.timeouts.remove(&(self.id.clone(), self.serial));
        let drained = self.mailbox.close_and_drain();
        if !drained.is_empty() {
            debug!(flow = %self.id, count = drained.len(), "dropping queued events");
        }
        for entry in drained {
            entry.resolve(Outcome::Err(Error::ChannelClosed));
        }
        host.workers
            .remove_if(&self.id, |_, worker| Arc::ptr_eq(worker, &self));
        debug!(flow = %self.id, "worker stopped");
    }

    async fn process(self: &Arc<Self>, host: &Arc<HostInner>, graceful: &CancellationToken) {
        let Started {
            mut core,
            mut flow,
            created,
        } = match host.flows.get_or_start(&self.id, graceful).await {
            Outcome::Ok(started) => started,
            Outcome::Err(error) => {
                error!(flow = %self.id, %error, "failed to start flow");
                for entry in self.mailbox.close_and_drain() {
                    entry.resolve(Outcome::Err(error.clone()));
                }
                return;
            }
            Outcome::Cancelled => return,
        };

        if created {
            let outcome = self
                .apply(&host.flows, &mut core, &mut flow, None, graceful)
                .await;
            if outcome.is_cancelled() {
                return;
            }
        }

        loop {
            let entry = match self.mailbox.try_pop() {
                Some(entry) => entry,
                None => {
                    self.arm_keep_alive(host);
                    let popped = tokio::select! {
                        biased;
                        _ = graceful.cancelled() => None,
                        entry = self.mailbox.pop() => entry,
                    };
                    host.timeouts.remove(&(self.id.clone(), self.serial));
                    match popped {
                        Some(entry) => entry,
                        None => break,
                    }
                }
            };

            if entry.cancel.is_cancelled() {
                entry.resolve(Outcome::Cancelled);
                continue;
            }
            let event = entry.event.clone();
            let outcome = self
                .apply(&host.flows, &mut core, &mut flow, event, graceful)
                .await;
            let stopping = outcome.is_cancelled();
            entry.resolve(outcome);
            if stopping {
                break;
            }
        }
    }

    /// Run one event through the flow and persist the result.
    async fn apply(
        &self,
        flows: &Flows,
        core: &mut FlowCore,
        flow: &mut Box<dyn AnyFlow>,
        event: Option<Event>,
        graceful: &CancellationToken,
    ) -> Outcome<i64> {
        let working = (core.clone(), flow.clone_box());
        let result = tokio::select! {
            biased;
            _ = graceful.cancelled() => None,
            result = run_steps(flows, working, event, graceful) => Some(result),
        };
        match result {
            Some(Ok((next_core, next_flow))) => {
                *core = next_core;
                *flow = next_flow;
                Outcome::Ok(core.version)
            }
            Some(Err(error)) => {
                error!(flow = %core.id, step = %core.step, %error, "'{}' @ {} failed", core.id, core.step);
                Outcome::Err(error)
            }
            None => Outcome::Cancelled,
        }
    }

    fn arm_keep_alive(self: &Arc<Self>, host: &HostInner) {
        let worker = Arc::downgrade(self);
        let deadline = Instant::now() + host.options.keep_alive_for;
        host.timeouts
            .add_or_update((self.id.clone(), self.serial), deadline, move || {
                if let Some(worker) = worker.upgrade() {
                    // A no-op once the run loop has taken an entry, even if
                    // the timer is not removed yet.
                    if worker.mailbox.close_if_idle() {
                        debug!(flow = %worker.id, "worker idle, closing");
                    }
                }
            });
    }
}

async fn run_steps(
    flows: &Flows,
    (mut core, mut flow): (FlowCore, Box<dyn AnyFlow>),
    mut event: Option<Event>,
    cancel: &CancellationToken,
) -> Result<(FlowCore, Box<dyn AnyFlow>)> {
    for _ in 0..MAX_IMMEDIATE_STEPS {
        let ctx = StepContext {
            id: core.id.clone(),
            version: core.version,
            step: core.step.clone(),
            cancel: cancel.clone(),
        };
        let step = core.step.clone();
        let (next, transition) = flow.handle(&step, event.take(), ctx).await?;
        flow = next;
        if let Some(step) = transition.step {
            core.step = step;
        }
        if !transition.immediate {
            flows.save(&mut core, flow.as_ref()).await?;
            return Ok((core, flow));
        }
    }
    Err(Error::Internal(format!(
        "flow '{}' made more than {MAX_IMMEDIATE_STEPS} immediate transitions",
        core.id
    )))
}

impl std::fmt::Debug for FlowWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowWorker")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("queued", &self.mailbox.len())
            .field("closed", &self.mailbox.is_closed())
            .finish()
    }
}
