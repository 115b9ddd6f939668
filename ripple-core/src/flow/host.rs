//! Flow Host
//!
//! Keeps at most one live [`FlowWorker`] per flow id and routes events to
//! it. A worker that closed (idle timeout, failed start) is replaced on the
//! next event; an event refused by a closing worker is re-sent to its
//! replacement, so callers never see the shutdown race.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::flow::{Event, FlowState};
use super::id::FlowId;
use super::store::{FlowSnapshot, Flows};
use super::worker::FlowWorker;
use crate::computed::ComputeContext;
use crate::error::Error;
use crate::outcome::Outcome;
use crate::retry::{Backoff, RetryDelaySeq};
use crate::timeouts::TimeoutSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowOptions {
    /// Idle time after which a worker shuts down.
    pub keep_alive_for: Duration,
    /// How long a stopping worker keeps processing queued events.
    pub graceful_dispose_delay: Duration,
    /// Applied when loading or creating a flow races with another writer.
    pub get_or_start_retry: Backoff,
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            keep_alive_for: Duration::from_secs(10),
            graceful_dispose_delay: Duration::from_secs(5),
            get_or_start_retry: Backoff::new(
                3,
                RetryDelaySeq::exp(Duration::from_millis(250), Duration::from_secs(1)),
            ),
        }
    }
}

pub(crate) struct HostInner {
    pub flows: Flows,
    pub options: FlowOptions,
    pub workers: DashMap<FlowId, Arc<FlowWorker>>,
    pub timeouts: TimeoutSet<(FlowId, u64)>,
    pub stop: CancellationToken,
    next_serial: AtomicU64,
}

#[derive(Clone)]
pub struct FlowHost {
    inner: Arc<HostInner>,
}

impl FlowHost {
    pub fn new(flows: Flows, options: FlowOptions) -> Self {
        let flows = flows.with_retry(options.get_or_start_retry.clone());
        Self {
            inner: Arc::new(HostInner {
                flows,
                options,
                workers: DashMap::new(),
                timeouts: TimeoutSet::new(),
                stop: CancellationToken::new(),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    pub fn flows(&self) -> &Flows {
        &self.inner.flows
    }

    pub fn options(&self) -> &FlowOptions {
        &self.inner.options
    }

    /// Deliver `event` to the flow `id` and wait until it is applied.
    ///
    /// Resolves with the flow version after the step was saved, with the
    /// step's error, or with `Cancelled` if `cancel` fires first.
    pub async fn handle_event(
        &self,
        id: &FlowId,
        event: Option<Event>,
        cancel: &CancellationToken,
    ) -> Outcome<i64> {
        if !self.inner.flows.registry().contains(id.name().as_str()) {
            return Outcome::Err(Error::UnknownFlowType(id.name().to_string()));
        }
        loop {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            if self.inner.stop.is_cancelled() {
                return Outcome::Err(Error::ChannelClosed);
            }
            let worker = self.get_or_create(id);
            let handled = worker.handle_event(event.clone(), cancel.clone());
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                outcome = handled => outcome,
            };
            match outcome {
                Outcome::Err(Error::ChannelClosed) => {
                    debug!(flow = %id, "worker closed, re-sending event");
                    tokio::task::yield_now().await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Send a typed event.
    pub async fn notify<E>(&self, id: &FlowId, event: E, cancel: &CancellationToken) -> Outcome<i64>
    where
        E: Any + Send + Sync,
    {
        self.handle_event(id, Some(Arc::new(event)), cancel).await
    }

    /// Read the stored state of a flow.
    pub async fn get<F: FlowState>(
        &self,
        context: &ComputeContext,
        id: &FlowId,
        cancel: &CancellationToken,
    ) -> Outcome<Option<FlowSnapshot<F>>> {
        self.inner.flows.get::<F>(context, id, cancel).await
    }

    fn get_or_create(&self, id: &FlowId) -> Arc<FlowWorker> {
        let mut entry = self
            .inner
            .workers
            .entry(id.clone())
            .or_insert_with(|| self.spawn_worker(id));
        if entry.is_closed() {
            *entry = self.spawn_worker(id);
        }
        Arc::clone(&entry)
    }

    fn spawn_worker(&self, id: &FlowId) -> Arc<FlowWorker> {
        let serial = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
        debug!(flow = %id, serial, "starting worker");
        FlowWorker::start(&self.inner, id.clone(), serial)
    }

    pub fn worker(&self, id: &FlowId) -> Option<Arc<FlowWorker>> {
        self.inner.workers.get(id).map(|entry| Arc::clone(&entry))
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    /// Stop every worker, letting each finish its queue within the graceful
    /// dispose delay.
    pub async fn stop(&self) {
        info!(workers = self.inner.workers.len(), "stopping flow host");
        self.inner.stop.cancel();
        let workers: Vec<Arc<FlowWorker>> = self
            .inner
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for worker in workers {
            if let Some(task) = worker.take_task() {
                let _ = task.await;
            }
        }
    }
}

impl std::fmt::Debug for FlowHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHost")
            .field("workers", &self.inner.workers.len())
            .field("stopped", &self.inner.stop.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::flow::{steps, Transition};
    use crate::flow::registry::{FlowRegistry, FlowType};
    use crate::flow::store::InMemoryFlowStore;
    use std::time::Duration;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        started: bool,
        items: Vec<u32>,
    }

    struct Push(u32);
    struct Fail;
    struct Slow(Duration);

    fn host(options: FlowOptions) -> FlowHost {
        let tally = FlowType::<Tally>::new("tally")
            .start(|mut flow, _| async move {
                flow.started = true;
                Ok((flow, Transition::to("Collect")))
            })
            .on_any("Collect", |mut flow, event, _| async move {
                let Some(event) = event else {
                    return Ok((flow, Transition::stay()));
                };
                if let Some(push) = event.downcast_ref::<Push>() {
                    flow.items.push(push.0);
                    return Ok((flow, Transition::stay()));
                }
                if event.is::<Fail>() {
                    flow.items.push(u32::MAX);
                    return Err(Error::message("fail requested"));
                }
                if let Some(slow) = event.downcast_ref::<Slow>() {
                    tokio::time::sleep(slow.0).await;
                }
                Ok((flow, Transition::stay()))
            });
        let registry = FlowRegistry::builder().add(tally).build();
        FlowHost::new(Flows::new(registry, Arc::new(InMemoryFlowStore::new())), options)
    }

    async fn state(host: &FlowHost, id: &FlowId) -> Tally {
        host.get::<Tally>(&ComputeContext::new(), id, &CancellationToken::new())
            .await
            .ok()
            .flatten()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn first_event_starts_the_flow() {
        let host = host(FlowOptions::default());
        let id = FlowId::new("tally", "a");
        let cancel = CancellationToken::new();

        let version = host.notify(&id, Push(1), &cancel).await.ok().unwrap();
        // v1 created, v2 after Start, v3 after Push
        assert_eq!(version, 3);
        let tally = state(&host, &id).await;
        assert!(tally.started);
        assert_eq!(tally.items, vec![1]);
        host.stop().await;
    }

    #[tokio::test]
    async fn failed_step_is_rolled_back() {
        let host = host(FlowOptions::default());
        let id = FlowId::new("tally", "a");
        let cancel = CancellationToken::new();

        let before = host.notify(&id, Push(1), &cancel).await.ok().unwrap();
        let failed = host.notify(&id, Fail, &cancel).await;
        assert!(matches!(failed.err(), Some(Error::Business(_))));
        let after = host.notify(&id, Push(2), &cancel).await.ok().unwrap();

        assert_eq!(after, before + 1);
        assert_eq!(state(&host, &id).await.items, vec![1, 2]);
        host.stop().await;
    }

    #[tokio::test]
    async fn unknown_flow_types_fail_every_queued_event() {
        let host = host(FlowOptions::default());
        let id = FlowId::new("other", "a");
        let outcome = host.notify(&id, Push(1), &CancellationToken::new()).await;
        assert!(matches!(outcome.err(), Some(Error::UnknownFlowType(_))));
        host.stop().await;
    }

    #[tokio::test]
    async fn cancelled_events_are_skipped() {
        let host = host(FlowOptions::default());
        let id = FlowId::new("tally", "a");
        let cancel = CancellationToken::new();
        host.notify(&id, Push(1), &cancel).await.ok().unwrap();

        let worker = host.worker(&id).unwrap();
        let slow = worker.handle_event(Some(Arc::new(Slow(Duration::from_millis(50)))), cancel.clone());
        let skipped_token = CancellationToken::new();
        let skipped = worker.handle_event(Some(Arc::new(Push(99))), skipped_token.clone());
        skipped_token.cancel();

        assert!(slow.await.is_ok());
        assert!(skipped.await.is_cancelled());
        assert_eq!(state(&host, &id).await.items, vec![1]);
        host.stop().await;
    }

    #[tokio::test]
    async fn failing_transition_runs_the_error_step_and_saves() {
        struct Broken;
        let tally = FlowType::<Tally>::new("tally")
            .step::<Broken, _, _>(steps::START, |mut flow, _, _| async move {
                flow.started = true;
                Ok((flow, Transition::to("Collect")))
            })
            .step::<Broken, _, _>("Collect", |mut flow, _, _| async move {
                flow.items.push(1);
                Ok((flow, Transition::fail()))
            })
            .on_error(|mut flow, _| async move {
                flow.items.push(u32::MAX);
                Ok((flow, Transition::to("Collect")))
            });
        let registry = FlowRegistry::builder().add(tally).build();
        let host = FlowHost::new(
            Flows::new(registry, Arc::new(InMemoryFlowStore::new())),
            FlowOptions::default(),
        );
        let id = FlowId::new("tally", "broken");

        let version = host.notify(&id, Broken, &CancellationToken::new()).await.ok().unwrap();
        let snapshot = host
            .get::<Tally>(&ComputeContext::new(), &id, &CancellationToken::new())
            .await
            .ok()
            .flatten()
            .unwrap();
        assert_eq!(snapshot.version, version);
        assert_eq!(snapshot.step.as_str(), "Collect");
        assert_eq!(snapshot.state.items, vec![1, u32::MAX]);
        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_close_and_are_replaced() {
        let options = FlowOptions {
            keep_alive_for: Duration::from_secs(1),
            ..FlowOptions::default()
        };
        let host = host(options);
        let id = FlowId::new("tally", "a");
        let cancel = CancellationToken::new();

        host.notify(&id, Push(1), &cancel).await.ok().unwrap();
        let first = host.worker(&id).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(first.is_closed());
        assert_eq!(host.worker_count(), 0);

        host.notify(&id, Push(2), &cancel).await.ok().unwrap();
        let second = host.worker(&id).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(state(&host, &id).await.items, vec![1, 2]);
        host.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_closes_racing_new_events_keep_one_worker_per_flow() {
        let options = FlowOptions {
            keep_alive_for: Duration::from_millis(1),
            ..FlowOptions::default()
        };
        let host = host(options);
        let id = FlowId::new("tally", "racy");

        // Two senders, each pausing now and then so the worker keeps going idle.
        let senders = [0u32, 1000].map(|base| {
            let host = host.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                let mut serials = Vec::new();
                for n in base..base + 100 {
                    // A second live worker would fail its save with a version conflict.
                    host.notify(&id, Push(n), &cancel).await.ok().unwrap();
                    if let Some(worker) = host.worker(&id) {
                        serials.push(worker.serial());
                    }
                    if n % 4 == 0 {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                }
                serials
            })
        });
        for sender in senders {
            let serials = sender.await.unwrap();
            assert!(serials.windows(2).all(|pair| pair[0] <= pair[1]));
        }

        let items = state(&host, &id).await.items;
        assert_eq!(items.len(), 200);
        for base in [0u32, 1000] {
            let own: Vec<u32> = items.iter().copied().filter(|n| (base..base + 100).contains(n)).collect();
            assert_eq!(own, (base..base + 100).collect::<Vec<_>>());
        }
        host.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_then_cancels_long_steps() {
        let options = FlowOptions {
            graceful_dispose_delay: Duration::from_secs(1),
            ..FlowOptions::default()
        };
        let host = host(options);
        let id = FlowId::new("tally", "a");
        let cancel = CancellationToken::new();
        host.notify(&id, Push(1), &cancel).await.ok().unwrap();

        let worker = host.worker(&id).unwrap();
        let quick = worker.handle_event(Some(Arc::new(Push(2))), cancel.clone());
        let stuck = worker.handle_event(Some(Arc::new(Slow(Duration::from_secs(60)))), cancel.clone());
        let late = worker.handle_event(Some(Arc::new(Push(3))), cancel.clone());
        host.stop().await;

        assert!(quick.await.is_ok());
        assert!(stuck.await.is_cancelled());
        assert!(matches!(late.await.err(), Some(Error::ChannelClosed)));
        assert!(host.notify(&id, Push(4), &cancel).await.is_err());
    }
}
