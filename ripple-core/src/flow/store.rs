//! Flow Persistence
//!
//! [`FlowStore`] is the persistence collaborator: it reads and writes
//! [`FlowData`] records with an optimistic version check. [`Flows`] sits on
//! top of it and turns records into live flow values.
//!
//! # Versioning
//!
//! ```text
//! absent ──write(expected=0)──► v1 ──write(expected=1)──► v2 ...
//!                                 └──write(expected=0)──► VersionConflict
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::data::FlowData;
use super::flow::{steps, FlowCore, FlowState};
use super::id::{FlowId, Symbol};
use super::registry::{AnyFlow, FlowRegistry};
use crate::computed::{ComputeContext, ComputedInput, Engine};
use crate::error::{Error, Result};
use crate::outcome::Outcome;
use crate::retry::{retry, Backoff, RetryDelaySeq, RetryPolicy};

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn read(&self, id: &FlowId) -> Result<Option<FlowData>>;

    /// Replace the record of `id` if its stored version is `expected_version`
    /// (zero for "absent"). `None` deletes the record.
    ///
    /// Returns the new version.
    async fn write(&self, id: &FlowId, expected_version: i64, data: Option<FlowData>) -> Result<i64>;
}

#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    records: DashMap<FlowId, FlowData>,
}

impl InMemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn read(&self, id: &FlowId) -> Result<Option<FlowData>> {
        Ok(self.records.get(id).map(|record| record.clone()))
    }

    async fn write(&self, id: &FlowId, expected_version: i64, data: Option<FlowData>) -> Result<i64> {
        match self.records.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let actual = occupied.get().version;
                if actual != expected_version {
                    return Err(Error::VersionConflict {
                        expected: expected_version,
                        actual,
                    });
                }
                let version = actual + 1;
                match data {
                    Some(mut data) => {
                        data.version = version;
                        occupied.insert(data);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                Ok(version)
            }
            Entry::Vacant(vacant) => {
                if expected_version != 0 {
                    return Err(Error::VersionConflict {
                        expected: expected_version,
                        actual: 0,
                    });
                }
                if let Some(mut data) = data {
                    data.version = 1;
                    vacant.insert(data);
                }
                Ok(1)
            }
        }
    }
}

/// A read-only view of a stored flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSnapshot<F> {
    pub version: i64,
    pub step: Symbol,
    pub state: F,
}

pub(crate) struct Started {
    pub core: FlowCore,
    pub flow: Box<dyn AnyFlow>,
    pub created: bool,
}

/// Retries transient errors and lost version races, nothing else.
#[derive(Debug)]
struct GetOrStartRetry<'a>(&'a Backoff);

impl RetryPolicy for GetOrStartRetry<'_> {
    fn next_delay(&self, failed_attempts: u32, error: &Error) -> Option<Duration> {
        let retryable = error.is_transient() || matches!(error, Error::VersionConflict { .. });
        if !retryable || failed_attempts >= self.0.max_attempts {
            return None;
        }
        Some(self.0.delays.delay(failed_attempts.saturating_sub(1)))
    }
}

const GET_METHOD: &str = "flows.get";

/// Loads, creates and saves flows.
///
/// With an engine attached, [`get`](Self::get) results are cached as
/// computed values and invalidated on every save.
pub struct Flows {
    registry: Arc<FlowRegistry>,
    store: Arc<dyn FlowStore>,
    engine: Option<Engine>,
    retry: Backoff,
}

impl Flows {
    pub fn new(registry: Arc<FlowRegistry>, store: Arc<dyn FlowStore>) -> Self {
        Self {
            registry,
            store,
            engine: None,
            retry: Backoff::new(
                3,
                RetryDelaySeq::exp(Duration::from_millis(250), Duration::from_secs(1)),
            ),
        }
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_retry(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    /// The stored state of `id`, if any.
    pub async fn get<F: FlowState>(
        &self,
        context: &ComputeContext,
        id: &FlowId,
        cancel: &CancellationToken,
    ) -> Outcome<Option<FlowSnapshot<F>>> {
        let Some(engine) = &self.engine else {
            return self.read_snapshot::<F>(id).await.into();
        };
        let input = match ComputedInput::new(GET_METHOD, id) {
            Ok(input) => input,
            Err(error) => return Outcome::Err(error),
        };
        engine
            .call(input, context, cancel, |_| self.read_snapshot::<F>(id))
            .await
    }

    async fn read_snapshot<F: FlowState>(&self, id: &FlowId) -> Result<Option<FlowSnapshot<F>>> {
        let Some(data) = self.store.read(id).await? else {
            return Ok(None);
        };
        let state = match &data.data {
            Some(bytes) => rmp_serde::from_slice::<F>(bytes)?,
            None => F::default(),
        };
        Ok(Some(FlowSnapshot {
            version: data.version,
            step: data.step,
            state,
        }))
    }

    /// Load `id`, creating and storing a fresh flow at the `Start` step if
    /// there is no record yet.
    pub(crate) async fn get_or_start(&self, id: &FlowId, cancel: &CancellationToken) -> Outcome<Started> {
        let policy = GetOrStartRetry(&self.retry);
        retry(&policy, cancel, "flows.get_or_start", |_| self.try_get_or_start(id)).await
    }

    async fn try_get_or_start(&self, id: &FlowId) -> Result<Started> {
        let flow_type = self.registry.get(id.name())?;
        if let Some(data) = self.store.read(id).await? {
            let flow = flow_type.deserialize(data.data.as_deref())?;
            return Ok(Started {
                core: FlowCore::new(id.clone(), data.version, data.step),
                flow,
                created: false,
            });
        }

        let flow = flow_type.create();
        let step = Symbol::new(steps::START);
        let data = FlowData::new(step.clone(), Some(flow.serialize()?));
        let version = self.store.write(id, 0, Some(data)).await?;
        debug!(flow = %id, version, "flow created");
        self.invalidate(id);
        Ok(Started {
            core: FlowCore::new(id.clone(), version, step),
            flow,
            created: true,
        })
    }

    /// Persist `flow` at `core.step`, bumping `core.version`.
    pub(crate) async fn save(&self, core: &mut FlowCore, flow: &dyn AnyFlow) -> Result<()> {
        let data = FlowData {
            version: core.version,
            step: core.step.clone(),
            data: Some(flow.serialize()?),
        };
        core.version = self.store.write(&core.id, core.version, Some(data)).await?;
        self.invalidate(&core.id);
        Ok(())
    }

    fn invalidate(&self, id: &FlowId) {
        let Some(engine) = &self.engine else {
            return;
        };
        if let Ok(input) = ComputedInput::new(GET_METHOD, id) {
            engine.invalidate(&input);
        }
    }
}

impl fmt::Debug for Flows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flows")
            .field("registry", &self.registry)
            .field("cached", &self.engine.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::ComputedOptions;
    use crate::flow::flow::Transition;
    use crate::flow::registry::FlowType;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn flows() -> Flows {
        let registry = FlowRegistry::builder()
            .add(FlowType::<Note>::new("note").start(|mut flow, _| async move {
                flow.text = "started".into();
                Ok((flow, Transition::to("Edit")))
            }))
            .build();
        Flows::new(registry, Arc::new(InMemoryFlowStore::new()))
    }

    #[tokio::test]
    async fn store_checks_versions() {
        let store = InMemoryFlowStore::new();
        let id = FlowId::new("note", "a");
        let data = FlowData::new(Symbol::new("Start"), None);

        assert_eq!(store.write(&id, 0, Some(data.clone())).await.unwrap(), 1);
        assert_eq!(store.write(&id, 1, Some(data.clone())).await.unwrap(), 2);
        let conflict = store.write(&id, 1, Some(data)).await.unwrap_err();
        assert!(matches!(conflict, Error::VersionConflict { expected: 1, actual: 2 }));

        assert_eq!(store.read(&id).await.unwrap().unwrap().version, 2);
        store.write(&id, 2, None).await.unwrap();
        assert!(store.read(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_or_start_creates_once() {
        let flows = flows();
        let id = FlowId::new("note", "a");
        let cancel = CancellationToken::new();

        let first = flows.get_or_start(&id, &cancel).await.ok().unwrap();
        assert!(first.created);
        assert_eq!(first.core.version, 1);
        assert_eq!(first.core.step, "Start");

        let second = flows.get_or_start(&id, &cancel).await.ok().unwrap();
        assert!(!second.created);
        assert_eq!(second.core.version, 1);
    }

    #[tokio::test]
    async fn unknown_flow_types_are_not_retried() {
        let flows = flows();
        let outcome = flows
            .get_or_start(&FlowId::new("nope", "a"), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.err(), Some(Error::UnknownFlowType(_))));
    }

    #[tokio::test]
    async fn save_rejects_stale_versions() {
        let flows = flows();
        let id = FlowId::new("note", "a");
        let Started { mut core, flow, .. } = flows
            .get_or_start(&id, &CancellationToken::new())
            .await
            .ok()
            .unwrap();

        let mut stale = core.clone();
        flows.save(&mut core, flow.as_ref()).await.unwrap();
        assert_eq!(core.version, 2);
        let error = flows.save(&mut stale, flow.as_ref()).await.unwrap_err();
        assert!(matches!(error, Error::VersionConflict { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_are_retried() {
        struct Racy {
            inner: InMemoryFlowStore,
            conflicts: AtomicU32,
        }

        #[async_trait]
        impl FlowStore for Racy {
            async fn read(&self, id: &FlowId) -> Result<Option<FlowData>> {
                self.inner.read(id).await
            }

            async fn write(&self, id: &FlowId, expected: i64, data: Option<FlowData>) -> Result<i64> {
                if self.conflicts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::VersionConflict { expected, actual: expected + 1 });
                }
                self.inner.write(id, expected, data).await
            }
        }

        let registry = FlowRegistry::builder().add(FlowType::<Note>::new("note")).build();
        let store = Arc::new(Racy {
            inner: InMemoryFlowStore::new(),
            conflicts: AtomicU32::new(0),
        });
        let flows = Flows::new(registry, store.clone());
        let started = flows
            .get_or_start(&FlowId::new("note", "a"), &CancellationToken::new())
            .await
            .ok()
            .unwrap();
        assert!(started.created);
        assert_eq!(store.conflicts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_reads_are_invalidated_by_saves() {
        let flows = flows().with_engine(Engine::new(ComputedOptions::no_reprocessing()));
        let id = FlowId::new("note", "a");
        let cancel = CancellationToken::new();
        let context = ComputeContext::new();

        let missing = flows.get::<Note>(&context, &id, &cancel).await.ok().unwrap();
        assert!(missing.is_none());

        let Started { mut core, flow, .. } = flows.get_or_start(&id, &cancel).await.ok().unwrap();
        let created = flows.get::<Note>(&context, &id, &cancel).await.ok().unwrap().unwrap();
        assert_eq!(created.version, 1);

        flows.save(&mut core, flow.as_ref()).await.unwrap();
        let saved = flows.get::<Note>(&context, &id, &cancel).await.ok().unwrap().unwrap();
        assert_eq!(saved.version, 2);
    }
}
