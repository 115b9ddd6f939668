//! Sharded Key-Value Store
//!
//! An in-memory string store whose reads are computed values: a read made
//! from inside a compute function is invalidated when a write touches the
//! key it read.
//!
//! # Keys and Invalidation
//!
//! Keys are `/`-delimited paths. Every read depends on a *touch* node for
//! the key or prefix it looked at, and every write invalidates the touch
//! nodes of the written key and all of its ancestors:
//!
//! ```text
//! set "app/user/42"  ──► invalidates touch(""), touch("app"),
//!                        touch("app/user"), touch("app/user/42")
//! count("app/user")  ──► depends on touch("app/user")   (invalidated)
//! get("app/user/7")  ──► depends on touch("app/user/7") (untouched)
//! ```
//!
//! # Command Modes
//!
//! Commands run in two passes. [`CommandMode::Execute`] mutates storage;
//! [`CommandMode::InvalidationReplay`] leaves storage alone and only
//! invalidates the affected reads. [`KeyValueStore::run`] does both.
//!
//! # Expiry
//!
//! Entries may carry an absolute expiry time. Expired entries read as
//! missing but stay in storage until [`KeyValueStore::trim_expired`] removes
//! them.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::computed::{ComputeContext, ComputedInput, Engine};
use crate::error::{Error, Result};
use crate::outcome::{Cancelled, Outcome};

pub const KEY_DELIMITER: char = '/';

const TOUCH: &str = "kv.touch";
const GET: &str = "kv.get";
const COUNT: &str = "kv.count";
const LIST: &str = "kv.list_key_suffixes";

/// A named storage partition. The default shard has an empty name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Shard(String);

impl Shard {
    pub fn new(name: impl Into<String>) -> Self {
        Shard(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvItem {
    pub key: String,
    pub value: String,
    pub expires_at: Option<SystemTime>,
}

impl KvItem {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetCommand {
    pub shard: Shard,
    pub items: Vec<KvItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveCommand {
    pub shard: Shard,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set(SetCommand),
    Remove(RemoveCommand),
}

impl From<SetCommand> for KvCommand {
    fn from(command: SetCommand) -> Self {
        KvCommand::Set(command)
    }
}

impl From<RemoveCommand> for KvCommand {
    fn from(command: RemoveCommand) -> Self {
        KvCommand::Remove(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Execute,
    InvalidationReplay,
}

/// One page of a listing: at most `count` keys ordered after the full key
/// `after`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRef {
    pub count: usize,
    pub after: Option<String>,
}

impl PageRef {
    pub fn first(count: usize) -> Self {
        Self { count, after: None }
    }

    pub fn after(count: usize, key: impl Into<String>) -> Self {
        Self {
            count,
            after: Some(key.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueStoreOptions {
    /// Interval of the background expiry sweep.
    pub cleanup_period: Duration,
}

impl Default for KeyValueStoreOptions {
    fn default() -> Self {
        Self {
            cleanup_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<SystemTime>,
}

impl KvEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

struct KvInner {
    engine: Engine,
    clock: Arc<dyn Clock>,
    options: KeyValueStoreOptions,
    entries: DashMap<(Shard, String), KvEntry>,
}

#[derive(Clone)]
pub struct KeyValueStore {
    inner: Arc<KvInner>,
}

impl KeyValueStore {
    pub fn new(engine: Engine, options: KeyValueStoreOptions) -> Self {
        Self::with_clock(engine, options, Arc::new(SystemClock))
    }

    pub fn with_clock(engine: Engine, options: KeyValueStoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(KvInner {
                engine,
                clock,
                options,
                entries: DashMap::new(),
            }),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn options(&self) -> &KeyValueStoreOptions {
        &self.inner.options
    }

    /// Execute `command`, then invalidate the reads it affects.
    pub fn run(&self, command: &KvCommand) {
        for mode in [CommandMode::Execute, CommandMode::InvalidationReplay] {
            match command {
                KvCommand::Set(command) => self.set(command, mode),
                KvCommand::Remove(command) => self.remove(command, mode),
            }
        }
    }

    pub fn set(&self, command: &SetCommand, mode: CommandMode) {
        match mode {
            CommandMode::Execute => {
                for item in &command.items {
                    self.inner.entries.insert(
                        (command.shard.clone(), item.key.clone()),
                        KvEntry {
                            value: item.value.clone(),
                            expires_at: item.expires_at,
                        },
                    );
                }
                trace!(shard = %command.shard, count = command.items.len(), "kv set");
            }
            CommandMode::InvalidationReplay => {
                for item in &command.items {
                    self.invalidate_key(&command.shard, &item.key);
                }
            }
        }
    }

    pub fn remove(&self, command: &RemoveCommand, mode: CommandMode) {
        match mode {
            CommandMode::Execute => {
                for key in &command.keys {
                    self.inner.entries.remove(&(command.shard.clone(), key.clone()));
                }
                trace!(shard = %command.shard, count = command.keys.len(), "kv remove");
            }
            CommandMode::InvalidationReplay => {
                for key in &command.keys {
                    self.invalidate_key(&command.shard, key);
                }
            }
        }
    }

    /// The value stored under `key`, unless it is missing or expired.
    pub async fn get(
        &self,
        context: &ComputeContext,
        shard: &Shard,
        key: &str,
        cancel: &CancellationToken,
    ) -> Outcome<Option<String>> {
        let input = match ComputedInput::new(GET, &(shard, key)) {
            Ok(input) => input,
            Err(error) => return Outcome::Err(error),
        };
        self.inner
            .engine
            .call(input, context, cancel, |reading| async move {
                self.touch(&reading, shard, key, cancel).await?;
                let now = self.inner.clock.now();
                Ok(self
                    .inner
                    .entries
                    .get(&(shard.clone(), key.to_string()))
                    .filter(|entry| !entry.is_expired(now))
                    .map(|entry| entry.value.clone()))
            })
            .await
    }

    /// Number of keys in `shard` starting with `prefix`, expired ones
    /// included until trimmed.
    pub async fn count(
        &self,
        context: &ComputeContext,
        shard: &Shard,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Outcome<usize> {
        let input = match ComputedInput::new(COUNT, &(shard, prefix)) {
            Ok(input) => input,
            Err(error) => return Outcome::Err(error),
        };
        self.inner
            .engine
            .call(input, context, cancel, |reading| async move {
                self.touch(&reading, shard, prefix, cancel).await?;
                Ok(self.matching_keys(shard, prefix).len())
            })
            .await
    }

    /// Suffixes (after `prefix`) of the keys starting with `prefix`, one page
    /// at a time.
    pub async fn list_key_suffixes(
        &self,
        context: &ComputeContext,
        shard: &Shard,
        prefix: &str,
        page: &PageRef,
        direction: SortDirection,
        cancel: &CancellationToken,
    ) -> Outcome<Vec<String>> {
        let input = match ComputedInput::new(LIST, &(shard, prefix, page, direction)) {
            Ok(input) => input,
            Err(error) => return Outcome::Err(error),
        };
        self.inner
            .engine
            .call(input, context, cancel, |reading| async move {
                self.touch(&reading, shard, prefix, cancel).await?;
                let mut keys = self.matching_keys(shard, prefix);
                match direction {
                    SortDirection::Ascending => keys.sort(),
                    SortDirection::Descending => keys.sort_by(|a, b| b.cmp(a)),
                }
                let wanted = match direction {
                    SortDirection::Ascending => Ordering::Greater,
                    SortDirection::Descending => Ordering::Less,
                };
                Ok(keys
                    .into_iter()
                    .filter(|key| {
                        page.after
                            .as_deref()
                            .map_or(true, |after| key.as_str().cmp(after) == wanted)
                    })
                    .take(page.count)
                    .map(|key| key[prefix.len()..].to_string())
                    .collect())
            })
            .await
    }

    /// Remove expired entries and invalidate their readers.
    pub fn trim_expired(&self) -> usize {
        let now = self.inner.clock.now();
        let expired: Vec<(Shard, String)> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for key in expired {
            let taken = self
                .inner
                .entries
                .remove_if(&key, |_, entry| entry.is_expired(now));
            if taken.is_some() {
                self.invalidate_key(&key.0, &key.1);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "trimmed expired entries");
        }
        removed
    }

    /// Run [`trim_expired`](Self::trim_expired) every `cleanup_period` until
    /// `cancel` fires.
    pub fn spawn_trimmer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        let period = self.inner.options.cleanup_period;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                store.trim_expired();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn matching_keys(&self, shard: &Shard, prefix: &str) -> Vec<String> {
        self.inner
            .entries
            .iter()
            .filter(|entry| &entry.key().0 == shard && entry.key().1.starts_with(prefix))
            .map(|entry| entry.key().1.clone())
            .collect()
    }

    async fn touch(
        &self,
        context: &ComputeContext,
        shard: &Shard,
        key_part: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key_part = key_part.trim_end_matches(KEY_DELIMITER);
        let input = ComputedInput::new(TOUCH, &(shard, key_part))?;
        match self
            .inner
            .engine
            .get_or_produce(input, context, cancel, |_| async { Ok(()) })
            .await
        {
            Ok(_) => Ok(()),
            Err(Cancelled) => Err(Error::Internal("read cancelled".to_string())),
        }
    }

    fn invalidate_key(&self, shard: &Shard, key: &str) {
        for key_part in key_parts(key) {
            if let Ok(input) = ComputedInput::new(TOUCH, &(shard, key_part)) {
                self.inner.engine.invalidate(&input);
            }
        }
    }
}

impl fmt::Debug for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("entries", &self.inner.entries.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

/// The root, every ancestor prefix of `key`, then `key` itself.
fn key_parts(key: &str) -> impl Iterator<Item = &str> {
    std::iter::once("")
        .chain(key.match_indices(KEY_DELIMITER).map(move |(index, _)| &key[..index]))
        .chain(std::iter::once(key))
}
