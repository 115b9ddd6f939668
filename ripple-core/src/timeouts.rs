//! Keyed timeouts.
//!
//! A [`TimeoutSet`] fires a callback once per key when its deadline passes,
//! unless the key is removed or rescheduled first. It backs computed
//! auto-invalidation and flow worker keep-alive.
//!
//! # How Scheduling Works
//!
//! Each entry owns a sleeping tokio task tagged with a generation number.
//! When the task wakes it removes the entry only if the generation still
//! matches, so a rescheduled or removed key never fires its stale callback.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

struct TimeoutEntry {
    deadline: Instant,
    generation: u64,
    task: AbortHandle,
}

pub struct TimeoutSet<K: Eq + Hash> {
    entries: Arc<DashMap<K, TimeoutEntry>>,
    next_generation: AtomicU64,
}

impl<K> Default for TimeoutSet<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimeoutSet<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Schedule `on_timeout` for `key`, replacing any pending timeout.
    ///
    /// Returns `false` when there is no tokio runtime to run the timer on.
    pub fn add_or_update<F>(&self, key: K, deadline: Instant, on_timeout: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(key, deadline, on_timeout, false)
    }

    /// Like [`add_or_update`](Self::add_or_update), but never moves an
    /// existing deadline earlier.
    pub fn add_or_update_to_later<F>(&self, key: K, deadline: Instant, on_timeout: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(key, deadline, on_timeout, true)
    }

    pub fn remove(&self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule<F>(&self, key: K, deadline: Instant, on_timeout: F, to_later: bool) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            debug!("no tokio runtime, timeout is not scheduled");
            return false;
        };
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        // The shard stays locked until the entry is in place, so the timer
        // task can't observe the map before its own entry exists.
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if to_later && occupied.get().deadline >= deadline {
                    return true;
                }
                let task = self.spawn_timer(&runtime, key, deadline, generation, on_timeout);
                let previous = occupied.insert(TimeoutEntry {
                    deadline,
                    generation,
                    task,
                });
                previous.task.abort();
            }
            Entry::Vacant(vacant) => {
                let task = self.spawn_timer(&runtime, key, deadline, generation, on_timeout);
                vacant.insert(TimeoutEntry {
                    deadline,
                    generation,
                    task,
                });
            }
        }
        true
    }

    fn spawn_timer<F>(
        &self,
        runtime: &Handle,
        key: K,
        deadline: Instant,
        generation: u64,
        on_timeout: F,
    ) -> AbortHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let entries = Arc::clone(&self.entries);
        runtime
            .spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let fired = entries
                    .remove_if(&key, |_, entry| entry.generation == generation)
                    .is_some();
                if fired {
                    on_timeout();
                }
            })
            .abort_handle()
    }
}

impl<K: Eq + Hash> Drop for TimeoutSet<K> {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            entry.value().task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_deadline() {
        let timeouts = TimeoutSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timeouts.add_or_update("a", Instant::now() + Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timeouts.contains(&"a"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timeouts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_key_never_fires() {
        let timeouts = TimeoutSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timeouts.add_or_update(1, Instant::now() + Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timeouts.remove(&1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn to_later_keeps_the_later_deadline() {
        let timeouts = TimeoutSet::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timeouts.add_or_update("k", Instant::now() + Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = fired.clone();
        timeouts.add_or_update_to_later("k", Instant::now() + Duration::from_secs(1), move || {
            counter.fetch_add(10, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
