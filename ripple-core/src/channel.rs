//! Channel Utilities
//!
//! - [`Mailbox`]: an unbounded single-reader queue that can be closed while
//!   still holding items. Flow workers use it as their inbox.
//! - [`channel_pair`]: two connected duplex ends, the in-memory stand-in for
//!   a network connection.
//! - [`pump`] and [`transform`]: copy items from one channel to another until
//!   either side closes.
//!
//! # Mailbox Semantics
//!
//! ```text
//!   push ──► [ e1 e2 e3 ] ──► pop (single reader)
//!              │
//!   close ─────┘  further pushes are rejected,
//!                 queued items are still handed out,
//!                 pop returns None once empty
//! ```

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::Result;

struct MailboxState<T> {
    queue: VecDeque<T>,
    closed: bool,
    /// The reader is parked in `pop` with nothing to process.
    idle: bool,
}

pub struct Mailbox<T> {
    state: Mutex<MailboxState<T>>,
    notify: Notify,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                queue: VecDeque::new(),
                closed: false,
                idle: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item, handing it back if the mailbox is closed.
    pub fn push(&self, item: T) -> std::result::Result<(), T> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(item);
            }
            state.queue.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().queue.pop_front()
    }

    /// Dequeue, waiting for an item. Returns `None` once closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.idle = false;
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
                state.idle = true;
            }
            // notify_one stores a permit when nobody waits, so a push landing
            // between the check above and this await is not lost.
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    /// Close only if nothing is queued and the reader is parked in
    /// [`pop`](Self::pop). An item the reader already took counts as work, so
    /// this never closes under a reader that is about to process something.
    /// Returns whether the mailbox closed.
    pub fn close_if_idle(&self) -> bool {
        let closed = {
            let mut state = self.state.lock();
            if state.idle && state.queue.is_empty() {
                state.closed = true;
            }
            state.closed
        };
        if closed {
            self.notify.notify_one();
        }
        closed
    }

    /// Close and take everything still queued.
    pub fn close_and_drain(&self) -> Vec<T> {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.queue.drain(..).collect()
        };
        self.notify.notify_one();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// One end of a duplex channel.
pub struct ChannelEnd<T> {
    pub tx: mpsc::UnboundedSender<T>,
    pub rx: mpsc::UnboundedReceiver<T>,
}

/// Two ends where whatever one sends, the other receives.
pub fn channel_pair<T>() -> (ChannelEnd<T>, ChannelEnd<T>) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        ChannelEnd { tx: a_tx, rx: a_rx },
        ChannelEnd { tx: b_tx, rx: b_rx },
    )
}

/// Copy items from `rx` to `tx` until either side closes.
///
/// Returns the number of items copied.
pub async fn pump<T>(mut rx: mpsc::UnboundedReceiver<T>, tx: mpsc::UnboundedSender<T>) -> usize {
    let mut copied = 0;
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    if tx.send(item).is_err() {
                        break;
                    }
                    copied += 1;
                }
                None => break,
            },
            _ = tx.closed() => break,
        }
    }
    copied
}

/// Like [`pump`], mapping each item through `f`. Stops at the first error.
pub async fn transform<A, B, F>(
    mut rx: mpsc::UnboundedReceiver<A>,
    tx: mpsc::UnboundedSender<B>,
    mut f: F,
) -> Result<usize>
where
    F: FnMut(A) -> Result<B>,
{
    let mut copied = 0;
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    if tx.send(f(item)?).is_err() {
                        break;
                    }
                    copied += 1;
                }
                None => break,
            },
            _ = tx.closed() => break,
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn mailbox_preserves_order_and_drains_after_close() {
        let mailbox = Mailbox::new();
        for i in 0..3 {
            mailbox.push(i).expect("mailbox is open");
        }
        mailbox.close();
        assert_eq!(mailbox.push(99), Err(99));

        assert_eq!(mailbox.pop().await, Some(0));
        assert_eq!(mailbox.pop().await, Some(1));
        assert_eq!(mailbox.pop().await, Some(2));
        assert_eq!(mailbox.pop().await, None);
    }

    #[tokio::test]
    async fn mailbox_wakes_waiting_reader() {
        let mailbox = Arc::new(Mailbox::new());
        let reader = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.push("hello").expect("mailbox is open");
        assert_eq!(reader.await.expect("reader task"), Some("hello"));
    }

    #[tokio::test]
    async fn close_if_idle_refuses_when_items_are_queued() {
        let mailbox = Arc::new(Mailbox::new());
        let reader = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.push(1).expect("mailbox is open");
        assert_eq!(reader.await.expect("reader task"), Some(1));
        mailbox.push(2).expect("mailbox is open");
        assert!(!mailbox.close_if_idle());
        assert_eq!(mailbox.close_and_drain(), vec![2]);
        assert!(mailbox.is_closed());
        assert!(mailbox.close_if_idle());
    }

    #[tokio::test]
    async fn close_if_idle_spares_a_reader_holding_an_item() {
        let mailbox = Mailbox::new();
        mailbox.push(1).expect("mailbox is open");
        // Taken by pop, so the queue is empty but the reader is busy.
        assert_eq!(mailbox.pop().await, Some(1));
        assert!(!mailbox.close_if_idle());
        assert!(!mailbox.is_closed());
        assert_eq!(mailbox.push(2), Ok(()));
    }

    #[tokio::test]
    async fn close_if_idle_closes_a_parked_reader() {
        let mailbox = Arc::new(Mailbox::<u32>::new());
        let reader = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(mailbox.close_if_idle());
        assert_eq!(reader.await.expect("reader task"), None);
    }

    #[tokio::test]
    async fn channel_pair_is_crossed() {
        let (mut a, mut b) = channel_pair();
        a.tx.send(1).expect("b is alive");
        b.tx.send(2).expect("a is alive");
        assert_eq!(b.rx.recv().await, Some(1));
        assert_eq!(a.rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn transform_stops_on_first_error() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        for i in [1, 2, -1, 3] {
            in_tx.send(i).expect("receiver alive");
        }
        drop(in_tx);

        let result = transform(in_rx, out_tx, |v: i32| {
            if v < 0 {
                Err(Error::Codec("negative".into()))
            } else {
                Ok(v * 10)
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(out_rx.recv().await, Some(10));
        assert_eq!(out_rx.recv().await, Some(20));
        assert_eq!(out_rx.recv().await, None);
    }

    #[tokio::test]
    async fn pump_copies_until_source_closes() {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        in_tx.send("a").expect("receiver alive");
        in_tx.send("b").expect("receiver alive");
        drop(in_tx);
        assert_eq!(pump(in_rx, out_tx).await, 2);
        assert_eq!(out_rx.recv().await, Some("a"));
        assert_eq!(out_rx.recv().await, Some("b"));
    }
}
