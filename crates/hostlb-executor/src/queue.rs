//! Ordering between conflicting actions.
//!
//! Two actions conflict when they share a key: the guest, or a node when
//! the provider cannot run parallel migrations on one node. Every action
//! takes a [`Ticket`] from the [`ConflictQueue`] in plan order. A ticket is
//! ready once every earlier ticket sharing one of its keys has been
//! dropped, so actions with no common key never wait on each other.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::watch;

/// Hands out tickets, remembering the latest holder of each key.
#[derive(Default)]
pub struct ConflictQueue {
    tails: BTreeMap<String, watch::Receiver<()>>,
}

impl ConflictQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next action behind the last ticket issued for each key.
    pub fn enqueue<I, S>(&mut self, keys: I) -> Ticket
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (done, released) = watch::channel(());
        let keys: BTreeSet<String> = keys.into_iter().map(Into::into).collect();
        let mut after = Vec::new();
        for key in keys {
            if let Some(previous) = self.tails.insert(key, released.clone()) {
                after.push(previous);
            }
        }
        Ticket { after, _done: done }
    }
}

/// A place in the queue. Dropping it releases the tickets behind it,
/// including when the owning task is aborted.
pub struct Ticket {
    after: Vec<watch::Receiver<()>>,
    _done: watch::Sender<()>,
}

impl Ticket {
    /// Earlier tickets this one still has to wait for.
    pub fn pending(&self) -> usize {
        self.after.len()
    }

    /// Resolve once every earlier conflicting ticket is gone.
    pub async fn ready(&mut self) {
        for mut earlier in self.after.drain(..) {
            // Nothing is ever sent, so this only returns once the sender drops.
            while earlier.changed().await.is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn unrelated_tickets_are_ready_immediately() {
        let mut queue = ConflictQueue::new();
        let _first = queue.enqueue(["node:a", "node:b"]);
        let mut second = queue.enqueue(["node:c", "node:d"]);

        assert_eq!(second.pending(), 0);
        tokio::time::timeout(Duration::from_millis(1), second.ready())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shared_key_waits_for_release() {
        let mut queue = ConflictQueue::new();
        let first = queue.enqueue(["node:a", "node:b"]);
        let mut second = queue.enqueue(["node:b", "node:c"]);
        assert_eq!(second.pending(), 1);

        let waiter = tokio::spawn(async move { second.ready().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn tickets_on_one_key_keep_queue_order() {
        let mut queue = ConflictQueue::new();
        let first = queue.enqueue(["guest:1"]);
        let second = queue.enqueue(["guest:1"]);
        let mut third = queue.enqueue(["guest:1"]);

        drop(first);
        let waiter = tokio::spawn(async move { third.ready().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished(), "third must wait for second");

        drop(second);
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_holder_releases_its_ticket() {
        let mut queue = ConflictQueue::new();
        let first = queue.enqueue(["node:a"]);
        let mut second = queue.enqueue(["node:a"]);

        let holder = tokio::spawn(async move {
            let _ticket = first;
            std::future::pending::<()>().await;
        });
        holder.abort();
        let _ = holder.await;

        tokio::time::timeout(Duration::from_millis(1), second.ready())
            .await
            .unwrap();
    }
}
