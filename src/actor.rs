//! A dedicated thread that owns a [`Database`] and runs all of its
//! operations sequentially.
//!
//! Every mutation and query becomes an action pushed onto a bounded
//! queue; the worker thread drains it one action at a time, so rebuilds,
//! merges and loads never interleave. [`DbHandle`] is the cheaply cloneable
//! async interface to the queue.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, error, error_span, trace, warn};

use crate::db::Database;
use crate::entry::{Head, SignedHead};
use crate::hash::Hash;
use crate::net::Gossip;
use crate::pollard::Comparison;
use crate::store::BlockStore;

const ACTION_CAP: usize = 1024;

#[derive(derive_more::Debug, strum::Display)]
enum Action {
    Set {
        key: String,
        value: Bytes,
        #[debug("reply")]
        reply: oneshot::Sender<Result<u64>>,
    },
    Get {
        key: String,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<Bytes>>>,
    },
    Entries {
        #[debug("reply")]
        reply: flume::Sender<(String, Bytes)>,
    },
    Stats {
        #[debug("reply")]
        reply: oneshot::Sender<Result<Stats>>,
    },
    CreateHead {
        #[debug("reply")]
        reply: oneshot::Sender<Result<SignedHead>>,
    },
    Compare {
        head: Head,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Comparison>>,
    },
    Merge {
        head: Head,
        #[debug("reply")]
        reply: oneshot::Sender<Result<usize>>,
    },
    Load {
        head: SignedHead,
        #[debug("reply")]
        reply: oneshot::Sender<Result<()>>,
    },
    Rebuild,
    PublishHead {
        #[debug("reply")]
        reply: Option<oneshot::Sender<Result<bool>>>,
    },
    RemoteAnnouncement {
        data: Bytes,
    },
    Shutdown {
        #[debug("reply")]
        reply: Option<oneshot::Sender<()>>,
    },
}

/// Counters describing a replica's current state.
#[derive(Debug, Clone, Copy)]
pub struct Stats {
    /// Number of entries known to the replica.
    pub size: usize,
    /// Number of layers in the forest.
    pub height: usize,
}

/// Handle to a database running on its own worker thread.
///
/// Cheaply cloneable; the worker shuts down when [`DbHandle::shutdown`] is
/// called or the last handle is dropped.
#[derive(Debug, Clone)]
pub struct DbHandle {
    tx: flume::Sender<Action>,
    join_handle: Arc<Option<JoinHandle<()>>>,
}

impl DbHandle {
    /// Move a database onto a dedicated worker thread.
    ///
    /// Subscribes to the gossip topic named after the database; incoming
    /// head announcements are handled on the worker like any other action.
    pub fn spawn<S: BlockStore, G: Gossip>(db: Database<S>, gossip: G) -> Self {
        let (action_tx, action_rx) = flume::bounded(ACTION_CAP);

        let announcements = gossip.subscribe(&db.manifest().name);
        let forward_tx = action_tx.clone();
        std::thread::Builder::new()
            .name("db-gossip".to_string())
            .spawn(move || {
                while let Ok(data) = announcements.recv() {
                    if forward_tx.send(Action::RemoteAnnouncement { data }).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn thread");

        let id = db.id();
        let actor = Actor {
            db,
            gossip,
            action_rx,
            action_tx: action_tx.clone(),
        };
        let join_handle = std::thread::Builder::new()
            .name("db-actor".to_string())
            .spawn(move || {
                let span = error_span!("db", %id);
                let _enter = span.enter();
                if let Err(err) = actor.run() {
                    error!("database actor failed: {err:?}");
                }
            })
            .expect("failed to spawn thread");

        DbHandle {
            tx: action_tx,
            join_handle: Arc::new(Some(join_handle)),
        }
    }

    /// Write a value under a key, returning the entry timestamp.
    pub async fn set(&self, key: String, value: Bytes) -> Result<u64> {
        self.with_reply(|reply| Action::Set { key, value, reply }).await
    }

    /// Read the latest value written under a key.
    pub async fn get(&self, key: String) -> Result<Option<Bytes>> {
        self.with_reply(|reply| Action::Get { key, reply }).await
    }

    /// Stream all entries in timestamp order into `reply`.
    ///
    /// The sender is dropped when iteration finishes, disconnecting the
    /// receiving side.
    pub async fn entries(&self, reply: flume::Sender<(String, Bytes)>) -> Result<()> {
        self.send(Action::Entries { reply }).await
    }

    /// Current replica counters.
    pub async fn stats(&self) -> Result<Stats> {
        self.with_reply(|reply| Action::Stats { reply }).await
    }

    /// Create (or reuse) a signed head for the current state.
    pub async fn create_head(&self) -> Result<SignedHead> {
        self.with_reply(|reply| Action::CreateHead { reply }).await
    }

    /// Compare the local forest against a remote head.
    pub async fn compare(&self, head: Head) -> Result<Comparison> {
        self.with_reply(|reply| Action::Compare { head, reply }).await
    }

    /// Merge the entries a remote head proves this replica is missing.
    pub async fn merge(&self, head: Head) -> Result<usize> {
        self.with_reply(|reply| Action::Merge { head, reply }).await
    }

    /// Adopt a remote head wholesale; see [`Database::load`].
    pub async fn load(&self, head: SignedHead) -> Result<()> {
        self.with_reply(|reply| Action::Load { head, reply }).await
    }

    /// Publish the current head to the gossip topic if it changed.
    ///
    /// Returns whether an announcement was made.
    pub async fn publish(&self) -> Result<bool> {
        self.with_reply(|reply| Action::PublishHead { reply: Some(reply) })
            .await
    }

    /// Spawn a task that enqueues a head publication every `interval`.
    ///
    /// The task never runs database work itself; it only pushes publish
    /// actions onto the worker's queue, and stops once the worker is gone.
    pub fn start_publisher(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if tx
                    .send_async(Action::PublishHead { reply: None })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    /// Shut the worker down and wait for it to finish its current action.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Action::Shutdown { reply: Some(reply) }).await?;
        rx.await?;
        Ok(())
    }

    async fn with_reply<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> Action,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await?
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .context("sending to database actor failed")?;
        Ok(())
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        // this means we're dropping the last reference
        if let Some(handle) = Arc::get_mut(&mut self.join_handle) {
            self.tx.send(Action::Shutdown { reply: None }).ok();
            let handle = handle.take().expect("this can only run once");
            if let Err(err) = handle.join() {
                warn!(?err, "failed to join database actor");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to send reply: receiver dropped")]
struct SendReplyError;

fn send_reply<T>(sender: oneshot::Sender<T>, value: T) -> Result<()> {
    sender.send(value).map_err(|_| SendReplyError)?;
    Ok(())
}

struct Actor<S: BlockStore, G: Gossip> {
    db: Database<S>,
    gossip: G,
    action_rx: flume::Receiver<Action>,
    action_tx: flume::Sender<Action>,
}

impl<S: BlockStore, G: Gossip> Actor<S, G> {
    fn run(mut self) -> Result<()> {
        while let Ok(action) = self.action_rx.recv() {
            trace!(%action, "tick");
            let is_shutdown = matches!(action, Action::Shutdown { .. });
            if let Err(err) = self.on_action(action) {
                warn!("failed to handle action: {err:?}");
            }
            if is_shutdown {
                break;
            }
        }
        self.db.close();
        debug!("shutdown");
        Ok(())
    }

    fn on_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Set { key, value, reply } => {
                let res = self.db.set(key, value);
                if res.is_ok() {
                    // rebuild later, between queued actions; the dirty
                    // watermark covers the case where the queue is full
                    self.action_tx.try_send(Action::Rebuild).ok();
                }
                send_reply(reply, res)
            }
            Action::Get { key, reply } => send_reply(reply, self.db.get(&key)),
            Action::Entries { reply } => {
                for item in self.db.iter() {
                    if reply.send(item).is_err() {
                        break;
                    }
                }
                Ok(())
            }
            Action::Stats { reply } => send_reply(
                reply,
                Ok(Stats {
                    size: self.db.size(),
                    height: self.db.height(),
                }),
            ),
            Action::CreateHead { reply } => send_reply(reply, self.db.create_head()),
            Action::Compare { head, reply } => send_reply(reply, self.db.compare(&head)),
            Action::Merge { head, reply } => send_reply(reply, self.db.merge(&head)),
            Action::Load { head, reply } => send_reply(reply, self.db.load(&head)),
            Action::Rebuild => self.db.rebuild(),
            Action::PublishHead { reply } => {
                let res = self.publish_head();
                match reply {
                    Some(reply) => send_reply(reply, res),
                    None => res.map(|_| ()),
                }
            }
            Action::RemoteAnnouncement { data } => self.on_announcement(data),
            Action::Shutdown { reply } => {
                if let Some(reply) = reply {
                    reply.send(()).ok();
                }
                Ok(())
            }
        }
    }

    fn publish_head(&mut self) -> Result<bool> {
        if self.db.head_if_new()?.is_none() {
            return Ok(false);
        }
        if let Some(address) = self.db.head_address() {
            self.gossip.publish(
                &self.db.manifest().name,
                Bytes::copy_from_slice(address.as_bytes()),
            )?;
            debug!(head = %address.fmt_short(), "published head");
        }
        Ok(true)
    }

    fn on_announcement(&mut self, data: Bytes) -> Result<()> {
        let Some(address) = Hash::from_slice(&data) else {
            warn!("ignoring malformed head announcement");
            return Ok(());
        };
        let head = match self.db.fetch_head(&address) {
            Ok(head) => head,
            Err(err) => {
                warn!(head = %address.fmt_short(), "ignoring head: {err}");
                return Ok(());
            }
        };
        if head.head().author == self.db.author_id() {
            return Ok(());
        }
        if self.db.size() == 0 {
            self.db.load(&head)?;
        } else {
            self.db.merge(head.head())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DEFAULT_POLLARD_ORDER;
    use crate::keys::Author;
    use crate::net::MemoryGossip;
    use crate::store::MemoryBlockStore;

    fn spawn_db(
        name: &str,
        store: MemoryBlockStore,
        gossip: MemoryGossip,
    ) -> (DbHandle, String) {
        let author = Author::new(&mut rand::thread_rng());
        let db = Database::create(name, DEFAULT_POLLARD_ORDER, author, store).unwrap();
        let id = db.id();
        (DbHandle::spawn(db, gossip), id)
    }

    fn spawn_replica(
        id: &str,
        store: MemoryBlockStore,
        gossip: MemoryGossip,
    ) -> DbHandle {
        let author = Author::new(&mut rand::thread_rng());
        let db = Database::open(id, author, store).unwrap();
        DbHandle::spawn(db, gossip)
    }

    async fn wait_for_size(handle: &DbHandle, size: usize) {
        for _ in 0..500 {
            if handle.stats().await.unwrap().size >= size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timeout waiting for {size} entries");
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (handle, _) = spawn_db("test", MemoryBlockStore::new(), MemoryGossip::new());
        handle
            .set("hello".to_string(), Bytes::from_static(b"world"))
            .await
            .unwrap();
        let value = handle.get("hello".to_string()).await.unwrap();
        assert_eq!(value.unwrap(), &b"world"[..]);

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.size, 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_entries_stream() {
        let (handle, _) = spawn_db("test", MemoryBlockStore::new(), MemoryGossip::new());
        for i in 0..3u8 {
            handle
                .set(format!("k{i}"), Bytes::copy_from_slice(&[i]))
                .await
                .unwrap();
        }
        let (tx, rx) = flume::bounded(16);
        handle.entries(tx).await.unwrap();
        let mut items = Vec::new();
        while let Ok(item) = rx.recv_async().await {
            items.push(item);
        }
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].0, "k0");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_syncs_replica() {
        let store = MemoryBlockStore::new();
        let gossip = MemoryGossip::new();
        let (alice, id) = spawn_db("shared", store.clone(), gossip.clone());
        let bob = spawn_replica(&id, store, gossip);

        alice
            .set("greeting".to_string(), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(alice.publish().await.unwrap());
        // unchanged root, nothing published the second time
        assert!(!alice.publish().await.unwrap());

        wait_for_size(&bob, 1).await;
        let value = bob.get("greeting".to_string()).await.unwrap();
        assert_eq!(value.unwrap(), &b"hi"[..]);

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_publisher_converges() {
        let store = MemoryBlockStore::new();
        let gossip = MemoryGossip::new();
        let (alice, id) = spawn_db("shared", store.clone(), gossip.clone());
        let bob = spawn_replica(&id, store.clone(), gossip.clone());

        let alice_task = alice.start_publisher(Duration::from_millis(20));
        let bob_task = bob.start_publisher(Duration::from_millis(20));

        alice
            .set("a".to_string(), Bytes::from_static(b"1"))
            .await
            .unwrap();
        bob.set("b".to_string(), Bytes::from_static(b"2"))
            .await
            .unwrap();

        wait_for_size(&alice, 2).await;
        wait_for_size(&bob, 2).await;

        let alice_head = alice.create_head().await.unwrap();
        let bob_head = bob.create_head().await.unwrap();
        assert_eq!(alice_head.head().root, bob_head.head().root);

        alice_task.abort();
        bob_task.abort();
        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_merge_via_handles() {
        let store = MemoryBlockStore::new();
        let gossip = MemoryGossip::new();
        let (alice, id) = spawn_db("shared", store.clone(), gossip.clone());
        let bob = spawn_replica(&id, store, gossip);

        alice
            .set("a".to_string(), Bytes::from_static(b"1"))
            .await
            .unwrap();
        bob.set("b".to_string(), Bytes::from_static(b"2"))
            .await
            .unwrap();

        let alice_head = alice.create_head().await.unwrap();
        let admitted = bob.merge(alice_head.head().clone()).await.unwrap();
        assert_eq!(admitted, 1);

        let comparison = bob
            .compare(bob.create_head().await.unwrap().head().clone())
            .await
            .unwrap();
        assert!(comparison.is_equal);

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
    }
}
