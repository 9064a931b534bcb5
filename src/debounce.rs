//! Message debouncer: coalesces rapid messages per conversation.
//!
//! Each `(instance, chat)` key with buffered work is owned by one actor task.
//! Callers never touch timers; they send commands and the actor owns the
//! deadline. A flush hands the batch to the flush callback as a task chained
//! behind the previous flush for the same key, so exactly one dispatch is in
//! flight per key and batches are dispatched in order.
//!
//! Deadline rules for a buffering cycle:
//! - the first message sets `deadline = now + initial_delay`;
//! - later messages append without touching the deadline;
//! - typing sets `deadline = max(deadline, min(now + base, first + max))`.

use crate::ChatKey;
use crate::config::DebounceConfig;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Called with every flushed batch, in arrival order.
pub type FlushFn<T> = Arc<dyn Fn(ChatKey, Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

enum Command<T> {
    Push { item: T, config: DebounceConfig },
    Typing,
    /// Flush now, wait for the in-flight dispatch, then exit.
    Shutdown,
}

struct ActorHandle<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    task: JoinHandle<()>,
}

type ActorMap<T> = Arc<DashMap<ChatKey, ActorHandle<T>>>;

pub struct Debouncer<T> {
    actors: ActorMap<T>,
    on_flush: FlushFn<T>,
    closed: AtomicBool,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(on_flush: FlushFn<T>) -> Self {
        Self {
            actors: Arc::new(DashMap::new()),
            on_flush,
            closed: AtomicBool::new(false),
        }
    }

    /// Buffer `item` for `key`, starting a cycle if the key is idle.
    pub fn push(&self, key: ChatKey, item: T, config: DebounceConfig) {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(chat_key = %key, "debouncer closed, dispatching without buffering");
            tokio::spawn((self.on_flush)(key, vec![item]));
            return;
        }

        let command = Command::Push { item, config };
        match self.actors.entry(key) {
            Entry::Occupied(mut entry) => {
                if let Err(mpsc::error::SendError(command)) = entry.get().tx.send(command) {
                    // The actor died without deregistering (it panicked). Replace it.
                    tracing::warn!(chat_key = %entry.key(), "debounce actor gone, restarting");
                    let handle = self.spawn_actor(entry.key().clone(), command);
                    entry.insert(handle);
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn_actor(entry.key().clone(), command);
                entry.insert(handle);
            }
        }
    }

    /// Report typing presence for `key`. Returns false when nothing is buffering.
    pub fn typing(&self, key: &ChatKey) -> bool {
        match self.actors.get(key) {
            Some(actor) => actor.tx.send(Command::Typing).is_ok(),
            None => false,
        }
    }

    /// Number of keys with buffered or in-flight work.
    pub fn active_keys(&self) -> usize {
        self.actors.len()
    }

    /// Flush every pending buffer immediately and wait up to `grace` for
    /// the resulting dispatches. Dispatches still running after `grace`
    /// continue in the background.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::Release);

        let keys: Vec<ChatKey> = self.actors.iter().map(|entry| entry.key().clone()).collect();
        let mut tasks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, actor)) = self.actors.remove(&key) {
                let _ = actor.tx.send(Command::Shutdown);
                tasks.push(actor.task);
            }
        }

        let flushed = tasks.len();
        if tokio::time::timeout(grace, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!(
                keys = flushed,
                grace_ms = grace.as_millis() as u64,
                "dispatches still running after shutdown grace, detaching"
            );
        } else {
            tracing::debug!(keys = flushed, "debouncer drained");
        }
    }

    fn spawn_actor(&self, key: ChatKey, first: Command<T>) -> ActorHandle<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(first);

        let actor = Actor {
            key,
            rx,
            actors: self.actors.clone(),
            on_flush: self.on_flush.clone(),
            config: DebounceConfig::default(),
            buffer: Vec::new(),
            first_buffered_at: None,
            deadline: None,
            in_flight: None,
        };
        let task = tokio::spawn(actor.run());
        ActorHandle { tx, task }
    }
}

struct Actor<T> {
    key: ChatKey,
    rx: mpsc::UnboundedReceiver<Command<T>>,
    actors: ActorMap<T>,
    on_flush: FlushFn<T>,
    /// Config of the current cycle, taken from its first message.
    config: DebounceConfig,
    buffer: Vec<T>,
    first_buffered_at: Option<Instant>,
    deadline: Option<Instant>,
    in_flight: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Actor<T> {
    async fn run(mut self) {
        loop {
            let deadline = self.deadline;
            let waiting_on_dispatch = self.buffer.is_empty() && self.in_flight.is_some();

            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Push { item, config }) => self.push(item, config),
                    Some(Command::Typing) => self.extend_for_typing(),
                    Some(Command::Shutdown) | None => {
                        self.flush();
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                }
                _ = join_in_flight(&mut self.in_flight, &self.key), if waiting_on_dispatch => {
                    self.in_flight = None;
                }
            }

            // Deregister only while holding the shard lock and with no queued
            // command, so a concurrent push either lands here or spawns a new actor.
            if self.buffer.is_empty()
                && self.in_flight.is_none()
                && self
                    .actors
                    .remove_if(&self.key, |_, _| self.rx.is_empty())
                    .is_some()
            {
                return;
            }
        }

        join_in_flight(&mut self.in_flight, &self.key).await;
    }

    fn push(&mut self, item: T, config: DebounceConfig) {
        let now = Instant::now();
        if self.buffer.is_empty() {
            self.config = config;
            self.first_buffered_at = Some(now);
            let cap = now + config.max_delay();
            self.deadline = Some((now + config.initial_delay()).min(cap));
            tracing::trace!(chat_key = %self.key, "debounce cycle started");
        }
        self.buffer.push(item);
    }

    fn extend_for_typing(&mut self) {
        if !self.config.extend_on_typing {
            return;
        }
        let (Some(current), Some(first)) = (self.deadline, self.first_buffered_at) else {
            return;
        };
        let now = Instant::now();
        let extended = (now + self.config.base_delay()).min(first + self.config.max_delay());
        self.deadline = Some(current.max(extended));
    }

    fn flush(&mut self) {
        self.deadline = None;
        self.first_buffered_at = None;
        if self.buffer.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.buffer);
        let mut previous = self.in_flight.take();
        let dispatch = (self.on_flush)(self.key.clone(), batch);
        let key = self.key.clone();

        self.in_flight = Some(tokio::spawn(async move {
            join_in_flight(&mut previous, &key).await;
            dispatch.await;
        }));
    }
}

async fn join_in_flight(task: &mut Option<JoinHandle<()>>, key: &ChatKey) {
    if let Some(task) = task
        && let Err(error) = task.await
    {
        tracing::error!(%error, chat_key = %key, "dispatch task failed");
    }
}
