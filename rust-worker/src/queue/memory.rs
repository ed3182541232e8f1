//! In-process broker.
//!
//! Same state machine as the Redis broker, held in a mutex. Used for local
//! runs (`REDIS_URL=memory://`) and tests; nothing survives a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::broker::{expired_attempt, failed_attempt, Broker, BrokerError};
use super::types::TaskMessage;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    messages: HashMap<Uuid, TaskMessage>,
    queues: HashMap<String, QueueState>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Uuid>,
    /// Leased messages with their lease deadline
    active: Vec<(Uuid, DateTime<Utc>)>,
    scheduled: Vec<(DateTime<Utc>, Uuid)>,
    dead: Vec<Uuid>,
}

impl QueueState {
    fn remove_active(&mut self, id: Uuid) {
        self.active.retain(|(active, _)| *active != id);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn collect(&self, queue: &str, pick: impl Fn(&QueueState) -> Vec<Uuid>) -> Vec<TaskMessage> {
        let state = self.lock();
        state
            .queues
            .get(queue)
            .map(|q| {
                pick(q)
                    .into_iter()
                    .filter_map(|id| state.messages.get(&id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pending messages of a queue, oldest first.
    pub fn pending(&self, queue: &str) -> Vec<TaskMessage> {
        self.collect(queue, |q| q.pending.iter().copied().collect())
    }

    /// Messages currently held by a worker.
    pub fn active(&self, queue: &str) -> Vec<TaskMessage> {
        self.collect(queue, |q| q.active.iter().map(|(id, _)| *id).collect())
    }

    /// Messages waiting for their retry time.
    pub fn scheduled(&self, queue: &str) -> Vec<TaskMessage> {
        self.collect(queue, |q| q.scheduled.iter().map(|(_, id)| *id).collect())
    }

    /// Archived messages, oldest first.
    pub fn dead(&self, queue: &str) -> Vec<TaskMessage> {
        self.collect(queue, |q| q.dead.clone())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        let mut state = self.lock();
        state.messages.insert(message.id, message.clone());
        state
            .queues
            .entry(message.queue.clone())
            .or_default()
            .pending
            .push_back(message.id);
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[String],
        lease_until: DateTime<Utc>,
    ) -> Result<Option<TaskMessage>, BrokerError> {
        let mut state = self.lock();
        let state = &mut *state;

        for queue in queues {
            let Some(q) = state.queues.get_mut(queue) else {
                continue;
            };
            if let Some(id) = q.pending.pop_front() {
                q.active.push((id, lease_until));
                return Ok(state.messages.get(&id).cloned());
            }
        }

        Ok(None)
    }

    async fn ack(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(&message.queue) {
            q.remove_active(message.id);
        }
        state.messages.remove(&message.id);
        Ok(())
    }

    async fn retry(
        &self,
        message: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let q = state.queues.entry(message.queue.clone()).or_default();
        q.remove_active(message.id);
        q.scheduled.push((process_at, message.id));
        state
            .messages
            .insert(message.id, failed_attempt(message, error));
        Ok(())
    }

    async fn archive(&self, message: &TaskMessage, error: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let q = state.queues.entry(message.queue.clone()).or_default();
        q.remove_active(message.id);
        q.dead.push(message.id);
        state
            .messages
            .insert(message.id, failed_attempt(message, error));
        Ok(())
    }

    async fn forward_scheduled(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError> {
        let mut state = self.lock();
        let mut forwarded = 0;

        for queue in queues {
            let Some(q) = state.queues.get_mut(queue) else {
                continue;
            };
            let (due, waiting): (Vec<_>, Vec<_>) =
                q.scheduled.drain(..).partition(|(at, _)| *at <= now);
            q.scheduled = waiting;
            forwarded += due.len();
            q.pending.extend(due.into_iter().map(|(_, id)| id));
        }

        Ok(forwarded)
    }

    async fn recover_expired(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError> {
        let mut state = self.lock();
        let state = &mut *state;
        let mut recovered = 0;

        for queue in queues {
            let Some(q) = state.queues.get_mut(queue) else {
                continue;
            };
            let (expired, live): (Vec<_>, Vec<_>) =
                q.active.drain(..).partition(|(_, until)| *until <= now);
            q.active = live;

            for (id, _) in expired {
                recovered += 1;
                let Some(message) = state.messages.get(&id) else {
                    continue;
                };
                let (updated, requeue) = expired_attempt(message);
                if requeue {
                    q.pending.push_back(id);
                } else {
                    q.dead.push(id);
                }
                state.messages.insert(id, updated);
            }
        }

        Ok(recovered)
    }
}
