//! Redis broker.
//!
//! Layout under the configured prefix:
//! - `{prefix}:t:{id}`: JSON envelope of every live message
//! - `{prefix}:{queue}:pending`: list of ids, LPUSH in / RPOPLPUSH out (FIFO)
//! - `{prefix}:{queue}:active`: ids currently held by a worker
//! - `{prefix}:{queue}:leases`: sorted set of active ids scored by lease deadline (unix ms)
//! - `{prefix}:{queue}:scheduled`: sorted set of ids scored by due time (unix ms)
//! - `{prefix}:{queue}:dead`: ids of archived messages, newest first
//!
//! Every move between these keys is one Lua script or one MULTI pipeline, so
//! a dropped connection never leaves an id outside all lists.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::broker::{expired_attempt, failed_attempt, Broker, BrokerError};
use super::types::TaskMessage;

/// Dead lists are trimmed to this many entries; bodies of trimmed ids are deleted.
const DEAD_LIST_CAP: isize = 10_000;

/// Upper bound of ids moved by one script call.
const MOVE_BATCH: isize = 500;

/// Pop the oldest pending id into active and lease it.
///
/// KEYS: pending, active, leases. ARGV: lease deadline (ms).
const DEQUEUE_SCRIPT: &str = r"
local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
if id then
  redis.call('ZADD', KEYS[3], ARGV[1], id)
end
return id
";

/// Move due ids from scheduled to pending.
///
/// KEYS: scheduled, pending. ARGV: now (ms), batch size.
const FORWARD_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(ids) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #ids
";

/// Settle an active id onto the dead list and trim the list.
///
/// KEYS: active, leases, dead, body. ARGV: id, body, cap, body key prefix.
const ARCHIVE_SCRIPT: &str = r"
redis.call('LREM', KEYS[1], 1, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SET', KEYS[4], ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[1])
local cap = tonumber(ARGV[3])
local overflow = redis.call('LRANGE', KEYS[3], cap, -1)
for _, old in ipairs(overflow) do
  redis.call('DEL', ARGV[4] .. old)
end
redis.call('LTRIM', KEYS[3], 0, cap - 1)
return #overflow
";

/// Take back an id whose lease expired at or before `now`.
///
/// Does nothing if the lease was settled or renewed since it was read.
/// An empty body drops the message. A cap above zero trims the target list
/// like a dead list.
///
/// KEYS: leases, active, target list, body. ARGV: id, body, now (ms), cap, body key prefix.
const RECLAIM_SCRIPT: &str = r"
local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not score or tonumber(score) > tonumber(ARGV[3]) then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('LREM', KEYS[2], 1, ARGV[1])
if ARGV[2] == '' then
  redis.call('DEL', KEYS[4])
  return 1
end
redis.call('SET', KEYS[4], ARGV[2])
redis.call('LPUSH', KEYS[3], ARGV[1])
local cap = tonumber(ARGV[4])
if cap > 0 then
  local overflow = redis.call('LRANGE', KEYS[3], cap, -1)
  for _, old in ipairs(overflow) do
    redis.call('DEL', ARGV[5] .. old)
  end
  redis.call('LTRIM', KEYS[3], 0, cap - 1)
end
return 1
";

/// Open a managed (auto-reconnecting) connection.
pub async fn connect(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    client.get_connection_manager().await
}

/// Redis-backed broker with lazy connection setup.
///
/// Cloning is cheap; all clones share one managed connection.
#[derive(Clone)]
pub struct RedisBroker {
    inner: Arc<RedisBrokerInner>,
}

struct RedisBrokerInner {
    url: String,
    prefix: String,
    connection: RwLock<Option<ConnectionManager>>,
    scripts: Scripts,
}

struct Scripts {
    dequeue: Script,
    forward: Script,
    archive: Script,
    reclaim: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            dequeue: Script::new(DEQUEUE_SCRIPT),
            forward: Script::new(FORWARD_SCRIPT),
            archive: Script::new(ARCHIVE_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
        }
    }
}

impl RedisBroker {
    /// Create a broker; the connection is opened on first use.
    pub fn new(url: String, prefix: &str) -> Self {
        Self {
            inner: Arc::new(RedisBrokerInner {
                url,
                prefix: prefix.to_string(),
                connection: RwLock::new(None),
                scripts: Scripts::new(),
            }),
        }
    }

    async fn ensure_connected(&self) -> Result<ConnectionManager, BrokerError> {
        {
            let connection = self.inner.connection.read().await;
            if let Some(conn) = connection.as_ref() {
                return Ok(conn.clone());
            }
        }

        let mut connection = self.inner.connection.write().await;

        // Double-check after acquiring write lock
        if let Some(conn) = connection.as_ref() {
            return Ok(conn.clone());
        }

        info!("redis_broker_connecting");
        let conn = connect(&self.inner.url).await?;
        info!("redis_broker_connected");

        *connection = Some(conn.clone());
        Ok(conn)
    }

    fn message_key(&self, message_id: &str) -> String {
        format!("{}:t:{}", self.inner.prefix, message_id)
    }

    fn message_key_prefix(&self) -> String {
        format!("{}:t:", self.inner.prefix)
    }

    fn queue_key(&self, queue: &str, state: &str) -> String {
        format!("{}:{}:{}", self.inner.prefix, queue, state)
    }

    /// Move an active id to the dead list with `body`, trimming the list.
    async fn bury(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &str,
        body: &str,
    ) -> Result<(), BrokerError> {
        let trimmed: i64 = self
            .inner
            .scripts
            .archive
            .key(self.queue_key(queue, "active"))
            .key(self.queue_key(queue, "leases"))
            .key(self.queue_key(queue, "dead"))
            .key(self.message_key(id))
            .arg(id)
            .arg(body)
            .arg(DEAD_LIST_CAP)
            .arg(self.message_key_prefix())
            .invoke_async(conn)
            .await?;

        if trimmed > 0 {
            info!(queue = %queue, trimmed = trimmed, "redis_dead_list_trimmed");
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        let mut conn = self.ensure_connected().await?;
        let id = message.id.to_string();
        let body = serde_json::to_string(message)?;

        let _: () = redis::pipe()
            .atomic()
            .set(self.message_key(&id), &body)
            .lpush(self.queue_key(&message.queue, "pending"), &id)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[String],
        lease_until: DateTime<Utc>,
    ) -> Result<Option<TaskMessage>, BrokerError> {
        let mut conn = self.ensure_connected().await?;

        for queue in queues {
            let pending = self.queue_key(queue, "pending");
            let active = self.queue_key(queue, "active");
            let leases = self.queue_key(queue, "leases");

            loop {
                let id: Option<String> = self
                    .inner
                    .scripts
                    .dequeue
                    .key(&pending)
                    .key(&active)
                    .key(&leases)
                    .arg(lease_until.timestamp_millis())
                    .invoke_async(&mut conn)
                    .await?;

                let Some(id) = id else {
                    break;
                };

                let body: Option<String> = conn.get(self.message_key(&id)).await?;

                let Some(body) = body else {
                    warn!(queue = %queue, message_id = %id, "redis_message_body_missing");
                    let _: () = redis::pipe()
                        .atomic()
                        .lrem(&active, 1, &id)
                        .zrem(&leases, &id)
                        .query_async(&mut conn)
                        .await?;
                    continue;
                };

                match serde_json::from_str::<TaskMessage>(&body) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => {
                        warn!(
                            queue = %queue,
                            message_id = %id,
                            error = %e,
                            "redis_message_body_invalid"
                        );
                        self.bury(&mut conn, queue, &id, &body).await?;
                    }
                }
            }
        }

        Ok(None)
    }

    async fn ack(&self, message: &TaskMessage) -> Result<(), BrokerError> {
        let mut conn = self.ensure_connected().await?;
        let id = message.id.to_string();

        let _: () = redis::pipe()
            .atomic()
            .lrem(self.queue_key(&message.queue, "active"), 1, &id)
            .zrem(self.queue_key(&message.queue, "leases"), &id)
            .del(self.message_key(&id))
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn retry(
        &self,
        message: &TaskMessage,
        process_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.ensure_connected().await?;
        let updated = failed_attempt(message, error);
        let id = updated.id.to_string();
        let body = serde_json::to_string(&updated)?;

        let _: () = redis::pipe()
            .atomic()
            .lrem(self.queue_key(&message.queue, "active"), 1, &id)
            .zrem(self.queue_key(&message.queue, "leases"), &id)
            .set(self.message_key(&id), &body)
            .zadd(
                self.queue_key(&message.queue, "scheduled"),
                &id,
                process_at.timestamp_millis(),
            )
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn archive(&self, message: &TaskMessage, error: &str) -> Result<(), BrokerError> {
        let mut conn = self.ensure_connected().await?;
        let updated = failed_attempt(message, error);
        let id = updated.id.to_string();
        let body = serde_json::to_string(&updated)?;

        self.bury(&mut conn, &message.queue, &id, &body).await
    }

    async fn forward_scheduled(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError> {
        let mut conn = self.ensure_connected().await?;
        let mut forwarded = 0;

        for queue in queues {
            let scheduled = self.queue_key(queue, "scheduled");
            let pending = self.queue_key(queue, "pending");

            loop {
                let moved: usize = self
                    .inner
                    .scripts
                    .forward
                    .key(&scheduled)
                    .key(&pending)
                    .arg(now.timestamp_millis())
                    .arg(MOVE_BATCH)
                    .invoke_async(&mut conn)
                    .await?;

                forwarded += moved;
                if moved < MOVE_BATCH as usize {
                    break;
                }
            }
        }

        Ok(forwarded)
    }

    async fn recover_expired(
        &self,
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, BrokerError> {
        let mut conn = self.ensure_connected().await?;
        let now_ms = now.timestamp_millis();
        let mut recovered = 0;

        for queue in queues {
            let leases = self.queue_key(queue, "leases");
            let expired: Vec<String> = conn
                .zrangebyscore_limit(&leases, "-inf", now_ms, 0, MOVE_BATCH)
                .await?;

            for id in expired {
                let body: Option<String> = conn.get(self.message_key(&id)).await?;
                let decoded = body
                    .as_deref()
                    .and_then(|body| serde_json::from_str::<TaskMessage>(body).ok());

                let (target, new_body, cap) = match decoded {
                    Some(message) => {
                        let (updated, requeue) = expired_attempt(&message);
                        if requeue {
                            ("pending", serde_json::to_string(&updated)?, 0)
                        } else {
                            ("dead", serde_json::to_string(&updated)?, DEAD_LIST_CAP)
                        }
                    }
                    None => {
                        warn!(queue = %queue, message_id = %id, "redis_expired_body_unusable");
                        ("dead", String::new(), 0)
                    }
                };

                let reclaimed: i64 = self
                    .inner
                    .scripts
                    .reclaim
                    .key(&leases)
                    .key(self.queue_key(queue, "active"))
                    .key(self.queue_key(queue, target))
                    .key(self.message_key(&id))
                    .arg(&id)
                    .arg(&new_body)
                    .arg(now_ms)
                    .arg(cap)
                    .arg(self.message_key_prefix())
                    .invoke_async(&mut conn)
                    .await?;

                if reclaimed == 1 {
                    recovered += 1;
                    warn!(
                        queue = %queue,
                        message_id = %id,
                        target = target,
                        "redis_lease_expired"
                    );
                }
            }
        }

        Ok(recovered)
    }
}
