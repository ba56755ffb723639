//! A Redis implementation of the [`reportq`] queue store.
//!
//! Every queue lives under a namespace, `queue:{name}`, and uses five keys:
//!
//! | Key | Type | Holds |
//! |---|---|---|
//! | `queue:{name}` | list | ready jobs, pushed on the left and claimed from the right |
//! | `queue:{name}:delayed` | sorted set | retried jobs scored by their `retryAt` in unix millis |
//! | `queue:{name}:processing` | list | claimed jobs |
//! | `queue:{name}:completed` | list | the newest completed jobs, newest first |
//! | `queue:{name}:failed` | list | the newest permanently failed jobs, newest first |
//!
//! Every element is the JSON encoding of a [`Job`]. A `rediss://` URL connects over TLS.
//!
//! Claims use `BLMOVE` so a job is handed to exactly one worker. Acknowledging or failing a job
//! reads its record from the processing list, computes the new record, then moves it with a script
//! that only pushes the new record if the exact old one was still there to remove.
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    AsyncCommands, Client, RedisError, Script, ToRedisArgs,
};
use reportq::{
    backend::{
        Backend, BackendError, EnqueuableJob, ExecutionError, FailOutcome, Job, Partition,
        Retention, MAX_CLAIM_WAIT,
    },
    config::QueueConfig,
    job::JobId,
    retry::RetryPolicy,
    stats::QueueStats,
};

/// Moves every delayed job that is due to the waiting list, earliest `retryAt` first.
///
/// Returns the score of the next delayed job, if any.
const PROMOTE_DUE: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, job in ipairs(due) do
  redis.call('LPUSH', KEYS[2], job)
end
if #due > 0 then
  redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
end
local upcoming = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if upcoming[2] then
  return tonumber(upcoming[2])
end
return false
";

/// Replaces a just claimed element with its processing record.
const MARK_CLAIMED: &str = r"
local index = redis.call('LPOS', KEYS[1], ARGV[1])
if not index then
  return 0
end
redis.call('LSET', KEYS[1], index, ARGV[2])
return 1
";

/// Removes `ARGV[1]` from the processing list and pushes `ARGV[2]` onto the destination list,
/// trimming it to `ARGV[3]` elements unless that is negative.
const MOVE_TO_LIST: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('LPUSH', KEYS[2], ARGV[2])
local cap = tonumber(ARGV[3])
if cap == 0 then
  redis.call('DEL', KEYS[2])
elseif cap > 0 then
  redis.call('LTRIM', KEYS[2], 0, cap - 1)
end
return 1
";

/// Removes `ARGV[1]` from the processing list and adds `ARGV[2]` to the delayed set with score
/// `ARGV[3]`.
const MOVE_TO_DELAYED: &str = r"
if redis.call('LREM', KEYS[1], 1, ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])
return 1
";

const NO_CAP: i64 = -1;

fn map_err(error: RedisError) -> BackendError {
    BackendError::Unavailable(error.to_string())
}

struct Scripts {
    promote_due: Script,
    mark_claimed: Script,
    move_to_list: Script,
    move_to_delayed: Script,
}

impl Default for Scripts {
    fn default() -> Self {
        Self {
            promote_due: Script::new(PROMOTE_DUE),
            mark_claimed: Script::new(MARK_CLAIMED),
            move_to_list: Script::new(MOVE_TO_LIST),
            move_to_delayed: Script::new(MOVE_TO_DELAYED),
        }
    }
}

/// Connections reserved for blocking claims.
///
/// A blocked `BLMOVE` holds up every command queued behind it on the same connection, so each
/// concurrent claim gets a connection of its own, reused by later claims.
struct ClaimConnections {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl ClaimConnections {
    async fn checkout(&self) -> Result<MultiplexedConnection, BackendError> {
        let idle = self.idle.lock().map_err(|_| BackendError::BadState)?.pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(map_err),
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(conn);
        }
    }
}

/// A [`Backend`] storing jobs in Redis.
///
/// Cloning is cheap and every clone shares the same connections.
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    claims: Arc<ClaimConnections>,
    scripts: Arc<Scripts>,
    namespace: NameSpace,
    policy: RetryPolicy,
    retention: Retention,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("queue", &self.namespace.0)
            .field("policy", &self.policy)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to the server at `redis_url` and use the queue `queue_name`.
    ///
    /// The default retry policy and retention apply, see [`RedisBackend::from_config`].
    pub async fn from_url(
        redis_url: &str,
        queue_name: impl ToString,
    ) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(map_err)?;
        let namespace = NameSpace(queue_name.to_string());
        tracing::debug!(queue = %namespace.0, "Connected to redis queue {}", namespace.0);

        Ok(Self {
            conn,
            claims: Arc::new(ClaimConnections {
                client,
                idle: Mutex::default(),
            }),
            scripts: Arc::default(),
            namespace,
            policy: RetryPolicy::default(),
            retention: Retention::default(),
        })
    }

    pub async fn from_config(config: &QueueConfig) -> Result<Self, BackendError> {
        Ok(Self::from_url(&config.store_url, &config.queue_name)
            .await?
            .with_retry_policy(config.retry.clone())
            .with_retention(config.retention))
    }

    pub fn with_retry_policy(self, policy: RetryPolicy) -> Self {
        Self { policy, ..self }
    }

    pub fn with_retention(self, retention: Retention) -> Self {
        Self { retention, ..self }
    }

    async fn promote_due(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, BackendError> {
        let next_retry_at: Option<i64> = self
            .scripts
            .promote_due
            .key(self.namespace.key(KeyType::Delayed))
            .key(self.namespace.key(KeyType::Waiting))
            .arg(now.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(next_retry_at.and_then(DateTime::from_timestamp_millis))
    }

    /// Move the oldest waiting job to the processing list, blocking for at most `timeout`.
    async fn move_oldest(&self, timeout: Duration) -> Result<Option<String>, BackendError> {
        let mut cmd = if timeout < Duration::from_millis(1) {
            redis::cmd("LMOVE")
        } else {
            redis::cmd("BLMOVE")
        };
        cmd.arg(self.namespace.key(KeyType::Waiting))
            .arg(self.namespace.key(KeyType::Processing))
            .arg("RIGHT")
            .arg("LEFT");
        if timeout >= Duration::from_millis(1) {
            // Zero would block forever.
            cmd.arg(timeout.as_secs_f64().max(0.001));
        }

        let mut conn = self.claims.checkout().await?;
        let raw: Option<String> = cmd.query_async(&mut conn).await.map_err(map_err)?;
        self.claims.checkin(conn);
        Ok(raw)
    }

    /// Stamp the claim on a job just moved to the processing list.
    ///
    /// Returns `None` if the element is not a job, or if the reaper took it back before the stamp.
    async fn mark_claimed(&self, raw: String) -> Result<Option<Job>, BackendError> {
        let Some(mut job) = decode(&raw) else {
            self.discard_in_flight(&raw).await?;
            return Ok(None);
        };
        job.mark_processing(Utc::now());
        let claimed = serde_json::to_string(&job)?;
        let replaced: i64 = self
            .scripts
            .mark_claimed
            .key(self.namespace.key(KeyType::Processing))
            .arg(&raw)
            .arg(&claimed)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        if replaced == 0 {
            tracing::warn!(
                job_id = %job.id,
                "Job {} was requeued before its claim was stamped",
                job.id
            );
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Drop an element that cannot be decoded from the processing list.
    async fn discard_in_flight(&self, raw: &str) -> Result<(), BackendError> {
        tracing::error!(raw, "Discarding undecodable element from the processing list");
        let _: i64 = self
            .conn
            .clone()
            .lrem(self.namespace.key(KeyType::Processing), 1, raw)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn read_list(&self, kind: KeyType) -> Result<Vec<String>, BackendError> {
        self.conn
            .clone()
            .lrange(self.namespace.key(kind), 0, -1)
            .await
            .map_err(map_err)
    }

    async fn find_in_flight(&self, id: &JobId) -> Result<(String, Job), BackendError> {
        for raw in self.read_list(KeyType::Processing).await? {
            if let Some(job) = decode(&raw).filter(|job| &job.id == id) {
                return Ok((raw, job));
            }
        }
        Err(BackendError::JobNotFound(id.clone()))
    }

    /// Replace the in-flight `raw` with `job` in `kind`. Returns false if `raw` was already gone.
    async fn move_to_list(
        &self,
        raw: &str,
        job: &Job,
        kind: KeyType,
        cap: i64,
    ) -> Result<bool, BackendError> {
        let moved: i64 = self
            .scripts
            .move_to_list
            .key(self.namespace.key(KeyType::Processing))
            .key(self.namespace.key(kind))
            .arg(raw)
            .arg(serde_json::to_string(job)?)
            .arg(cap)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(moved == 1)
    }

    async fn move_to_delayed(
        &self,
        raw: &str,
        job: &Job,
        retry_at: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let moved: i64 = self
            .scripts
            .move_to_delayed
            .key(self.namespace.key(KeyType::Processing))
            .key(self.namespace.key(KeyType::Delayed))
            .arg(raw)
            .arg(serde_json::to_string(job)?)
            .arg(retry_at.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(moved == 1)
    }

    /// Apply a failed attempt to the in-flight `raw`. Returns `None` if it was already gone.
    async fn fail_in_flight(
        &self,
        raw: &str,
        mut job: Job,
        error: ExecutionError,
        now: DateTime<Utc>,
    ) -> Result<Option<FailOutcome>, BackendError> {
        let outcome = job.record_failure(error, &self.policy, now);
        let moved = match outcome {
            FailOutcome::Retrying { .. } if job.is_ready(now) => {
                self.move_to_list(raw, &job, KeyType::Waiting, NO_CAP).await?
            }
            FailOutcome::Retrying { retry_at, .. } => {
                self.move_to_delayed(raw, &job, retry_at).await?
            }
            FailOutcome::Failed { .. } => {
                self.move_to_list(raw, &job, KeyType::Failed, cap(self.retention.failed))
                    .await?
            }
        };
        Ok(moved.then_some(outcome))
    }
}

fn cap(retention: usize) -> i64 {
    i64::try_from(retention).unwrap_or(i64::MAX)
}

/// Decode a list element, logging and skipping anything that is not a job.
fn decode(raw: &str) -> Option<Job> {
    serde_json::from_str(raw)
        .inspect_err(|err| tracing::warn!(?err, raw, "Skipping undecodable queue element: {err}"))
        .ok()
}

fn decode_oldest_first(raws: Vec<String>) -> Vec<Job> {
    raws.iter().rev().filter_map(|raw| decode(raw)).collect()
}

#[async_trait]
impl Backend for RedisBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let job = job.into_job(Utc::now());
        let _: i64 = self
            .conn
            .clone()
            .lpush(
                self.namespace.key(KeyType::Waiting),
                serde_json::to_string(&job)?,
            )
            .await
            .map_err(map_err)?;
        Ok(job.id)
    }

    async fn claim_next(&self, timeout: Duration) -> Result<Option<Job>, BackendError> {
        let deadline = Instant::now() + timeout.min(MAX_CLAIM_WAIT);
        loop {
            let next_retry_at = self.promote_due(Utc::now()).await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = next_retry_at
                .and_then(|retry_at| (retry_at - Utc::now()).to_std().ok())
                .map_or(remaining, |until| until.min(remaining));

            if let Some(raw) = self.move_oldest(wait).await? {
                if let Some(job) = self.mark_claimed(raw).await? {
                    return Ok(Some(job));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn acknowledge(
        &self,
        id: &JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        let (raw, mut job) = self.find_in_flight(id).await?;
        job.mark_completed(result, Utc::now());
        if !self
            .move_to_list(&raw, &job, KeyType::Completed, cap(self.retention.completed))
            .await?
        {
            return Err(BackendError::JobNotFound(id.clone()));
        }
        Ok(())
    }

    async fn fail(&self, id: &JobId, error: ExecutionError) -> Result<FailOutcome, BackendError> {
        let (raw, job) = self.find_in_flight(id).await?;
        self.fail_in_flight(&raw, job, error, Utc::now())
            .await?
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))
    }

    async fn requeue_stalled(
        &self,
        visibility_timeout: TimeDelta,
    ) -> Result<Vec<JobId>, BackendError> {
        let now = Utc::now();
        let mut requeued = Vec::new();
        for raw in self.read_list(KeyType::Processing).await? {
            let Some(job) = decode(&raw) else {
                continue;
            };
            if !job.is_stalled(visibility_timeout, now) {
                continue;
            }
            let id = job.id.clone();
            let error = ExecutionError::stalled(visibility_timeout);
            if self.fail_in_flight(&raw, job, error, now).await?.is_some() {
                requeued.push(id);
            }
        }
        Ok(requeued)
    }

    async fn stats(&self) -> Result<QueueStats, BackendError> {
        let (waiting, delayed, processing, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(self.namespace.key(KeyType::Waiting))
                .zcard(self.namespace.key(KeyType::Delayed))
                .llen(self.namespace.key(KeyType::Processing))
                .llen(self.namespace.key(KeyType::Completed))
                .llen(self.namespace.key(KeyType::Failed))
                .query_async(&mut self.conn.clone())
                .await
                .map_err(map_err)?;
        Ok(QueueStats::new(
            waiting + delayed,
            processing,
            completed,
            failed,
        ))
    }

    async fn jobs(&self, partition: Partition) -> Result<Vec<Job>, BackendError> {
        match partition {
            Partition::Waiting => {
                let mut jobs = decode_oldest_first(self.read_list(KeyType::Waiting).await?);
                let delayed: Vec<String> = self
                    .conn
                    .clone()
                    .zrange(self.namespace.key(KeyType::Delayed), 0, -1)
                    .await
                    .map_err(map_err)?;
                jobs.extend(delayed.iter().filter_map(|raw| decode(raw)));
                Ok(jobs)
            }
            Partition::Processing => Ok(decode_oldest_first(
                self.read_list(KeyType::Processing).await?,
            )),
            Partition::Completed => Ok(decode_oldest_first(
                self.read_list(KeyType::Completed).await?,
            )),
            Partition::Failed => Ok(decode_oldest_first(self.read_list(KeyType::Failed).await?)),
        }
    }

    async fn is_healthy(&self) -> bool {
        let pong: Result<String, RedisError> = redis::cmd("PING")
            .query_async(&mut self.conn.clone())
            .await;
        pong.inspect_err(|err| tracing::warn!(?err, "Redis health check failed: {err}"))
            .is_ok()
    }
}

#[derive(Clone)]
struct NameSpace(String);

impl NameSpace {
    fn key(&self, kind: KeyType) -> NameSpacedKey<'_> {
        NameSpacedKey {
            namespace: &self.0,
            kind,
        }
    }
}

struct NameSpacedKey<'a> {
    namespace: &'a str,
    kind: KeyType,
}

impl fmt::Display for NameSpacedKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue:{}", self.namespace)?;
        match self.kind {
            KeyType::Waiting => Ok(()),
            KeyType::Delayed => write!(f, ":delayed"),
            KeyType::Processing => write!(f, ":processing"),
            KeyType::Completed => write!(f, ":completed"),
            KeyType::Failed => write!(f, ":failed"),
        }
    }
}

impl<'a> ToRedisArgs for NameSpacedKey<'a> {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg_fmt(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Waiting,
    Delayed,
    Processing,
    Completed,
    Failed,
}
