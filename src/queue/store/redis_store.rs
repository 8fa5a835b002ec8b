//! Redis-backed job store.
//!
//! Layout per queue, all under one hash tag so a queue's keys share a slot:
//!
//! - `{ns}:{queue}:job:{id}`  hash of scalar job fields (JSON only for payload,
//!   backoff, progress, result and failure)
//! - `{ns}:{queue}:wait`      zset, score = priority rank * 1e13 + sequence
//! - `{ns}:{queue}:delayed`   zset, score = due time (ms)
//! - `{ns}:{queue}:active`    zset, score = lock deadline (ms)
//! - `{ns}:{queue}:completed` / `:failed`  zset, score = finish time (ms)
//! - `{ns}:{queue}:paused`    flag key
//! - `{ns}:{queue}:seq`       FIFO tie-breaker counter
//!
//! Every transition is a Lua script, so concurrent workers in any number of
//! processes see each job move exactly once.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::metrics::StoreMetrics;
use crate::queue::error::StoreError;
use crate::queue::job::{Job, JobId, JobState, Priority, Progress};
use crate::redis::RedisPool;

use super::backend::{AddOutcome, JobCounts, JobStore};

const BACKEND: &str = "redis";

// KEYS: job, wait, delayed, seq
// ARGV: id, rank, due_ms (0 = not delayed), field/value pairs...
const ADD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
local fields = {}
for i = 4, #ARGV do fields[#fields + 1] = ARGV[i] end
redis.call('HSET', KEYS[1], unpack(fields))
local due = tonumber(ARGV[3])
if due > 0 then
    redis.call('ZADD', KEYS[3], due, ARGV[1])
else
    local seq = redis.call('INCR', KEYS[4])
    redis.call('ZADD', KEYS[2], string.format('%.0f', tonumber(ARGV[2]) * 1e13 + seq), ARGV[1])
end
return 1
"#;

// KEYS: wait, delayed, active, paused, seq
// ARGV: now_ms, lock_grace_ms, job key prefix, lock token
const DEQUEUE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now, 'LIMIT', 0, 100)
for _, id in ipairs(due) do
    redis.call('ZREM', KEYS[2], id)
    local key = ARGV[3] .. id
    if redis.call('EXISTS', key) == 1 then
        local rank = tonumber(redis.call('HGET', key, 'rank') or '2')
        local seq = redis.call('INCR', KEYS[5])
        redis.call('ZADD', KEYS[1], string.format('%.0f', rank * 1e13 + seq), id)
        redis.call('HSET', key, 'state', 'waiting')
        redis.call('HDEL', key, 'delay_until')
    end
end

if redis.call('EXISTS', KEYS[4]) == 1 then return false end

while true do
    local popped = redis.call('ZPOPMIN', KEYS[1])
    if #popped == 0 then return false end
    local id = popped[1]
    local key = ARGV[3] .. id
    if redis.call('EXISTS', key) == 1 then
        local timeout = tonumber(redis.call('HGET', key, 'timeout_ms') or '0')
        local lock = now + timeout + tonumber(ARGV[2])
        redis.call('HSET', key, 'state', 'active', 'processed_at', ARGV[1],
            'lock_until', string.format('%.0f', lock), 'lock_token', ARGV[4])
        redis.call('ZADD', KEYS[3], lock, id)
        return redis.call('HGETALL', key)
    end
end
"#;

// KEYS: job, active, wait, delayed, completed, failed, seq
// ARGV: id, lock token, target state, score, rank, keep, job key prefix,
//       field/value pairs...
const FINISH_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'lock_token') ~= ARGV[2] then return 0 end
if redis.call('ZREM', KEYS[2], ARGV[1]) == 0 then return 0 end

redis.call('DEL', KEYS[1])
local fields = {}
for i = 8, #ARGV do fields[#fields + 1] = ARGV[i] end
redis.call('HSET', KEYS[1], unpack(fields))

local target = ARGV[3]
if target == 'waiting' then
    local seq = redis.call('INCR', KEYS[7])
    redis.call('ZADD', KEYS[3], string.format('%.0f', tonumber(ARGV[5]) * 1e13 + seq), ARGV[1])
elseif target == 'delayed' then
    redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
else
    local set = KEYS[5]
    if target == 'failed' then set = KEYS[6] end
    redis.call('ZADD', set, ARGV[4], ARGV[1])
    local excess = redis.call('ZCARD', set) - tonumber(ARGV[6])
    if excess > 0 then
        local old = redis.call('ZRANGE', set, 0, excess - 1)
        for _, id in ipairs(old) do
            redis.call('DEL', ARGV[7] .. id)
        end
        redis.call('ZREMRANGEBYRANK', set, 0, excess - 1)
    end
end
return 1
"#;

// KEYS: job, wait, delayed, active
// ARGV: id
const REMOVE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state')
if state ~= 'waiting' and state ~= 'delayed' and state ~= 'active' then return false end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('DEL', KEYS[1])
return state
"#;

// KEYS: job, failed, wait, seq
// ARGV: id
const RETRY_FAILED_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'failed' then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'state', 'waiting', 'attempts_made', '0')
redis.call('HDEL', KEYS[1], 'failure', 'finished_at', 'delay_until', 'lock_until', 'lock_token')
local rank = tonumber(redis.call('HGET', KEYS[1], 'rank') or '2')
local seq = redis.call('INCR', KEYS[4])
redis.call('ZADD', KEYS[3], string.format('%.0f', rank * 1e13 + seq), ARGV[1])
return 1
"#;

// KEYS: job
// ARGV: progress JSON
const PROGRESS_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then return 0 end
redis.call('HSET', KEYS[1], 'progress', ARGV[1])
return 1
"#;

// KEYS: terminal set
// ARGV: cutoff_ms, limit, job key prefix
const CLEAN_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
    redis.call('DEL', ARGV[3] .. id)
    redis.call('ZREM', KEYS[1], id)
end
return ids
"#;

struct QueueKeys {
    base: String,
}

impl QueueKeys {
    fn new(namespace: &str, queue: &str) -> Self {
        Self {
            base: format!("{}:{{{}}}", namespace, queue),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.base, id)
    }

    fn job_prefix(&self) -> String {
        format!("{}:job:", self.base)
    }

    fn set(&self, name: &str) -> String {
        format!("{}:{}", self.base, name)
    }
}

struct Scripts {
    add: redis::Script,
    dequeue: redis::Script,
    finish: redis::Script,
    remove: redis::Script,
    retry_failed: redis::Script,
    progress: redis::Script,
    clean: redis::Script,
}

pub struct RedisJobStore {
    pool: Arc<RedisPool>,
    namespace: String,
    scripts: Scripts,
}

impl RedisJobStore {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        let namespace = pool.namespace().to_string();
        Self {
            pool,
            namespace,
            scripts: Scripts {
                add: redis::Script::new(ADD_SCRIPT),
                dequeue: redis::Script::new(DEQUEUE_SCRIPT),
                finish: redis::Script::new(FINISH_SCRIPT),
                remove: redis::Script::new(REMOVE_SCRIPT),
                retry_failed: redis::Script::new(RETRY_FAILED_SCRIPT),
                progress: redis::Script::new(PROGRESS_SCRIPT),
                clean: redis::Script::new(CLEAN_SCRIPT),
            },
        }
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.namespace, queue)
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(redis::aio::MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let start = Instant::now();
        let result = self.pool.execute(f).await;
        StoreMetrics::record_latency(BACKEND, operation, start.elapsed().as_secs_f64());
        result.map_err(|e| {
            StoreMetrics::record_error(BACKEND, operation);
            tracing::warn!(operation, error = %e, "Redis job store operation failed");
            StoreError::from(e)
        })
    }

    async fn load_many(&self, queue: &str, ids: Vec<String>) -> Result<Vec<Job>, StoreError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let keys = self.keys(queue);
        let job_keys: Vec<String> = ids.iter().map(|id| keys.job(id)).collect();

        let hashes: Vec<HashMap<String, String>> = self
            .run("load", |mut conn| async move {
                let mut pipe = redis::pipe();
                for key in &job_keys {
                    pipe.hgetall(key);
                }
                pipe.query_async(&mut conn).await
            })
            .await?;

        hashes
            .into_iter()
            .zip(ids)
            .filter(|(fields, _)| !fields.is_empty())
            .map(|(fields, id)| decode_job(&keys.job(&id), fields))
            .collect()
    }
}

fn ms(dt: DateTime<Utc>) -> String {
    dt.timestamp_millis().to_string()
}

/// Flatten a job into hash fields. Absent optionals are simply omitted.
fn encode_job(job: &Job) -> Result<Vec<(&'static str, String)>, StoreError> {
    let mut fields = vec![
        ("id", job.id.clone()),
        ("queue", job.queue.clone()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("priority", job.priority.as_str().to_string()),
        ("rank", job.priority.rank().to_string()),
        ("state", job.state.as_str().to_string()),
        ("attempts_made", job.attempts_made.to_string()),
        ("attempts_max", job.attempts_max.to_string()),
        ("backoff", serde_json::to_string(&job.backoff)?),
        ("timeout_ms", job.timeout_ms.to_string()),
        ("created_at", ms(job.created_at)),
    ];

    if let Some(at) = job.processed_at {
        fields.push(("processed_at", ms(at)));
    }
    if let Some(at) = job.finished_at {
        fields.push(("finished_at", ms(at)));
    }
    if let Some(at) = job.delay_until {
        fields.push(("delay_until", ms(at)));
    }
    if let Some(progress) = &job.progress {
        fields.push(("progress", serde_json::to_string(progress)?));
    }
    if let Some(result) = &job.result {
        fields.push(("result", serde_json::to_string(result)?));
    }
    if let Some(failure) = &job.failure {
        fields.push(("failure", serde_json::to_string(failure)?));
    }
    if job.state == JobState::Active {
        if let Some(at) = job.lock_until {
            fields.push(("lock_until", ms(at)));
        }
        if let Some(token) = &job.lock_token {
            fields.push(("lock_token", token.clone()));
        }
    }
    Ok(fields)
}

fn decode_job(key: &str, mut fields: HashMap<String, String>) -> Result<Job, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };

    let mut take = |name: &str| -> Result<String, StoreError> {
        fields
            .remove(name)
            .ok_or_else(|| corrupt(format!("missing field '{}'", name)))
    };

    fn parse<T: FromStr>(name: &str, raw: &str) -> Result<T, String> {
        raw.parse::<T>()
            .map_err(|_| format!("invalid value for '{}': {}", name, raw))
    }

    fn timestamp(name: &str, raw: &str) -> Result<DateTime<Utc>, String> {
        let millis: i64 = parse(name, raw)?;
        DateTime::from_timestamp_millis(millis).ok_or_else(|| format!("'{}' out of range", name))
    }

    let id = take("id")?;
    let queue = take("queue")?;
    let payload = serde_json::from_str(&take("payload")?)?;
    let priority = Priority::from_str(&take("priority")?).map_err(corrupt)?;
    let state = JobState::from_str(&take("state")?).map_err(corrupt)?;
    let attempts_made = parse("attempts_made", &take("attempts_made")?).map_err(corrupt)?;
    let attempts_max = parse("attempts_max", &take("attempts_max")?).map_err(corrupt)?;
    let backoff = serde_json::from_str(&take("backoff")?)?;
    let timeout_ms = parse("timeout_ms", &take("timeout_ms")?).map_err(corrupt)?;
    let created_at = timestamp("created_at", &take("created_at")?).map_err(corrupt)?;

    let optional_time = |fields: &mut HashMap<String, String>, name: &str| {
        fields
            .remove(name)
            .map(|raw| timestamp(name, &raw))
            .transpose()
            .map_err(corrupt)
    };

    let processed_at = optional_time(&mut fields, "processed_at")?;
    let finished_at = optional_time(&mut fields, "finished_at")?;
    let delay_until = optional_time(&mut fields, "delay_until")?;
    let lock_until = optional_time(&mut fields, "lock_until")?;

    let progress: Option<Progress> = fields
        .remove("progress")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    let result = fields
        .remove("result")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    let failure = fields
        .remove("failure")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(Job {
        id,
        queue,
        payload,
        priority,
        state,
        attempts_made,
        attempts_max,
        backoff,
        timeout_ms,
        created_at,
        processed_at,
        finished_at,
        delay_until,
        progress,
        result,
        failure,
        lock_until,
        lock_token: fields.remove("lock_token"),
    })
}

#[async_trait]
impl JobStore for RedisJobStore {
    fn backend_type(&self) -> &'static str {
        BACKEND
    }

    async fn add(&self, job: &Job) -> Result<AddOutcome, StoreError> {
        let keys = self.keys(&job.queue);
        let fields = encode_job(job)?;
        let due = match job.state {
            JobState::Delayed => job
                .delay_until
                .map(|d| d.timestamp_millis())
                .unwrap_or_default(),
            _ => 0,
        };

        let mut invocation = self.scripts.add.key(keys.job(&job.id));
        invocation
            .key(keys.set("wait"))
            .key(keys.set("delayed"))
            .key(keys.set("seq"))
            .arg(&job.id)
            .arg(job.priority.rank())
            .arg(due);
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }

        let added: i64 = self
            .run("add", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        Ok(if added == 1 {
            AddOutcome::Added
        } else {
            AddOutcome::Duplicate
        })
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<Job>, StoreError> {
        let key = self.keys(queue).job(id);
        let lookup = key.clone();
        let fields: HashMap<String, String> = self
            .run("get", |mut conn| async move {
                redis::cmd("HGETALL").arg(&lookup).query_async(&mut conn).await
            })
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(&key, fields).map(Some)
    }

    async fn remove(&self, queue: &str, id: &str) -> Result<Option<JobState>, StoreError> {
        let keys = self.keys(queue);
        let mut invocation = self.scripts.remove.key(keys.job(id));
        invocation
            .key(keys.set("wait"))
            .key(keys.set("delayed"))
            .key(keys.set("active"))
            .arg(id);

        let state: Option<String> = self
            .run("remove", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        state
            .map(|s| {
                JobState::from_str(&s).map_err(|reason| StoreError::Corrupt {
                    key: keys.job(id),
                    reason,
                })
            })
            .transpose()
    }

    async fn dequeue(&self, queue: &str, lock_grace: Duration) -> Result<Option<Job>, StoreError> {
        let keys = self.keys(queue);
        let token = uuid::Uuid::new_v4().to_string();
        let mut invocation = self.scripts.dequeue.key(keys.set("wait"));
        invocation
            .key(keys.set("delayed"))
            .key(keys.set("active"))
            .key(keys.set("paused"))
            .key(keys.set("seq"))
            .arg(Utc::now().timestamp_millis())
            .arg(lock_grace.as_millis() as u64)
            .arg(keys.job_prefix())
            .arg(&token);

        let fields: Option<HashMap<String, String>> = self
            .run("dequeue", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;

        match fields {
            Some(fields) => {
                let key = fields
                    .get("id")
                    .map(|id| keys.job(id))
                    .unwrap_or_else(|| keys.job_prefix());
                decode_job(&key, fields).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn finish(&self, job: &Job, keep: usize) -> Result<bool, StoreError> {
        let Some(token) = job.lock_token.as_deref() else {
            return Ok(false);
        };
        let keys = self.keys(&job.queue);

        let mut record = job.clone();
        if record.state != JobState::Active {
            record.lock_until = None;
            record.lock_token = None;
        }
        let fields = encode_job(&record)?;

        let score = match job.state {
            JobState::Delayed => job
                .delay_until
                .map(|d| d.timestamp_millis())
                .unwrap_or_default(),
            _ => job
                .finished_at
                .unwrap_or_else(Utc::now)
                .timestamp_millis(),
        };

        let mut invocation = self.scripts.finish.key(keys.job(&job.id));
        invocation
            .key(keys.set("active"))
            .key(keys.set("wait"))
            .key(keys.set("delayed"))
            .key(keys.set("completed"))
            .key(keys.set("failed"))
            .key(keys.set("seq"))
            .arg(&job.id)
            .arg(token)
            .arg(job.state.as_str())
            .arg(score)
            .arg(job.priority.rank())
            .arg(keep)
            .arg(keys.job_prefix());
        for (name, value) in &fields {
            invocation.arg(*name).arg(value);
        }

        let written: i64 = self
            .run("finish", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(written == 1)
    }

    async fn update_progress(
        &self,
        queue: &str,
        id: &str,
        progress: &Progress,
    ) -> Result<bool, StoreError> {
        let encoded = serde_json::to_string(progress)?;
        let mut invocation = self.scripts.progress.key(self.keys(queue).job(id));
        invocation.arg(encoded);

        let updated: i64 = self
            .run("update_progress", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(updated == 1)
    }

    async fn retry_failed(&self, queue: &str, id: &str) -> Result<bool, StoreError> {
        let keys = self.keys(queue);
        let mut invocation = self.scripts.retry_failed.key(keys.job(id));
        invocation
            .key(keys.set("failed"))
            .key(keys.set("wait"))
            .key(keys.set("seq"))
            .arg(id);

        let moved: i64 = self
            .run("retry_failed", |mut conn| async move {
                invocation.invoke_async(&mut conn).await
            })
            .await?;
        Ok(moved == 1)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, StoreError> {
        let keys = self.keys(queue);
        let names = [
            keys.set("wait"),
            keys.set("active"),
            keys.set("completed"),
            keys.set("failed"),
            keys.set("delayed"),
            keys.set("paused"),
        ];

        let (waiting, active, completed, failed, delayed, paused): (u64, u64, u64, u64, u64, bool) =
            self.run("counts", |mut conn| async move {
                redis::pipe()
                    .zcard(&names[0])
                    .zcard(&names[1])
                    .zcard(&names[2])
                    .zcard(&names[3])
                    .zcard(&names[4])
                    .exists(&names[5])
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(JobCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused: if paused { waiting } else { 0 },
        })
    }

    async fn list_failed(
        &self,
        queue: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<Job>, StoreError> {
        // ZREVRANGE takes signed 64-bit indices
        let max = i64::MAX as usize;
        if end < start || start > max {
            return Ok(vec![]);
        }
        let end = end.min(max);
        let key = self.keys(queue).set("failed");
        let ids: Vec<String> = self
            .run("list_failed", |mut conn| async move {
                redis::cmd("ZREVRANGE")
                    .arg(&key)
                    .arg(start)
                    .arg(end)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        self.load_many(queue, ids).await
    }

    async fn clean(
        &self,
        queue: &str,
        state: JobState,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobId>, StoreError> {
        if !state.is_terminal() || limit == 0 {
            return Ok(vec![]);
        }
        let keys = self.keys(queue);
        let mut invocation = self.scripts.clean.key(keys.set(state.as_str()));
        invocation
            .arg(older_than.timestamp_millis())
            .arg(limit)
            .arg(keys.job_prefix());

        self.run("clean", |mut conn| async move {
            invocation.invoke_async(&mut conn).await
        })
        .await
    }

    async fn pause(&self, queue: &str) -> Result<(), StoreError> {
        let key = self.keys(queue).set("paused");
        self.run("pause", |mut conn| async move {
            redis::cmd("SET").arg(&key).arg("1").query_async(&mut conn).await
        })
        .await
    }

    async fn resume(&self, queue: &str) -> Result<(), StoreError> {
        let key = self.keys(queue).set("paused");
        self.run("resume", |mut conn| async move {
            redis::cmd("DEL").arg(&key).query_async(&mut conn).await
        })
        .await
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        let key = self.keys(queue).set("paused");
        self.run("is_paused", |mut conn| async move {
            redis::cmd("EXISTS").arg(&key).query_async(&mut conn).await
        })
        .await
    }

    async fn stalled(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let key = self.keys(queue).set("active");
        let cutoff = now.timestamp_millis();
        let ids: Vec<String> = self
            .run("stalled", |mut conn| async move {
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg("-inf")
                    .arg(format!("({}", cutoff))
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        self.load_many(queue, ids).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.pool.ping().await.map_err(StoreError::from)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedisConfig;
    use crate::queue::job::{FailureKind, JobFailure, JobOptions};
    use crate::queue::payload::tests::sample_bulk_payload;
    use crate::queue::registry::QueueRegistry;

    fn sample_job() -> Job {
        let registry = QueueRegistry::with_defaults();
        let policy = registry.get_queue_config("bulk-message").unwrap();
        Job::new(policy, sample_bulk_payload(2), &JobOptions::default(), Utc::now())
    }

    fn to_map(fields: Vec<(&'static str, String)>) -> HashMap<String, String> {
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_keys_share_hash_tag() {
        let keys = QueueKeys::new("ara:tasks", "bulk-message");
        assert_eq!(keys.set("wait"), "ara:tasks:{bulk-message}:wait");
        assert_eq!(keys.job("j1"), "ara:tasks:{bulk-message}:job:j1");
        assert!(keys.job("j1").starts_with(&keys.job_prefix()));
    }

    #[test]
    fn test_job_hash_codec() {
        let mut job = sample_job();
        job.activate(Utc::now(), Duration::from_secs(30), "token-1".into());
        job.progress = Some(Progress::Percent(50.0));

        let decoded = decode_job("k", to_map(encode_job(&job).unwrap())).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.state, JobState::Active);
        assert_eq!(decoded.lock_token.as_deref(), Some("token-1"));
        assert_eq!(decoded.progress, Some(Progress::Percent(50.0)));
        assert_eq!(decoded.payload, job.payload);
        assert_eq!(
            decoded.created_at.timestamp_millis(),
            job.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_terminal_jobs_drop_lock_fields() {
        let mut job = sample_job();
        job.activate(Utc::now(), Duration::ZERO, "token-1".into());
        job.fail_attempt(
            JobFailure {
                reason: "boom".into(),
                stack: vec!["send".into()],
                kind: FailureKind::Terminal,
                failed_at: Utc::now(),
            },
            Utc::now(),
        );

        let fields = to_map(encode_job(&job).unwrap());
        assert!(!fields.contains_key("lock_token"));
        let decoded = decode_job("k", fields).unwrap();
        assert_eq!(decoded.failed_reason(), Some("boom"));
    }

    #[test]
    fn test_missing_field_is_corrupt() {
        let mut fields = to_map(encode_job(&sample_job()).unwrap());
        fields.remove("state");
        let err = decode_job("ara:tasks:{q}:job:1", fields).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_store_lifecycle() {
        let config = RedisConfig {
            namespace: format!("test:{}", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let store = RedisJobStore::new(Arc::new(RedisPool::from_config(config).unwrap()));
        let job = sample_job();

        assert_eq!(store.add(&job).await.unwrap(), AddOutcome::Added);
        assert_eq!(store.add(&job).await.unwrap(), AddOutcome::Duplicate);

        let mut active = store
            .dequeue("bulk-message", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.id, job.id);

        active.complete(serde_json::json!({ "sent": 2 }), Utc::now());
        assert!(store.finish(&active, 10).await.unwrap());

        let counts = store.counts("bulk-message").await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_failed_page_accepts_unbounded_end() {
        let config = RedisConfig {
            namespace: format!("test:{}", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let store = RedisJobStore::new(Arc::new(RedisPool::from_config(config).unwrap()));
        store.add(&sample_job()).await.unwrap();

        let mut active = store
            .dequeue("bulk-message", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        active.fail_attempt(
            JobFailure {
                reason: "bad credentials".into(),
                stack: vec![],
                kind: FailureKind::Terminal,
                failed_at: Utc::now(),
            },
            Utc::now(),
        );
        assert!(store.finish(&active, 10).await.unwrap());

        let page = store.list_failed("bulk-message", 0, usize::MAX).await.unwrap();
        assert_eq!(page.len(), 1);
        assert!(store
            .list_failed("bulk-message", usize::MAX, usize::MAX)
            .await
            .unwrap()
            .is_empty());
    }
}
