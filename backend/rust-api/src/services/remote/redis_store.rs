use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::mpsc;

use super::{scope, ChangeFeed, CommandSink, RemoteError, SessionSource, IDEMPOTENCY_TTL};
use crate::metrics::track_remote_operation;
use crate::models::{
    Block, BlockStatus, ChangeEvent, ChatMode, Command, CommandEnvelope, ControlMode, FeedMessage,
    PauseReason, PlayState, RowChange, RowUpdate, Session, SessionMode, SessionStatus,
};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

/// Compare-and-set write of one row hash.
///
/// KEYS: row hash, idempotency key.
/// ARGV: table, row id, expected version ("" = unchecked), channel, ttl,
/// allowed current statuses ("" = any), then field/JSON-value pairs.
const WRITE_ROW_SCRIPT: &str = r#"
local cached = redis.call('GET', KEYS[2])
if cached then
  return cached
end
if redis.call('EXISTS', KEYS[1]) == 0 then
  return redis.error_reply('NOT_FOUND ' .. ARGV[2])
end
local current = tonumber(redis.call('HGET', KEYS[1], 'version') or '0')
if ARGV[3] ~= '' and tonumber(ARGV[3]) ~= current then
  return redis.error_reply('STALE ' .. current)
end
if ARGV[6] ~= '' then
  local status = redis.call('HGET', KEYS[1], 'status') or ''
  if not string.find('|' .. ARGV[6] .. '|', '|' .. status .. '|', 1, true) then
    return redis.error_reply('REJECTED status ' .. status)
  end
end
local fields = {}
for i = 7, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
  table.insert(fields, cjson.encode(ARGV[i]) .. ':' .. ARGV[i + 1])
end
local version = current + 1
redis.call('HSET', KEYS[1], 'version', version)
table.insert(fields, '"version":' .. version)
local event = '{"table":' .. cjson.encode(ARGV[1]) .. ',"row_id":' .. cjson.encode(ARGV[2])
  .. ',"changed_fields":{' .. table.concat(fields, ',') .. '}}'
redis.call('SET', KEYS[2], event, 'EX', tonumber(ARGV[5]))
redis.call('PUBLISH', ARGV[4], event)
return event
"#;

/// Redis-backed remote store. Rows are hashes whose fields hold JSON
/// values; the change feed is a Pub/Sub channel per session.
pub struct RedisRemoteStore {
    client: redis::Client,
    redis: ConnectionManager,
    feed_retry: RetryConfig,
}

impl RedisRemoteStore {
    pub fn new(client: redis::Client, redis: ConnectionManager, feed_retry: RetryConfig) -> Self {
        Self {
            client,
            redis,
            feed_retry,
        }
    }

    async fn write(&self, envelope: &CommandEnvelope) -> Result<RowUpdate, RemoteError> {
        let prefix = scope(envelope.mode);
        let (table, row_key, patch) = match envelope.command.patch() {
            RowChange::Session(patch) => (
                "sessions",
                session_key(&prefix, &envelope.session_id),
                to_fields(&patch)?,
            ),
            RowChange::Block { block_id, patch } => {
                ("blocks", block_key(&prefix, &block_id), to_fields(&patch)?)
            }
        };

        let script = redis::Script::new(WRITE_ROW_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(&row_key)
            .key(format!("{}:cmd:{}", prefix, envelope.command_id))
            .arg(table)
            .arg(envelope.row_id())
            .arg(
                envelope
                    .expected_version
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            )
            .arg(channel(&prefix, &envelope.session_id))
            .arg(IDEMPOTENCY_TTL.as_secs())
            .arg(allowed_statuses(&envelope.command)?);
        for (field, value) in &patch {
            invocation.arg(field).arg(value.to_string());
        }

        let mut conn = self.redis.clone();
        let raw: String = track_remote_operation(envelope.command.label(), async {
            invocation.invoke_async(&mut conn).await.map_err(map_error)
        })
        .await?;

        serde_json::from_str(&raw)
            .map_err(|e| RemoteError::Rejected(format!("malformed row update: {}", e)))
    }

    async fn read_row(
        &self,
        key: &str,
    ) -> Result<Option<serde_json::Map<String, serde_json::Value>>, RemoteError> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = conn.hgetall(key).await.map_err(map_error)?;
        if raw.is_empty() {
            return Ok(None);
        }
        let mut row = serde_json::Map::new();
        for (field, value) in raw {
            let parsed = serde_json::from_str(&value)
                .map_err(|e| RemoteError::Rejected(format!("field {} of {}: {}", field, key, e)))?;
            row.insert(field, parsed);
        }
        Ok(Some(row))
    }
}

fn session_key(prefix: &str, session_id: &str) -> String {
    format!("{}:session:{}", prefix, session_id)
}

fn block_key(prefix: &str, block_id: &str) -> String {
    format!("{}:block:{}", prefix, block_id)
}

fn block_list_key(prefix: &str, session_id: &str) -> String {
    format!("{}:session:{}:blocks", prefix, session_id)
}

fn channel(prefix: &str, session_id: &str) -> String {
    format!("{}:session:{}:events", prefix, session_id)
}

fn to_fields<T: serde::Serialize>(
    value: &T,
) -> Result<serde_json::Map<String, serde_json::Value>, RemoteError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Ok(serde_json::Map::new()),
        Err(e) => Err(RemoteError::Rejected(e.to_string())),
    }
}

/// JSON-encoded statuses a status write may start from, joined by `|`.
fn allowed_statuses(command: &Command) -> Result<String, RemoteError> {
    let Command::UpdateSessionStatus { status, .. } = command else {
        return Ok(String::new());
    };
    let all = [
        SessionStatus::Draft,
        SessionStatus::Waiting,
        SessionStatus::Active,
        SessionStatus::Paused,
        SessionStatus::Ended,
    ];
    let mut allowed = Vec::new();
    for from in all {
        if from == *status || from.can_transition_to(*status) {
            allowed.push(serde_json::to_string(&from).map_err(|e| RemoteError::Rejected(e.to_string()))?);
        }
    }
    Ok(allowed.join("|"))
}

fn map_error(err: redis::RedisError) -> RemoteError {
    classify(err.to_string())
}

/// Script errors are recognised by their reply prefix; everything else is
/// a transport problem.
fn classify(message: String) -> RemoteError {
    if message.contains("STALE") {
        let actual = message
            .split(|c: char| !c.is_ascii_digit())
            .filter(|part| !part.is_empty())
            .last()
            .and_then(|n| n.parse().ok())
            .unwrap_or_default();
        // The script only knows the row version; `with_expected` fills in
        // the other side.
        return RemoteError::Stale {
            expected: 0,
            actual,
        };
    }
    if message.contains("NOT_FOUND") {
        return RemoteError::NotFound {
            table: "rows",
            id: message,
        };
    }
    if message.contains("REJECTED") {
        return RemoteError::Rejected(message);
    }
    RemoteError::Transport(message)
}

#[async_trait]
impl CommandSink for RedisRemoteStore {
    async fn update_session_status(
        &self,
        envelope: &CommandEnvelope,
        _status: SessionStatus,
        _pause_reason: Option<PauseReason>,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await.map_err(|e| with_expected(e, envelope))
    }

    async fn update_play_state(
        &self,
        envelope: &CommandEnvelope,
        _play_state: PlayState,
        _current_block_id: Option<String>,
        _resume_phase: Option<PlayState>,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await.map_err(|e| with_expected(e, envelope))
    }

    async fn update_block_status(
        &self,
        envelope: &CommandEnvelope,
        _block_id: &str,
        _status: BlockStatus,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await.map_err(|e| with_expected(e, envelope))
    }

    async fn update_control_mode(
        &self,
        envelope: &CommandEnvelope,
        _mode: ControlMode,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await.map_err(|e| with_expected(e, envelope))
    }

    async fn update_chat_mode(
        &self,
        envelope: &CommandEnvelope,
        _mode: ChatMode,
    ) -> Result<RowUpdate, RemoteError> {
        self.write(envelope).await.map_err(|e| with_expected(e, envelope))
    }
}

fn with_expected(err: RemoteError, envelope: &CommandEnvelope) -> RemoteError {
    match err {
        RemoteError::Stale { actual, .. } => RemoteError::Stale {
            expected: envelope.expected_version.unwrap_or_default(),
            actual,
        },
        other => other,
    }
}

#[async_trait]
impl ChangeFeed for RedisRemoteStore {
    async fn subscribe(
        &self,
        session_id: &str,
        mode: SessionMode,
    ) -> Result<mpsc::Receiver<FeedMessage>, RemoteError> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let retry = self.feed_retry.clone();
        let channel = channel(&scope(mode), session_id);

        tokio::spawn(async move {
            while !tx.is_closed() {
                let connected = retry_async_with_config(retry.clone(), || async {
                    let mut pubsub = client.get_async_pubsub().await?;
                    pubsub.subscribe(&channel).await?;
                    Ok::<_, redis::RedisError>(pubsub)
                })
                .await;

                let mut pubsub = match connected {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        tracing::warn!("Change feed {} unavailable: {}", channel, e);
                        tokio::time::sleep(retry.max_backoff).await;
                        continue;
                    }
                };

                if tx.send(FeedMessage::Connected).await.is_err() {
                    break;
                }
                tracing::info!("Subscribed to change feed {}", channel);

                let mut messages = pubsub.on_message();
                loop {
                    let msg = tokio::select! {
                        _ = tx.closed() => return,
                        msg = messages.next() => msg,
                    };
                    let Some(msg) = msg else {
                        break;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            tracing::warn!("Unreadable feed payload on {}: {}", channel, e);
                            continue;
                        }
                    };
                    match serde_json::from_str::<ChangeEvent>(&payload) {
                        Ok(event) => {
                            if tx.send(FeedMessage::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!("Malformed change event on {}: {}", channel, e),
                    }
                }

                if tx
                    .send(FeedMessage::Disconnected {
                        reason: "pubsub stream ended".to_string(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                tracing::warn!("Change feed {} dropped, reconnecting", channel);
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl SessionSource for RedisRemoteStore {
    async fn fetch_session(
        &self,
        session_id: &str,
        mode: SessionMode,
    ) -> Result<Session, RemoteError> {
        track_remote_operation("fetch_session", async {
            let prefix = scope(mode);
            let mut row = self
                .read_row(&session_key(&prefix, session_id))
                .await?
                .ok_or_else(|| RemoteError::NotFound {
                    table: "sessions",
                    id: session_id.to_string(),
                })?;

            let mut conn = self.redis.clone();
            let block_ids: Vec<String> = conn
                .lrange(block_list_key(&prefix, session_id), 0, -1)
                .await
                .map_err(map_error)?;

            let mut blocks = Vec::with_capacity(block_ids.len());
            for block_id in block_ids {
                let Some(fields) = self.read_row(&block_key(&prefix, &block_id)).await? else {
                    return Err(RemoteError::NotFound {
                        table: "blocks",
                        id: block_id,
                    });
                };
                let block: Block = serde_json::from_value(serde_json::Value::Object(fields))
                    .map_err(|e| RemoteError::Rejected(format!("block {}: {}", block_id, e)))?;
                blocks.push(block);
            }
            blocks.sort_by_key(|block| block.position);

            row.insert(
                "blocks".to_string(),
                serde_json::to_value(&blocks).map_err(|e| RemoteError::Rejected(e.to_string()))?,
            );
            serde_json::from_value(serde_json::Value::Object(row))
                .map_err(|e| RemoteError::Rejected(format!("session {}: {}", session_id, e)))
        })
        .await
    }

    async fn create_session(&self, session: &Session) -> Result<(), RemoteError> {
        track_remote_operation("create_session", async {
            let prefix = scope(session.mode);
            let key = session_key(&prefix, &session.id);
            let mut conn = self.redis.clone();

            let exists: bool = conn.exists(&key).await.map_err(map_error)?;
            if exists {
                return Err(RemoteError::Rejected(format!(
                    "session {} already exists",
                    session.id
                )));
            }

            let mut fields = to_fields(session)?;
            fields.remove("blocks");

            let mut pipe = redis::pipe();
            pipe.atomic();
            for (field, value) in &fields {
                pipe.hset(&key, field, value.to_string()).ignore();
            }
            for block in &session.blocks {
                let block_fields = to_fields(block)?;
                let bkey = block_key(&prefix, &block.id);
                for (field, value) in &block_fields {
                    pipe.hset(&bkey, field, value.to_string()).ignore();
                }
                pipe.rpush(block_list_key(&prefix, &session.id), &block.id)
                    .ignore();
            }
            pipe.query_async::<()>(&mut conn).await.map_err(map_error)?;

            tracing::info!(
                "Stored draft session {} ({} blocks) in {}",
                session.id,
                session.blocks.len(),
                prefix
            );
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}
