//! Coordination store contract and Redis implementation
//!
//! All processes of the rig communicate exclusively through a shared
//! key/value store with pub/sub channels. Keys are namespaced
//! `"<COMPONENT>:<field>"` and JSON-encoded; commands travel on
//! `"<COMPONENT>:ACTION"` channels, notification labels on
//! `"<COMPONENT>:EVENT"`.
//!
//! The store is the command/event bus of the whole rig: a process that loses
//! it cannot function and exits immediately (there is no local fallback
//! state). Malformed stored values, on the other hand, are mere noise and
//! decode to `None`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

/// Coordination store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Broker-level failure (connection refused, protocol error, I/O)
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Value could not be JSON-encoded
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Narrow contract to the coordination store
///
/// One handle per component; `component()` names the namespace this process
/// publishes under (its `ACTION` subscription, its `EVENT` channel, its
/// `last_alive` key). Reads may address any component's keys.
#[async_trait]
pub trait Store: Send + Sync {
    /// Component namespace of this handle (e.g. `"CDSP"`, `"GPIO"`)
    fn component(&self) -> &str;

    /// Read a JSON-encoded key; missing or malformed values decode to `None`
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write a JSON-encoded key
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Publish a payload-free notification label on this component's
    /// `EVENT` channel (observers re-read the relevant keys)
    async fn publish_event(&self, event: &str) -> Result<(), StoreError>;

    /// Publish an action token on another component's `ACTION` channel
    async fn send_action(&self, dest: &str, action: &str) -> Result<(), StoreError>;

    /// Subscribe to this component's `ACTION` channel; tokens arrive on the
    /// returned channel for as long as the broker connection lives
    async fn subscribe_actions(&self) -> Result<mpsc::Receiver<String>, StoreError>;

    /// Refresh this component's `last_alive` liveness timestamp
    async fn set_alive(&self) -> Result<(), StoreError>;

    /// Whether `component` refreshed its liveness key within `max_age`
    async fn check_alive(&self, component: &str, max_age: Duration) -> Result<bool, StoreError>;

    /// Read a key as a boolean flag; anything but JSON `true` is `false`
    async fn get_flag(&self, key: &str) -> bool {
        matches!(self.get(key).await, Ok(Some(Value::Bool(true))))
    }

    /// Write a batch of `<component>:<field>` stats keys, refresh
    /// `last_stats_update`, and optionally wake observers with a `stats`
    /// event
    async fn update_stats(
        &self,
        fields: &[(&str, Value)],
        notify: bool,
    ) -> Result<(), StoreError> {
        for (field, value) in fields {
            let key = format!("{}:{}", self.component(), field);
            self.set(&key, value.clone()).await?;
        }
        let key = format!("{}:last_stats_update", self.component());
        self.set(&key, Value::from(epoch_now())).await?;
        if notify {
            self.publish_event("stats").await?;
        }
        Ok(())
    }
}

/// Current wall-clock time as fractional epoch seconds
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Redis-backed store
///
/// Commands go through a multiplexed connection (safe to share between
/// tasks); each `subscribe_actions` call opens its own pub/sub connection.
/// Any broker fault after construction is treated as fatal, matching the
/// process-wide error policy.
pub struct RedisStore {
    component: String,
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    /// Connect and ping the broker; an unreachable broker is fatal to the
    /// caller (construction is the only place this returns the error
    /// instead of exiting)
    pub async fn connect(url: &str, component: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        debug!("connected to coordination store at {}", url);
        Ok(Self {
            component: component.to_string(),
            client,
            conn,
        })
    }

    /// Log a broker fault and exit; the command/event bus is gone and there
    /// is nothing useful left for this process to do
    fn broker_fatal(&self, err: &redis::RedisError) -> ! {
        error!("coordination store unreachable: {} - exiting", err);
        std::process::exit(1);
    }
}

#[async_trait]
impl Store for RedisStore {
    fn component(&self) -> &str {
        &self.component
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .unwrap_or_else(|e| self.broker_fatal(&e));
        let Some(raw) = raw else { return Ok(None) };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                debug!("key '{}' holds malformed JSON: {}", key, e);
                Ok(None)
            },
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(&value)?;
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(encoded)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_else(|e| self.broker_fatal(&e));
        Ok(())
    }

    async fn publish_event(&self, event: &str) -> Result<(), StoreError> {
        let channel = format!("{}:EVENT", self.component);
        debug!("publishing event '{}:{}'", channel, event);
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(event)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_else(|e| self.broker_fatal(&e));
        Ok(())
    }

    async fn send_action(&self, dest: &str, action: &str) -> Result<(), StoreError> {
        let channel = format!("{}:ACTION", dest);
        debug!("sending action '{}:{}'", channel, action);
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(&channel)
            .arg(action)
            .query_async::<()>(&mut conn)
            .await
            .unwrap_or_else(|e| self.broker_fatal(&e));
        Ok(())
    }

    async fn subscribe_actions(&self) -> Result<mpsc::Receiver<String>, StoreError> {
        let channel = format!("{}:ACTION", self.component);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(action) => {
                        debug!("received action '{}'", action);
                        if tx.send(action).await.is_err() {
                            debug!("action receiver dropped - stopping listener");
                            return;
                        }
                    },
                    Err(e) => warn!("undecodable action payload: {}", e),
                }
            }
            // The subscription only ends when the broker connection drops.
            error!("action subscription '{}' lost - exiting", channel);
            std::process::exit(1);
        });
        Ok(rx)
    }

    async fn set_alive(&self) -> Result<(), StoreError> {
        let key = format!("{}:last_alive", self.component);
        self.set(&key, Value::from(epoch_now())).await
    }

    async fn check_alive(&self, component: &str, max_age: Duration) -> Result<bool, StoreError> {
        let key = format!("{}:last_alive", component);
        let last_alive = match self.get(&key).await? {
            Some(value) => value.as_f64(),
            None => {
                debug!("no '{}' key", key);
                return Ok(false);
            },
        };
        let Some(last_alive) = last_alive else {
            warn!("'{}' isn't a number", key);
            return Ok(false);
        };
        Ok(epoch_now() - last_alive < max_age.as_secs_f64())
    }
}
