// Redis keyspace-notification source for expired order keys

use crate::core::errors::ReconcileError;
use crate::state::listener::{KeyStream, NotificationSource};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_DELAY_MS: u64 = 1000;

/// Keyevent channel carrying expired key names for one logical database
pub fn expired_channel(db: i64) -> String {
    format!("__keyevent@{}__:expired", db)
}

/// Subscribes to Redis expiry keyevents.
///
/// Delivery is at-most-once: events published while no subscription is
/// active are gone, which the periodic sweep covers.
pub struct RedisNotificationSource {
    client: Client,
    connection_manager: ConnectionManager,
    connect_timeout: Duration,
}

impl RedisNotificationSource {
    /// Connect with retry (linear backoff) and verify with PING.
    pub async fn new(redis_url: &str, connect_timeout: Duration) -> Result<Self, ReconcileError> {
        let mut connection_errors = Vec::new();

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                sleep(Duration::from_millis(INITIAL_DELAY_MS * attempt as u64)).await;
            }

            match Self::try_create(redis_url, connect_timeout).await {
                Ok(source) => match source.ping().await {
                    Ok(()) => {
                        if attempt > 0 {
                            info!("Redis connection succeeded on attempt {}", attempt + 1);
                        }
                        return Ok(source);
                    }
                    Err(e) => {
                        connection_errors.push(format!("Connection created but ping failed: {}", e));
                    }
                },
                Err(e) => {
                    if attempt < MAX_RETRIES - 1 {
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = MAX_RETRIES,
                            error = %e,
                            "Redis connection attempt failed, retrying..."
                        );
                    }
                    connection_errors.push(format!("Attempt {} failed: {}", attempt + 1, e));
                }
            }
        }

        Err(ReconcileError::NotificationError(format!(
            "Failed to connect to Redis at {} after {} attempts: {}",
            redis_url,
            MAX_RETRIES,
            connection_errors.join("; ")
        )))
    }

    async fn try_create(redis_url: &str, connect_timeout: Duration) -> Result<Self, ReconcileError> {
        let client = Client::open(redis_url).map_err(|e| {
            ReconcileError::ConfigurationError(format!("Invalid Redis URL format '{}': {}", redis_url, e))
        })?;

        let connection_manager = timeout(connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                ReconcileError::NotificationError(format!(
                    "Redis connection timed out after {:?}",
                    connect_timeout
                ))
            })??;

        Ok(Self {
            client,
            connection_manager,
            connect_timeout,
        })
    }

    /// Logical database selected by the connection URL
    pub fn db(&self) -> i64 {
        self.client.get_connection_info().redis.db
    }

    /// Channel for this connection's database
    pub fn channel(&self) -> String {
        expired_channel(self.db())
    }

    /// Turn on expired-key events (`notify-keyspace-events Ex`).
    ///
    /// Managed Redis often forbids CONFIG; callers should log and continue.
    pub async fn enable_keyspace_notifications(&self) -> Result<(), ReconcileError> {
        let mut conn = self.connection_manager.clone();
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await?;
        info!("Redis keyspace expiry notifications enabled");
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), ReconcileError> {
        let mut conn = self.connection_manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for RedisNotificationSource {
    async fn subscribe(&self, pattern: &str) -> Result<KeyStream, ReconcileError> {
        let mut pubsub = timeout(self.connect_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| {
                ReconcileError::NotificationError("Timed out opening pub/sub connection".to_string())
            })??;
        pubsub.psubscribe(pattern).await?;
        debug!(pattern, "Subscribed to expiry notifications");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload::<String>().map_err(ReconcileError::from));
        Ok(stream.boxed())
    }
}
