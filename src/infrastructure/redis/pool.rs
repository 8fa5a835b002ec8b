//! Shared Redis connection for the job store and the distributed rate limiter.
//!
//! A single multiplexed connection serves every queue. Calls go through the
//! circuit breaker; a dropped connection is discarded and re-established on
//! the next call.

use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::RwLock;

use crate::config::RedisConfig;

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RedisHealth};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Connection not available: {0}")]
    ConnectionUnavailable(String),
}

impl PoolError {
    /// Whether retrying later could succeed. Script and type errors cannot.
    pub fn is_transient(&self) -> bool {
        match self {
            PoolError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_refusal()
            }
            PoolError::CircuitOpen | PoolError::ConnectionUnavailable(_) => true,
        }
    }
}

pub struct RedisPool {
    client: Client,
    connection: RwLock<Option<MultiplexedConnection>>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<RedisHealth>,
    config: RedisConfig,
}

impl RedisPool {
    pub fn new(
        config: RedisConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        let client = Client::open(config.url().as_str())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            circuit_breaker,
            health,
            config,
        })
    }

    /// Pool with a breaker and health tracker built from the Redis settings.
    pub fn from_config(config: RedisConfig) -> Result<Self, PoolError> {
        let circuit_breaker = Arc::new(CircuitBreaker::with_config(CircuitBreakerConfig::from(
            &config,
        )));
        Self::new(config, circuit_breaker, Arc::new(RedisHealth::new()))
    }

    pub async fn get_connection(&self) -> Result<MultiplexedConnection, PoolError> {
        if !self.circuit_breaker.allow_request() {
            self.health.set_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    async fn connect(&self) -> Result<MultiplexedConnection, PoolError> {
        let mut conn_guard = self.connection.write().await;

        // Another task may have connected while we waited for the lock
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        self.health.set_reconnecting();

        match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => {
                *conn_guard = Some(conn.clone());
                self.circuit_breaker.record_success();
                self.health.set_connected();
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    db = self.config.db,
                    "Redis connection established"
                );
                Ok(conn)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                tracing::error!(error = %e, "Failed to connect to Redis");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Run a command against the shared connection, recording the outcome on
    /// the circuit breaker.
    pub async fn execute<F, T, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        let conn = self.get_connection().await?;

        match f(conn).await {
            Ok(result) => {
                self.circuit_breaker.record_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    let mut conn_guard = self.connection.write().await;
                    *conn_guard = None;
                    self.health.set_reconnecting();
                }
                // Script errors are bugs, not outages
                if e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
                    self.circuit_breaker.record_failure();
                }
                Err(PoolError::Redis(e))
            }
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn health(&self) -> &Arc<RedisHealth> {
        &self.health
    }

    /// Key prefix shared by every queue key
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Connection target without credentials, for logs.
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.config.host, self.config.port, self.config.db)
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        let _pong: String = self
            .execute(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    /// Drop the shared connection. Later calls reconnect.
    pub async fn close(&self) {
        let mut conn_guard = self.connection.write().await;
        if conn_guard.take().is_some() {
            tracing::info!(addr = %self.target(), "Redis connection released");
        }
        self.health.set_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> RedisConfig {
        RedisConfig {
            circuit_breaker_failure_threshold: 5,
            ..Default::default()
        }
    }

    #[test]
    fn test_pool_creation() {
        let pool = RedisPool::from_config(create_test_config()).unwrap();

        assert_eq!(pool.target(), "localhost:6379/0");
        assert_eq!(pool.namespace(), "ara:tasks");
        assert_eq!(pool.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn test_pool_circuit_breaker_integration() {
        let cb = Arc::new(CircuitBreaker::new());
        let health = Arc::new(RedisHealth::new());
        let pool = RedisPool::new(create_test_config(), cb.clone(), health).unwrap();

        for _ in 0..5 {
            cb.record_failure();
        }

        assert_eq!(pool.circuit_state(), CircuitState::Open);
        assert!(!pool.is_healthy());
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let cb = Arc::new(CircuitBreaker::new());
        let health = Arc::new(RedisHealth::new());
        let pool = RedisPool::new(create_test_config(), cb.clone(), health.clone()).unwrap();

        for _ in 0..5 {
            cb.record_failure();
        }

        let err = pool.get_connection().await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen));
        assert!(err.is_transient());
        assert_eq!(
            health.status(),
            super::super::RedisHealthStatus::CircuitOpen
        );
    }

    #[tokio::test]
    async fn test_close_marks_health_closed() {
        let pool = RedisPool::from_config(create_test_config()).unwrap();
        pool.close().await;
        assert_eq!(
            pool.health().status(),
            super::super::RedisHealthStatus::Closed
        );
    }
}
