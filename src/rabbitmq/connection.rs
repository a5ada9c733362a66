use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
#[cfg(test)]
use mockall::automock;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info};

use crate::rabbitmq::channel::{BrokerChannel, LapinChannel};
use crate::rabbitmq::errors::{RabbitMQError, Result};

/// The connection capability the queue template depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn reconnect(&self) -> Result<()>;

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

pub struct ConnectionManager {
    uri: String,
    connection_name: String,
    connection: Mutex<Option<Arc<Connection>>>,
    max_reconnect_attempts: u32,
    reconnect_delay: Duration,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(uri: &str) -> Self {
        ConnectionManager {
            uri: uri.to_string(),
            connection_name: env!("CARGO_PKG_NAME").to_string(),
            connection: Mutex::new(None),
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_reconnect_policy(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay = Duration::from_millis(delay_ms);
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_string();
        self
    }

    fn current(&self) -> Result<Option<Arc<Connection>>> {
        self.connection
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| RabbitMQError::ConnectionError("connection lock poisoned".to_string()))
    }

    fn store(&self, connection: Option<Arc<Connection>>) -> Result<Option<Arc<Connection>>> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| RabbitMQError::ConnectionError("connection lock poisoned".to_string()))?;
        Ok(std::mem::replace(&mut *guard, connection))
    }

    async fn connect_once(&self) -> Result<Connection> {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = timeout(self.connect_timeout, Connection::connect(&self.uri, options))
            .await?
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;
        Ok(conn)
    }
}

#[async_trait]
impl AmqpConnection for ConnectionManager {
    fn is_connected(&self) -> bool {
        matches!(self.current(), Ok(Some(conn)) if conn.status().connected())
    }

    async fn reconnect(&self) -> Result<()> {
        let mut attempts = 0;

        loop {
            info!("Attempting to connect to RabbitMQ");

            match self.connect_once().await {
                Ok(conn) => {
                    info!("Successfully connected to RabbitMQ");
                    self.store(Some(Arc::new(conn)))?;
                    return Ok(());
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        "Failed to connect to RabbitMQ (attempt {}/{}): {}",
                        attempts, self.max_reconnect_attempts, err
                    );

                    if attempts >= self.max_reconnect_attempts {
                        error!("Max reconnection attempts reached. Giving up.");
                        return Err(err);
                    }

                    debug!("Waiting {:?} before next reconnect attempt", self.reconnect_delay);
                    sleep(self.reconnect_delay).await;
                }
            }
        }
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self
            .current()?
            .ok_or_else(|| RabbitMQError::ConnectionError("No active connection".to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;

        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.store(None)? {
            if conn.status().connected() {
                info!("Closing RabbitMQ connection gracefully");
                conn.close(200, "Closing connection")
                    .await
                    .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;
            }
        }
        Ok(())
    }
}
