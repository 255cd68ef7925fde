//! Connection lifecycle for one orchestration.
//!
//! Holds at most one open channel. The orchestrator reconnects through the
//! session after reboots and closes it on every exit path.

use crate::channel::{Connector, RemoteChannel};
use crate::engine::UTILITY_TIMEOUT;
use crate::error::Result;
use tracing::{debug, info, warn};

pub struct Session<'a, K: Connector> {
    connector: &'a K,
    channel: Option<K::Channel>,
    host: Option<String>,
}

impl<'a, K: Connector> Session<'a, K> {
    pub fn new(connector: &'a K) -> Self {
        Self {
            connector,
            channel: None,
            host: None,
        }
    }

    /// Host of the most recent connection, if any.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// The open channel, connecting first if needed.
    pub async fn channel(&mut self) -> Result<&mut K::Channel> {
        let channel = match self.channel.take() {
            Some(channel) => channel,
            None => self.open().await?,
        };
        Ok(self.channel.insert(channel))
    }

    /// Drop the current channel and prove a new one works.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.close().await;
        let mut channel = self.open().await?;
        if let Err(e) = channel
            .run_checked("echo 'Successfully reconnected'", UTILITY_TIMEOUT)
            .await
        {
            if let Err(close_err) = channel.close().await {
                debug!("Closing failed channel: {}", close_err);
            }
            return Err(e);
        }
        info!(host = channel.host(), "Reconnected");
        self.channel = Some(channel);
        Ok(())
    }

    /// Close the open channel. Errors are logged, never returned.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(host = channel.host(), "Failed to close channel: {}", e);
            } else {
                debug!(host = channel.host(), "Channel closed");
            }
        }
    }

    async fn open(&mut self) -> Result<K::Channel> {
        let channel = self.connector.connect().await?;
        info!(host = channel.host(), "Connected");
        self.host = Some(channel.host().to_string());
        Ok(channel)
    }
}
