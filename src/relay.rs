use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::RelayError;
use crate::power::PowerState;

/// Address of the local peer that receives state notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
}

impl RelayTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One connection per notification: connect, write the token, close.
#[derive(Debug, Clone)]
pub struct RelayClient {
    target: RelayTarget,
    connect_timeout: Duration,
}

impl RelayClient {
    pub fn new(target: RelayTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
        }
    }

    pub async fn notify(&self, state: PowerState) -> Result<(), RelayError> {
        let addr = self.target.addr();

        let mut stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(RelayError::Connect { addr, source }),
                Err(_) => {
                    return Err(RelayError::Timeout {
                        addr,
                        timeout: self.connect_timeout,
                    });
                }
            };
        debug!("Connected to relay peer {}", addr);

        stream
            .write_all(state.token().as_bytes())
            .await
            .map_err(|source| RelayError::Write {
                addr: addr.clone(),
                source,
            })?;
        stream
            .shutdown()
            .await
            .map_err(|source| RelayError::Write {
                addr: addr.clone(),
                source,
            })?;

        info!("Relayed '{}' to {}", state.token(), addr);
        Ok(())
    }

    /// Notify in the background. A failed notification is logged and dropped.
    pub fn spawn_notify(&self, state: PowerState) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.notify(state).await {
                error!("Relay of '{}' failed: {}", state.token(), e);
            }
        })
    }
}
