//! SSH readiness checks.
//!
//! A node counts as usable once its SSH port accepts a connection and sends
//! a protocol banner (`SSH-2.0-...`). A listening port alone is not enough:
//! load balancers and half-booted hosts accept connections without serving
//! sshd.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::error::ProvisionError;

/// Default SSH port.
pub const SSH_PORT: u16 = 22;

/// Bytes read from the server when looking for the banner.
const BANNER_READ_LEN: usize = 100;

/// SSH readiness polling settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshWaitConfig {
    /// Port to probe.
    pub port: u16,
    /// Timeout for connecting and for reading the banner.
    pub connect_timeout: Duration,
    /// Pause after a refused or failed connection.
    pub retry_delay: Duration,
    /// Give up after this long; `None` waits indefinitely.
    pub deadline: Option<Duration>,
}

impl Default for SshWaitConfig {
    fn default() -> Self {
        Self {
            port: SSH_PORT,
            connect_timeout: Duration::from_secs(1),
            retry_delay: Duration::from_secs(1),
            deadline: None,
        }
    }
}

/// Outcome of one connection attempt.
#[derive(Debug)]
enum Probe {
    Ready,
    TimedOut,
    Failed(String),
}

async fn probe(address: &str, config: &SshWaitConfig) -> Probe {
    let mut stream = match timeout(
        config.connect_timeout,
        TcpStream::connect((address, config.port)),
    )
    .await
    {
        Err(_) => return Probe::TimedOut,
        Ok(Err(e)) => return Probe::Failed(e.to_string()),
        Ok(Ok(stream)) => stream,
    };

    let mut banner = [0u8; BANNER_READ_LEN];
    match timeout(config.connect_timeout, stream.read(&mut banner)).await {
        Err(_) => Probe::TimedOut,
        Ok(Err(e)) => Probe::Failed(e.to_string()),
        Ok(Ok(n)) if banner[..n].starts_with(b"SSH") => Probe::Ready,
        Ok(Ok(0)) => Probe::Failed("connection closed before banner".to_string()),
        Ok(Ok(n)) => Probe::Failed(format!("unexpected banner ({n} bytes)")),
    }
}

/// Block until every address in `addresses` serves an SSH banner.
///
/// Addresses are checked one after another. Timed-out attempts are retried
/// immediately; refused or failed ones after `retry_delay`.
///
/// # Errors
/// Returns [`ProvisionError::SshTimeout`] if `deadline` passes before every
/// address is ready.
pub async fn wait_for_ssh(
    addresses: &[String],
    config: SshWaitConfig,
) -> Result<(), ProvisionError> {
    let started = Instant::now();

    for address in addresses {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let (reason, pause) = match probe(address, &config).await {
                Probe::Ready => {
                    info!(address = %address, attempts = attempt, "SSH is ready");
                    break;
                }
                Probe::TimedOut => ("timed out".to_string(), false),
                Probe::Failed(reason) => (reason, true),
            };

            if let Some(deadline) = config.deadline {
                let waited = started.elapsed();
                if waited >= deadline {
                    return Err(ProvisionError::SshTimeout {
                        address: address.clone(),
                        waited,
                    });
                }
            }

            debug!(address = %address, attempt, reason = %reason, "SSH not ready, retrying");
            if pause {
                sleep(config.retry_delay).await;
            }
        }
    }

    Ok(())
}
