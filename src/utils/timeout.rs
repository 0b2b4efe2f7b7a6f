//! Timeout helpers shared by the handshake driver and transports.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default budget for connecting and negotiating a connection.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default delay between automatic reconnection attempts.
pub const RECONNECTION_DELAY: Duration = Duration::from_secs(1);

/// Default heal interval for instability counters.
pub const HEAL_INTERVAL: Duration = Duration::from_secs(10);

/// Run `future` with a deadline, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
