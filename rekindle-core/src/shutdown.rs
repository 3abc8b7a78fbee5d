/*!
Graceful shutdown signalling.

One [`ShutdownSignal`] is shared by the background loops and the host
process. The first trigger wins and fixes the reason; later triggers are
ignored.
*/

use crate::restart::RestartReason;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Why the process is going down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT/SIGTERM or an embedding application asked to stop
    Signal,
    /// The restart policy fired
    Restart(RestartReason),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => f.write_str("signal"),
            ShutdownReason::Restart(reason) => write!(f, "restart:{reason}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown
    ///
    /// # Returns
    /// `true` if this call was the first trigger
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        if first {
            info!(reason = %reason, "Graceful shutdown requested");
        }
        self.token.cancel();
        first
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason given by the first trigger
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().copied()
    }

    /// Token cancelled when shutdown is requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait until shutdown is requested
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// Resolve on SIGINT, or SIGTERM on unix hosts
pub async fn wait_for_os_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_trigger_wins() {
        let signal = ShutdownSignal::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.cancelled().await }
        });

        assert!(!signal.is_triggered());
        assert!(signal.trigger(ShutdownReason::Restart(RestartReason::Manual)));
        assert!(!signal.trigger(ShutdownReason::Signal));

        waiter.await.unwrap();
        assert_eq!(
            signal.reason(),
            Some(ShutdownReason::Restart(RestartReason::Manual))
        );
        assert_eq!(signal.reason().unwrap().to_string(), "restart:manual");
    }
}
