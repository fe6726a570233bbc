use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Why a build session was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Cancelled => f.write_str("operation cancelled"),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// Cloneable cancellation signal shared by every command of a session.
///
/// The first cancellation wins; later calls keep the original reason.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<Option<CancelReason>>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Cancelled);
    }

    fn cancel_with(&self, reason: CancelReason) {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Cancel with [`CancelReason::DeadlineExceeded`] once `after` elapses.
    pub fn cancel_after(&self, after: Duration) -> JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel_with(CancelReason::DeadlineExceeded);
        })
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.state.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.state.subscribe();
        let reason = rx.wait_for(Option::is_some).await.ok().and_then(|state| *state);
        match reason {
            Some(reason) => reason,
            // The sender lives as long as `self`, so the channel cannot close here.
            None => std::future::pending().await,
        }
    }
}
