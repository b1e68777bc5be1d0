//! Process-wide shutdown signal.
//!
//! A single [`Shutdown`] is created at startup and handed to every component.
//! Cancelling it is idempotent and permanent. Per-stream scopes are derived with
//! [`Shutdown::child`]; cancelling a child never cancels its parent.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a scope that is cancelled together with `self`, but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Shutdown {
        Shutdown {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Spawn the signal listener that cancels this scope on Ctrl-C / SIGTERM.
    pub fn listen_for_signals(&self) -> tokio::task::JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                name = wait_for_signal() => {
                    tracing::info!(signal = name, "shutdown: signal");
                    shutdown.cancel();
                }
            }
        })
    }
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return "interrupt";
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => "interrupt",
            _ = term.recv() => "terminate",
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "interrupt"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn cancel_is_idempotent_and_permanent() {
        let s = Shutdown::new();
        assert!(!s.is_cancelled());
        s.cancel();
        s.cancel();
        assert!(s.is_cancelled());
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = Shutdown::new();
        let a = parent.child();
        let b = parent.child();

        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!parent.is_cancelled());

        parent.cancel();
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn clones_observe_the_same_scope() {
        let s = Shutdown::new();
        let observer = s.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });

        s.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn signal_listener_exits_when_cancelled_elsewhere() {
        let s = Shutdown::new();
        let listener = s.listen_for_signals();
        s.cancel();
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener should exit")
            .unwrap();
    }
}
