//! Pool-wide stop coordination.
//!
//! Whoever triggers first (a signal, a worker whose task budget ran out, the
//! pool itself) records the reason, closes every registered session and
//! cancels the token that worker loops and the pool wait on.

use bashtasks_transport::Session;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal(&'static str),
    /// The worker in `slot` finished its task budget
    TaskBudgetExhausted { slot: usize },
    /// Every worker loop ended on its own
    AllWorkersExited,
    /// Requested programmatically
    Requested,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::TaskBudgetExhausted { slot } => {
                write!(f, "worker {} exhausted its task budget", slot)
            }
            ShutdownReason::AllWorkersExited => write!(f, "all workers exited"),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
        }
    }
}

#[derive(Default)]
struct Registry {
    reason: Option<ShutdownReason>,
    sessions: Vec<(usize, Arc<dyn Session>)>,
}

#[derive(Default)]
pub struct ShutdownContext {
    token: CancellationToken,
    registry: Mutex<Registry>,
}

impl ShutdownContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the session of worker `slot` so a trigger can close it.
    ///
    /// Returns `false` when shutdown already started; the session is closed
    /// right away in that case.
    pub async fn register(&self, slot: usize, session: Arc<dyn Session>) -> bool {
        let rejected = {
            let mut registry = self.registry.lock();
            if registry.reason.is_some() {
                Some(session)
            } else {
                registry.sessions.push((slot, session));
                None
            }
        };

        match rejected {
            Some(session) => {
                debug!(slot, "Shutdown in progress, closing new session");
                close_session(slot, session.as_ref()).await;
                false
            }
            None => true,
        }
    }

    pub fn deregister(&self, slot: usize) -> Option<Arc<dyn Session>> {
        let mut registry = self.registry.lock();
        let index = registry.sessions.iter().position(|(s, _)| *s == slot)?;
        Some(registry.sessions.swap_remove(index).1)
    }

    /// Start shutdown. Only the first call has an effect and returns `true`.
    pub async fn trigger(&self, reason: ShutdownReason) -> bool {
        let sessions = {
            let mut registry = self.registry.lock();
            if registry.reason.is_some() {
                return false;
            }
            registry.reason = Some(reason.clone());
            std::mem::take(&mut registry.sessions)
        };

        info!(reason = %reason, sessions = sessions.len(), "Stopping all workers");

        for (slot, session) in &sessions {
            close_session(*slot, session.as_ref()).await;
        }
        self.token.cancel();

        info!("Stopped all sessions");
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.registry.lock().reason.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.registry.lock().reason.is_some()
    }

    /// Resolves once a trigger has closed every registered session
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn registered(&self) -> usize {
        self.registry.lock().sessions.len()
    }
}

async fn close_session(slot: usize, session: &dyn Session) {
    if let Err(e) = session.close().await {
        warn!(slot, error = %e, "Failed to close session");
    }
}

/// Trigger `context` on SIGINT or SIGTERM.
///
/// The listener ends once the context is triggered by anything else.
pub fn install_signal_handler(context: Arc<ShutdownContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = wait_for_signal() => match signal {
                Ok(name) => {
                    info!("Received {}, initiating graceful shutdown", name);
                    context.trigger(ShutdownReason::Signal(name)).await;
                }
                Err(e) => error!(error = %e, "Failed to install signal handlers"),
            },
            _ = context.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}
