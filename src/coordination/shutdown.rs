//! Graceful Shutdown Handler
//!
//! Ordered shutdown: stop taking intents, let the lifecycle manager finish
//! the transition in progress and write its final snapshot, then close the
//! market feed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - reduced timeouts
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for the lifecycle drain and final snapshot
    pub drain_timeout_secs: u64,
    /// Time to wait for the feed task to stop
    pub feed_close_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            feed_close_timeout_secs: 5,
        }
    }
}

impl ShutdownConfig {
    pub fn from_timeout(total_secs: u64) -> Self {
        Self {
            drain_timeout_secs: total_secs,
            feed_close_timeout_secs: (total_secs / 6).max(1),
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// Signal loop no longer forwards intents
    StoppingIntents,
    /// Waiting for the in-flight transition and final snapshot
    DrainingLifecycle,
    /// Closing the market feed
    ClosingFeed,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingIntents => write!(f, "stopping_intents"),
            ShutdownPhase::DrainingLifecycle => write!(f, "draining_lifecycle"),
            ShutdownPhase::ClosingFeed => write!(f, "closing_feed"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Shutdown errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShutdownError {
    #[error("lifecycle drain timed out after {0}s")]
    DrainTimeout(u64),
    #[error("final snapshot failed: {0}")]
    Snapshot(String),
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    requested: watch::Sender<Option<ShutdownSignal>>,
    phase: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (requested, _) = watch::channel(None);
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            requested,
            phase,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.borrow().is_some()
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown; later requests are ignored
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        let first = self.requested.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        });
        if first {
            info!("Shutdown requested: {}", signal);
        } else {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Token for tasks that must stop when shutdown is requested
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            requested: self.requested.subscribe(),
        }
    }

    /// Run the shutdown sequence.
    ///
    /// 1. Stop forwarding intents
    /// 2. Drain the lifecycle manager (waits for the in-flight transition,
    ///    then writes the final snapshot)
    /// 3. Close the market feed
    pub async fn execute<F1, F2, F3>(
        &self,
        stop_intents: F1,
        drain_lifecycle: F2,
        close_feed: F3,
    ) -> Result<(), ShutdownError>
    where
        F1: Future<Output = ()>,
        F2: Future<Output = Result<(), String>>,
        F3: Future<Output = ()>,
    {
        let start = std::time::Instant::now();
        let urgent = *self.requested.borrow() == Some(ShutdownSignal::Urgent);
        let drain_secs = if urgent {
            (self.config.drain_timeout_secs / 4).max(1)
        } else {
            self.config.drain_timeout_secs
        };
        info!("Starting graceful shutdown (drain timeout: {}s)", drain_secs);

        self.set_phase(ShutdownPhase::StoppingIntents);
        stop_intents.await;
        debug!("Intent intake stopped");

        self.set_phase(ShutdownPhase::DrainingLifecycle);
        let drained = match tokio::time::timeout(Duration::from_secs(drain_secs), drain_lifecycle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Final snapshot failed: {}", e);
                Err(ShutdownError::Snapshot(e))
            }
            Err(_) => {
                error!("Lifecycle drain timeout after {}s", drain_secs);
                Err(ShutdownError::DrainTimeout(drain_secs))
            }
        };

        self.set_phase(ShutdownPhase::ClosingFeed);
        let feed_timeout = Duration::from_secs(self.config.feed_close_timeout_secs);
        if tokio::time::timeout(feed_timeout, close_feed).await.is_err() {
            warn!(
                "Feed close timeout after {}s",
                self.config.feed_close_timeout_secs
            );
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Shutdown completed in {:?}", start.elapsed());
        drained
    }
}

/// Handle for checking shutdown status in async tasks
#[derive(Clone)]
pub struct ShutdownToken {
    requested: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.borrow().is_some()
    }

    /// Resolves once shutdown is requested, including if it already was
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.requested.borrow_and_update() {
                return signal;
            }
            if self.requested.changed().await.is_err() {
                // Coordinator dropped
                return ShutdownSignal::Urgent;
            }
        }
    }
}

/// Helper to install OS signal handlers
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ];
        for (kind, name, kind_signal) in handlers {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut stream = match signal(kind) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to install {} handler: {}", name, e);
                        return;
                    }
                };
                stream.recv().await;
                info!("Received {}", name);
                shutdown.request_shutdown(kind_signal);
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}
