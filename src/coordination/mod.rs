//! Coordination layer
//!
//! Ordered shutdown, signal handling and the health endpoint for the
//! long-running agent.

pub mod health;
pub mod shutdown;

pub use health::{health_router, HealthResponse, HealthState, HealthStatus};
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownSignal, ShutdownToken,
};
