//! Core environment context trait for MeshClock peers.

use async_trait::async_trait;
use std::time::{Duration, SystemTime};

/// The interface a peer uses to observe and spend time.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Simulation**: `SimContext` - a virtual clock advanced by `sleep`
///
/// Logical clocks never read this; only the wall-clock column of the causal
/// log and the pacing between event-loop steps do.
#[async_trait]
pub trait MeshContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;
    
    /// Returns the wall-clock time recorded on log entries.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;
    
    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);
}
