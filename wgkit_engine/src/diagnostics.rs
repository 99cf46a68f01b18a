//! Session dumps on demand.

use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::info;

use crate::registry::Registry;
use crate::session::SessionSummary;

/// Describe every live session and log one line per session.
pub async fn dump(registry: &Registry) -> Vec<SessionSummary> {
    let mut summaries = Vec::new();
    for session in registry.sessions() {
        let summary = session.describe().await;
        info!(
            handle = summary.handle,
            session_id = %summary.session_id,
            state = ?summary.state,
            version = summary.version,
            transport = summary.transport,
            peers = summary.peers,
            watchdog = ?summary.watchdog,
            "Session"
        );
        summaries.push(summary);
    }
    info!(sessions = summaries.len(), "Session dump complete");
    summaries
}

/// Dump sessions whenever the process receives SIGUSR2.
#[cfg(unix)]
pub fn spawn_signal_dump(runtime: &Runtime, registry: Arc<Registry>) -> Option<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let _entered = runtime.enter();
    let mut usr2 = match signal(SignalKind::user_defined2()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(error = %e, "Unable to listen for SIGUSR2");
            return None;
        }
    };
    Some(runtime.spawn(async move {
        while usr2.recv().await.is_some() {
            dump(&registry).await;
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_dump(_runtime: &Runtime, _registry: Arc<Registry>) -> Option<JoinHandle<()>> {
    None
}
