use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::frames::close_code;
use super::registry::SessionRegistry;
use crate::config::ReaperConfig;
use crate::engine::CompletionEngine;

/// Reclaim idle sessions older than `threshold`. Returns how many were
/// reclaimed. Streaming sessions are left alone regardless of age.
pub async fn sweep(
    sessions: &SessionRegistry,
    engine: &dyn CompletionEngine,
    threshold: Duration,
    now: Instant,
) -> usize {
    let mut reclaimed = 0;
    for session_id in sessions.all_idle_older_than(threshold, now) {
        let Some(handle) = sessions.reclaim(&session_id, threshold, now) else {
            continue;
        };
        reclaimed += 1;
        if let Err(e) = handle.close(close_code::SESSION_TIMED_OUT, "idle timeout") {
            tracing::warn!("reaper: failed to close session {session_id}: {e}");
        }
        engine.release_session(&session_id).await;
    }

    if reclaimed > 0 {
        tracing::info!("reaped {} idle session(s)", reclaimed);
    }
    reclaimed
}

/// Periodic idle sweep. Dropping the reaper does not stop it; call `stop`.
pub struct IdleReaper {
    task: JoinHandle<()>,
}

impl IdleReaper {
    pub fn spawn(
        sessions: SessionRegistry,
        engine: Arc<dyn CompletionEngine>,
        config: ReaperConfig,
    ) -> Self {
        let task = tokio::spawn(async move {
            let start = Instant::now() + config.sweep_interval;
            let mut interval = tokio::time::interval_at(start, config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sweep(&sessions, engine.as_ref(), config.idle_threshold, Instant::now()).await;
            }
        });
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
        tracing::debug!("idle reaper stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
