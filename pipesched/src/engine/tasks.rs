use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::EngineInner;

/// Periodic work owned by a running engine.
///
/// Each task holds the engine weakly and exits once the engine is dropped or `cancellation`
/// fires.
#[derive(Debug, Clone, Copy)]
pub(super) enum BackgroundTask {
    Heartbeat,
    Reload,
}

impl BackgroundTask {
    fn interval(self, engine: &EngineInner) -> Duration {
        let interval = match self {
            Self::Heartbeat => engine.config.heartbeat_interval(),
            Self::Reload => engine.config.reload_interval(),
        };
        interval.max(Duration::from_millis(10))
    }

    pub(super) fn spawn(
        self,
        engine: Weak<EngineInner>,
        tracker: &TaskTracker,
        cancellation: CancellationToken,
    ) {
        tracker.spawn(async move {
            loop {
                let Some(delay) = engine.upgrade().map(|engine| self.interval(&engine)) else {
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let Some(engine) = engine.upgrade() else {
                            break;
                        };
                        self.tick(&engine).await;
                    }
                    _ = cancellation.cancelled() => {
                        tracing::debug!(task = ?self, "Shutting down the {self:?} task");
                        break;
                    },
                }
            }
        });
    }

    async fn tick(self, engine: &Arc<EngineInner>) {
        match self {
            Self::Heartbeat => engine.beat(),
            Self::Reload => {
                let _ = engine
                    .reload_if_changed()
                    .await
                    .inspect_err(|err| {
                        tracing::error!(?err, "Failed to reload pipeline configuration: {err}")
                    });
            }
        }
    }
}
