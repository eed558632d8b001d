use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;

use super::{CompletionEngine, EngineError, FragmentStream, TurnRequest};

/// Development engine that streams the input back one word at a time.
pub struct EchoEngine {
    delay: Duration,
}

impl EchoEngine {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl CompletionEngine for EchoEngine {
    async fn initialize(&self) -> Result<(), EngineError> {
        tracing::info!("echo engine ready ({}ms per fragment)", self.delay.as_millis());
        Ok(())
    }

    async fn start_turn(&self, turn: TurnRequest) -> Result<FragmentStream, EngineError> {
        let words: Vec<String> = turn
            .input
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        let delay = self.delay;
        let fragments = stream::iter(words).then(move |word| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, EngineError>(word)
        });
        Ok(fragments.boxed())
    }

    async fn cancel_turn(&self, session_id: &str) {
        tracing::debug!("echo engine: cancel requested for session {session_id}");
    }

    async fn release_session(&self, session_id: &str) {
        tracing::debug!("echo engine: released session {session_id}");
    }

    async fn shutdown(&self) {
        tracing::info!("echo engine stopped");
    }
}
