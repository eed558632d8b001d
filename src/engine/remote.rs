use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;

use super::{CompletionEngine, EngineError, FragmentStream, TurnRequest};

/// Client for an out-of-process completion engine speaking plain HTTP.
/// Turn responses are streamed back as a chunked body; each chunk becomes one
/// fragment.
pub struct RemoteEngine {
    client: Client,
    base_url: String,
}

impl RemoteEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, EngineError> {
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Upstream { status, body });
        }
        Ok(resp)
    }
}

#[async_trait]
impl CompletionEngine for RemoteEngine {
    async fn initialize(&self) -> Result<(), EngineError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Unavailable(format!("{url}: {e}")))?;
        Self::check(resp).await?;
        tracing::info!("connected to completion engine at {}", self.base_url);
        Ok(())
    }

    async fn start_turn(&self, turn: TurnRequest) -> Result<FragmentStream, EngineError> {
        let url = format!("{}/turns", self.base_url);
        let resp = self.client.post(&url).json(&turn).send().await?;
        let resp = Self::check(resp).await?;

        let fragments = resp.bytes_stream().filter_map(|chunk| async move {
            match chunk {
                Ok(bytes) if bytes.is_empty() => None,
                Ok(bytes) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Err(e) => Some(Err(EngineError::Stream(e.to_string()))),
            }
        });
        Ok(fragments.boxed())
    }

    async fn cancel_turn(&self, session_id: &str) {
        let url = format!("{}/turns/{}/cancel", self.base_url, session_id);
        match self.client.post(&url).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!("engine refused cancel for {session_id}: {}", resp.status());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("failed to cancel turn for {session_id}: {e}"),
        }
    }

    async fn release_session(&self, session_id: &str) {
        let url = format!("{}/sessions/{}", self.base_url, session_id);
        if let Err(e) = self.client.delete(&url).send().await {
            tracing::warn!("failed to release engine session {session_id}: {e}");
        }
    }

    async fn shutdown(&self) {
        tracing::info!("disconnected from completion engine at {}", self.base_url);
    }
}
