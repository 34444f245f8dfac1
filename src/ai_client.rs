use log::debug;
use std::time::Duration;

/// Thin client for the downstream AI service. The only call the core makes
/// is a pause request before handing files to the processor, so image decode
/// does not compete with the GPU/CPU of the AI worker.
#[derive(Debug, Clone)]
pub struct AiClient {
    base_url: String,
    http: reqwest::Client,
}

impl AiClient {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Fire-and-forget pause. Failure to reach the AI service is ignored;
    /// ingestion never waits on it.
    pub fn pause_best_effort(&self) {
        let url = format!("{}/pause", self.base_url);
        let http = self.http.clone();

        tokio::spawn(async move {
            match http.post(&url).send().await {
                Ok(resp) => debug!("AI pause request returned {}", resp.status()),
                Err(e) => debug!("AI pause request failed (ignored): {}", e),
            }
        });
    }
}
