//! Challenge solving.
//!
//! The remote service gates both login and payment behind image
//! challenges. Solving is a pluggable capability so dry runs and tests
//! can bypass the real OCR service.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("challenge solver request failed: {0}")]
    Http(String),

    #[error("challenge solver returned an unusable response: {0}")]
    BadResponse(String),
}

/// Turns a challenge image into an answer string.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    async fn solve(&self, image: &[u8]) -> Result<String, SolverError>;
}

/// Posts challenge images to an OCR service over HTTP.
pub struct HttpOcrSolver {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    image: &'a str,
}

#[derive(Deserialize)]
struct OcrResponse {
    text: String,
}

impl HttpOcrSolver {
    pub fn new(url: String, timeout: Duration) -> Result<Self, SolverError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SolverError::Http(e.to_string()))?;
        Ok(Self { client, url })
    }

    pub fn with_client(url: String, client: reqwest::Client) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl ChallengeSolver for HttpOcrSolver {
    async fn solve(&self, image: &[u8]) -> Result<String, SolverError> {
        let encoded = BASE64.encode(image);
        let response = self
            .client
            .post(&self.url)
            .json(&OcrRequest { image: &encoded })
            .send()
            .await
            .map_err(|e| SolverError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(SolverError::Http(format!(
                "status {} from solver",
                response.status()
            )));
        }
        let body: OcrResponse = response
            .json()
            .await
            .map_err(|e| SolverError::BadResponse(e.to_string()))?;
        let answer = body.text.trim().to_string();
        if answer.is_empty() {
            return Err(SolverError::BadResponse("empty answer".to_string()));
        }
        debug!(len = answer.len(), "challenge solved");
        Ok(answer)
    }
}

/// Answers every challenge with a fixed string. Used by dry runs and
/// tests, where the scripted session accepts a known answer.
pub struct StaticSolver {
    answer: String,
}

impl StaticSolver {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }
}

#[async_trait]
impl ChallengeSolver for StaticSolver {
    async fn solve(&self, _image: &[u8]) -> Result<String, SolverError> {
        Ok(self.answer.clone())
    }
}
