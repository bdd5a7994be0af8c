use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum EmbeddingsError {
    #[error("embeddings request failed: {0}")]
    Http(String),
    #[error("embeddings service returned HTTP {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("embeddings response validation error: {0}")]
    Validation(String),
    #[error("embeddings call timed out")]
    Timeout,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    texts: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Client for the external embeddings microservice.
#[derive(Debug, Clone)]
pub struct EmbeddingsClient {
    base_url: String,
    api_token: String,
    dimension: usize,
    client: Client,
}

impl EmbeddingsClient {
    pub fn new(base_url: &str, api_token: &str, dimension: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            dimension,
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build embeddings client"),
        }
    }

    /// Embed one search text; the vector must have the configured width.
    #[instrument(level = "debug", skip_all, fields(chars = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingsError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("X-API-Token", &self.api_token)
            .json(&EmbedRequest { texts: vec![text] })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmbeddingsError::Timeout
                } else {
                    EmbeddingsError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EmbeddingsError::Api {
                status: status.as_u16(),
                detail,
            });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingsError::Validation(e.to_string()))?;

        let [embedding] = <[Vec<f32>; 1]>::try_from(parsed.embeddings).map_err(|v| {
            EmbeddingsError::Validation(format!("expected 1 embedding, got {}", v.len()))
        })?;
        if embedding.len() != self.dimension {
            return Err(EmbeddingsError::Validation(format!(
                "expected dimension {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        debug!(dimension = embedding.len(), "embedded search text");
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_embed_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("X-API-Token", "secret"))
            .and(body_partial_json(
                serde_json::json!({"texts": ["Budget deal."]}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [vec![0.25f32; 4]]
            })))
            .mount(&server)
            .await;

        let client = EmbeddingsClient::new(&server.uri(), "secret", 4);
        let embedding = client.embed("Budget deal.").await.unwrap();
        assert_eq!(embedding, vec![0.25f32; 4]);
    }

    #[tokio::test]
    async fn test_embed_wrong_dimension_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [vec![0.5f32; 3]]
            })))
            .mount(&server)
            .await;

        let client = EmbeddingsClient::new(&server.uri(), "secret", 4);
        let err = client.embed("text").await.unwrap_err();
        assert!(matches!(err, EmbeddingsError::Validation(_)));
    }

    #[tokio::test]
    async fn test_embed_wrong_count_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": []
            })))
            .mount(&server)
            .await;

        let client = EmbeddingsClient::new(&server.uri(), "secret", 4);
        assert!(client.embed("text").await.is_err());
    }

    #[tokio::test]
    async fn test_embed_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let client = EmbeddingsClient::new(&server.uri(), "secret", 4);
        assert!(matches!(
            client.embed("text").await.unwrap_err(),
            EmbeddingsError::Api { status: 500, .. }
        ));
    }
}
