use crate::domain::model::AnalysisPayload;
use crate::domain::ports::{AnalysisTransport, ChunkStream};
use crate::utils::error::{LingxunError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

/// 以 reqwest 呼叫 `/analyze/stream`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

/// 錯誤回應優先使用 JSON 的 `detail`，否則回報狀態碼
pub fn http_error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("detail")
                .and_then(|detail| detail.as_str())
                .map(str::to_string)
        })
        .filter(|detail| !detail.is_empty())
        .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()))
}

#[async_trait]
impl AnalysisTransport for HttpTransport {
    async fn open(&self, payload: &AnalysisPayload) -> Result<Box<dyn ChunkStream>> {
        tracing::debug!("POST {}", self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| LingxunError::NetworkError {
                message: e.to_string(),
            })?;

        let status = response.status();
        tracing::debug!("Analysis response status: {}", status);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LingxunError::HttpError {
                status: status.as_u16(),
                message: http_error_message(status, &body),
            });
        }

        Ok(Box::new(HttpChunkStream { response }))
    }
}

struct HttpChunkStream {
    response: Response,
}

#[async_trait]
impl ChunkStream for HttpChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let chunk = self
            .response
            .chunk()
            .await
            .map_err(|e| LingxunError::StreamError {
                message: e.to_string(),
            })?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}
