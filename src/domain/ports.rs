use crate::domain::model::AnalysisPayload;
use crate::utils::error::Result;
use async_trait::async_trait;

/// 持久化的 key-value 存放區
pub trait KeyValueStore: Send + Sync {
    fn load(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<String>>> + Send;
    fn save(
        &self,
        key: &str,
        value: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

pub trait ConfigProvider: Send + Sync {
    fn api_endpoint(&self) -> &str;
    fn store_path(&self) -> &str;
    fn region_dataset(&self) -> Option<&str>;
}

/// 已成功開啟 (2xx) 的回應主體，逐塊讀取原始位元組。`Ok(None)` 表示串流結束。
#[async_trait]
pub trait ChunkStream: Send {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait AnalysisTransport: Send + Sync {
    /// 送出請求；非 2xx 狀態必須回傳 `HttpError`
    async fn open(&self, payload: &AnalysisPayload) -> Result<Box<dyn ChunkStream>>;
}
