pub mod controller;
pub mod decoder;
pub mod history;

pub use crate::domain::model::{AnalysisPayload, BirthForm, HistoryEntry};
pub use crate::domain::ports::{AnalysisTransport, ChunkStream, ConfigProvider, KeyValueStore};
pub use crate::utils::error::Result;
