pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;

pub use adapters::{http::HttpTransport, store::FileStore, store::MemoryStore};
pub use config::toml_config::TomlConfig;
pub use core::controller::{AnalysisController, RequestStatus, SessionSnapshot, SubmitOutcome};
pub use core::decoder::StreamDecoder;
pub use core::history::HistoryCache;
pub use domain::model::{BirthForm, CalendarMode, Gender, LunarDate};
pub use domain::region::{RegionCascade, RegionTable};
pub use utils::error::{LingxunError, Result};
