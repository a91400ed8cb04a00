use std::fmt;
use thiserror::Error;

/// 表單驗證缺少的欄位類別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingField {
    Gender,
    Time,
    Location,
    Date,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MissingField::Gender => "gender",
            MissingField::Time => "time",
            MissingField::Location => "location",
            MissingField::Date => "date",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum LingxunError {
    #[error("Missing required field: {field}")]
    ValidationError { field: MissingField },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("{message}")]
    HttpError { status: u16, message: String },

    #[error("Stream error: {message}")]
    StreamError { message: String },

    #[error("Decode error: {message}")]
    DecodeError { message: String },

    #[error("Storage error: {message}")]
    StorageError { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for {field}: {value} ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing configuration: {field}")]
    MissingConfigError { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Input,
    Network,
    Stream,
    Storage,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl LingxunError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            LingxunError::ValidationError { .. } => ErrorCategory::Input,
            LingxunError::NetworkError { .. } | LingxunError::HttpError { .. } => {
                ErrorCategory::Network
            }
            LingxunError::StreamError { .. } | LingxunError::DecodeError { .. } => {
                ErrorCategory::Stream
            }
            LingxunError::StorageError { .. }
            | LingxunError::IoError(_)
            | LingxunError::SerializationError(_) => ErrorCategory::Storage,
            LingxunError::ConfigError { .. }
            | LingxunError::InvalidConfigValueError { .. }
            | LingxunError::MissingConfigError { .. } => ErrorCategory::Configuration,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Input => ErrorSeverity::Low,
            ErrorCategory::Network | ErrorCategory::Stream => ErrorSeverity::Medium,
            ErrorCategory::Storage => ErrorSeverity::High,
            ErrorCategory::Configuration => ErrorSeverity::Critical,
        }
    }

    /// 給終端使用者看的訊息
    pub fn user_friendly_message(&self) -> String {
        match self {
            LingxunError::ValidationError { field } => {
                format!("請填寫所有必填字段 (缺少: {})", field)
            }
            LingxunError::HttpError { message, .. } => format!("分析失敗: {}", message),
            LingxunError::NetworkError { .. } => "無法連線到分析服務".to_string(),
            LingxunError::StreamError { .. } | LingxunError::DecodeError { .. } => {
                "分析結果傳輸中斷".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Input => "性別、時間及省市區都不能為空",
            ErrorCategory::Network => "請確認後端服務已啟動且 endpoint 設定正確",
            ErrorCategory::Stream => "請重新提交分析請求",
            ErrorCategory::Storage => "請檢查歷史記錄存放目錄的權限",
            ErrorCategory::Configuration => "請檢查設定檔內容與命令列參數",
        }
    }
}

pub type Result<T> = std::result::Result<T, LingxunError>;
