use std::fmt::Display;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON 解析错误: {0}")]
    Json(#[from] serde_json::Error),
    #[error("TOML 解析错误: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("HTTP 请求错误: {0}")]
    Http(#[from] reqwest::Error),
    #[error("数据库错误: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV 写入错误: {0}")]
    Csv(#[from] csv::Error),
    #[error("配置错误: {0}")]
    Config(String),
    #[error("Sink [{sink}] 写入失败: {message}")]
    Sink { sink: String, message: String },
    #[error("操作超时（{0} ms）")]
    Timeout(u64),
    #[error("{0}")]
    Other(String),
}

impl AppError {
    pub fn config<E: Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }

    pub fn sink<E: Display>(sink: &str, err: E) -> Self {
        Self::Sink {
            sink: sink.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_error_display() {
        let err = AppError::sink("stream", "connection refused");
        assert_eq!(err.to_string(), "Sink [stream] 写入失败: connection refused");
    }

    #[test]
    fn test_from_json_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: AppError = parse_err.into();
        assert!(matches!(err, AppError::Json(_)));
    }
}
