use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("entity `{0}` not found")]
    NotFound(String),
    #[error("failed in IO")]
    IO(#[from] std::io::Error),
    #[error("argument provided is error: {0}")]
    Argument(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("yaml error")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error")]
    Json(#[from] serde_json::Error),
    #[error("invalid deny pattern")]
    Pattern(#[from] regex::Error),
    #[error("environment error: {0}")]
    Environment(String),
    #[error("sandbox error: {0}")]
    Sandbox(String),
    #[error("execution cancelled")]
    Cancelled,
}
