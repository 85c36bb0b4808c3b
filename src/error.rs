use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataChatError {
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Import error: {0}")]
    Import(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Similarity error: {0}")]
    Similarity(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DataChatError>;
