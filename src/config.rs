//! Runtime configuration, read from the environment (`.env` supported
//! via `dotenv` in the binary).

use crate::error::{DataChatError, Result};
use std::env;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub similarity_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY").map_err(|_| {
            DataChatError::Config("OPENAI_API_KEY is not set".to_string())
        })?;
        let base_url =
            env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let model = env::var("OPENAI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let similarity_url = env::var("SIMILARITY_URL").ok();
        Ok(Self {
            api_key,
            base_url,
            model,
            similarity_url,
        })
    }
}
