//! Language-model client: schema-constrained filter extraction over a
//! streamed chat completion, plus suggested questions for a freshly
//! loaded schema.
//!
//! The transport hides behind [`ChatStream`] so the parsing loop can be
//! driven by scripted deltas in tests. Partial parses are surfaced as they
//! arrive: every delta that completes into valid JSON replaces the live
//! draft set, and the end of the stream yields the authoritative one.

use crate::error::{DataChatError, Result};
use crate::filters::Operator;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One filter object as produced by the extractor, before it is bound to a
/// column category.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterDraft {
    pub requirement: String,
    pub table: String,
    pub column: String,
    pub operator: Operator,
    value: Value,
}

impl FilterDraft {
    /// The extracted value as text; the model may emit numbers unquoted.
    pub fn value_string(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Transport seam for schema-constrained generation.
#[async_trait]
pub trait ChatStream: Send + Sync {
    /// Stream of content deltas for a structured generation request.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: Value,
    ) -> Result<BoxStream<'static, Result<String>>>;

    /// Non-streaming structured generation, returning the full content.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: Value,
    ) -> Result<String>;
}

pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    fn request_body(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: Value,
        stream: bool,
    ) -> Value {
        json!({
            "model": self.model,
            "stream": stream,
            "messages": messages,
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": schema_name, "schema": schema, "strict": true }
            }
        })
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(DataChatError::Llm(format!(
                "Generation request failed with {}: {}",
                status, text
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatStream for LlmClient {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: Value,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let body = self.request_body(messages, schema_name, schema, true);
        let response = self.send(&body).await?;

        // SSE framing: buffer bytes into lines, take `data:` payloads,
        // stop at [DONE], pull the content delta out of each event.
        let deltas = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(DataChatError::from))
            .scan(String::new(), |buf, chunk| {
                let mut out: Vec<Result<String>> = Vec::new();
                match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim().to_string();
                            buf.drain(..=pos);
                            let Some(data) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let data = data.trim();
                            if data.is_empty() || data == "[DONE]" {
                                continue;
                            }
                            match serde_json::from_str::<Value>(data) {
                                Ok(event) => {
                                    if let Some(content) =
                                        event["choices"][0]["delta"]["content"].as_str()
                                    {
                                        out.push(Ok(content.to_string()));
                                    }
                                }
                                Err(e) => out.push(Err(DataChatError::Llm(format!(
                                    "Bad stream event: {}",
                                    e
                                )))),
                            }
                        }
                    }
                    Err(e) => out.push(Err(e)),
                }
                futures_util::future::ready(Some(futures_util::stream::iter(out)))
            })
            .flatten();

        Ok(deltas.boxed())
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        schema_name: &str,
        schema: Value,
    ) -> Result<String> {
        let body = self.request_body(messages, schema_name, schema, false);
        let response = self.send(&body).await?;
        let payload: Value = response.json().await?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| DataChatError::Llm("No content in generation response".to_string()))
    }
}

/// JSON schema for the filter array the extractor must produce.
pub fn filter_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "filters": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "requirement": { "type": "string" },
                        "table": { "type": "string" },
                        "column": { "type": "string" },
                        "operator": { "type": "string", "enum": ["=", "!=", ">", ">=", "<", "<="] },
                        "value": { "type": "string" }
                    },
                    "required": ["requirement", "table", "column", "operator", "value"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["filters"],
        "additionalProperties": false
    })
}

/// Run a streamed extraction, invoking `observer` with the latest good
/// parse after every delta that changes it. The terminal parse is the
/// authoritative result; a stream that never parses yields an empty set.
pub async fn extract_filters<F>(
    chat: &dyn ChatStream,
    messages: &[ChatMessage],
    mut observer: F,
) -> Result<Vec<FilterDraft>>
where
    F: FnMut(&[FilterDraft]) + Send,
{
    let mut stream = chat
        .stream_chat(messages, "filters", filter_schema())
        .await?;

    let mut content = String::new();
    let mut last_good: Vec<FilterDraft> = Vec::new();
    while let Some(delta) = stream.next().await {
        match delta {
            Ok(text) => {
                content.push_str(&text);
                if let Some(drafts) = parse_filter_drafts(&content) {
                    if drafts != last_good {
                        observer(&drafts);
                        last_good = drafts;
                    }
                }
            }
            Err(e) => {
                // Reported, never retried: the last good parse stands.
                warn!(error = %e, "generation stream interrupted");
                break;
            }
        }
    }

    if last_good.is_empty() {
        debug!(received = content.len(), "stream produced no parseable filters");
    }
    Ok(last_good)
}

/// Parse possibly-truncated generation output into complete filter drafts.
/// Entries still missing required fields are dropped.
pub fn parse_filter_drafts(content: &str) -> Option<Vec<FilterDraft>> {
    let cleaned = strip_fences(content);
    let parsed: Value = match serde_json::from_str(cleaned) {
        Ok(v) => v,
        Err(_) => {
            let completed = complete_partial_json(cleaned)?;
            serde_json::from_str(&completed).ok()?
        }
    };
    let items = parsed.get("filters")?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
    )
}

/// Close an incomplete JSON document: terminate an open string, drop a
/// dangling comma, complete a dangling key with null, and close every
/// open bracket. Returns None when the input cannot be repaired (e.g.
/// mismatched brackets).
pub fn complete_partial_json(input: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    // Whether the open/last-closed string sits in key position of an
    // object, and the last structural token seen outside strings.
    let mut string_is_key = false;
    let mut last_was_string = false;
    let mut last_string_was_key = false;
    let mut last_struct = '\0';

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
                last_was_string = true;
                last_string_was_key = string_is_key;
            }
            continue;
        }
        if c.is_whitespace() {
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                string_is_key =
                    stack.last() == Some(&'}') && matches!(last_struct, '{' | ',');
            }
            '{' | '[' => {
                stack.push(if c == '{' { '}' } else { ']' });
                last_struct = c;
                last_was_string = false;
            }
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                last_struct = 'v';
                last_was_string = false;
            }
            ':' | ',' => {
                last_struct = c;
                last_was_string = false;
            }
            _ => {
                last_was_string = false;
            }
        }
    }

    let mut completed = input.to_string();
    if in_string {
        if escaped {
            completed.pop();
        }
        completed.push('"');
        if string_is_key {
            completed.push_str(": null");
        }
    } else {
        let trimmed_len = completed.trim_end().len();
        completed.truncate(trimmed_len);
        if completed.ends_with(',') {
            completed.pop();
        } else if completed.ends_with(':') {
            completed.push_str("null");
        } else if last_was_string && last_string_was_key {
            completed.push_str(": null");
        }
    }
    for closer in stack.iter().rev() {
        completed.push(*closer);
    }
    if completed.is_empty() {
        None
    } else {
        Some(completed)
    }
}

fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Suggest questions a user could answer from the current schema.
/// Supplementary, non-streaming; callers cache against a schema
/// fingerprint so it only runs when the dataset changes.
pub async fn suggest_questions(chat: &dyn ChatStream, schema_context: &str) -> Result<Vec<String>> {
    let schema = json!({
        "type": "object",
        "properties": {
            "questions": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["questions"],
        "additionalProperties": false
    });
    let messages = [
        ChatMessage::system(
            "Suggest 5 diverse, useful questions that a user can answer from this dataset using SQLite",
        ),
        ChatMessage::user(schema_context),
    ];
    let content = chat.complete(&messages, "questions", schema).await?;

    #[derive(Deserialize)]
    struct Questions {
        questions: Vec<String>,
    }
    let parsed: Questions = serde_json::from_str(strip_fences(&content))
        .map_err(|e| DataChatError::Llm(format!("Failed to parse questions: {}", e)))?;
    Ok(parsed.questions)
}
