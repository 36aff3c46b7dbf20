//! Pluggable streaming chat-completion adapter with `;`-separated model
//! preference resolution and chunk-boundary cancellation.
//!
//! Grounded in `core/llm_adapter.py`'s `LLMAdapter.generate_stream` for the
//! resolution/cancellation semantics, and the teacher's
//! `agent/llm.rs::stream_complete` for the SSE-over-`reqwest` idiom. The
//! Python version's `asyncio.Queue` consumer pattern becomes a
//! `tokio::sync::mpsc` channel the caller drains as a stream of chunks.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{LlmConfig, ModelEndpoint};
use crate::error::AdapterError;
use crate::voice::session::CancelToken;

/// One streamed item: either a text chunk or the terminal signal.
#[derive(Debug)]
pub enum StreamItem {
    Chunk(String),
    /// The provider didn't stream at all; this is the full response,
    /// delivered as a single item per spec §4.4.
    FullResponse(String),
    Done,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatCompletionMessage>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NonStreamResponse {
    choices: Vec<NonStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct NonStreamChoice {
    message: NonStreamMessage,
}

#[derive(Debug, Default, Deserialize)]
struct NonStreamMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Resolve a `;`-separated preference list against the configured model
/// registry: exact key match, then substring match, then `"replyer"`, then
/// any configured entry.
pub fn resolve_model<'a>(
    preference: &str,
    models: &'a std::collections::HashMap<String, ModelEndpoint>,
) -> Option<(&'a str, &'a ModelEndpoint)> {
    let candidates: Vec<&str> = preference
        .split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    for candidate in &candidates {
        if let Some(endpoint) = models.get(*candidate) {
            return Some((candidate, endpoint));
        }
        for (name, endpoint) in models {
            if name.contains(candidate) {
                return Some((name.as_str(), endpoint));
            }
        }
    }

    if let Some(endpoint) = models.get("replyer") {
        return Some(("replyer", endpoint));
    }
    models.iter().next().map(|(k, v)| (k.as_str(), v))
}

/// Resolve `prompt`/`model_preference` into a streamed response, forwarding
/// chunks on `tx` and honoring `cancel` at chunk boundaries. Terminates the
/// channel with [`StreamItem::Done`] in every case (success, cancellation,
/// or error — errors are logged and end the stream rather than panicking
/// the caller, matching the adapter's "propagate as a single terminal item"
/// contract via the `Result` this function itself returns).
pub async fn generate_stream(
    config: &LlmConfig,
    prompt: String,
    model_preference: &str,
    cancel: CancelToken,
    tx: mpsc::Sender<StreamItem>,
) -> Result<(), AdapterError> {
    let Some((_, endpoint)) = resolve_model(model_preference, &config.models) else {
        let _ = tx.send(StreamItem::Chunk("【Error: No LLM model available】".to_string())).await;
        let _ = tx.send(StreamItem::Done).await;
        return Ok(());
    };

    let api_key = std::env::var(&endpoint.api_key_env).unwrap_or_default();
    let client = reqwest::Client::new();
    let request = ChatRequest {
        model: &endpoint.model_id,
        messages: vec![ChatCompletionMessage {
            role: "user",
            content: prompt,
        }],
        stream: true,
    };

    let response = client
        .post(format!("{}/chat/completions", endpoint.api_base_url))
        .bearer_auth(api_key)
        .json(&request)
        .send()
        .await
        .map_err(|e| AdapterError::Transient(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let _ = tx.send(StreamItem::Done).await;
        return Err(AdapterError::Transient(format!("LLM API error ({status}): {body}")));
    }

    let content_type_streams = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(true);

    if !content_type_streams {
        // Non-streaming fallback: deliver the whole body as one item.
        let body: NonStreamResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::ProtocolDecode(e.to_string()))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let _ = tx.send(StreamItem::FullResponse(content)).await;
        let _ = tx.send(StreamItem::Done).await;
        return Ok(());
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut has_stream_chunk = false;
    let mut full_content = String::new();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            let _ = tx.send(StreamItem::Done).await;
            return Ok(());
        }

        let chunk = chunk.map_err(|e| AdapterError::Transient(e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();

            for line in event.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                if let Ok(parsed) = serde_json::from_str::<StreamResponse>(data) {
                    if let Some(content) = parsed.choices.first().and_then(|c| c.delta.content.clone()) {
                        has_stream_chunk = true;
                        full_content.push_str(&content);
                        if tx.send(StreamItem::Chunk(content)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    if !has_stream_chunk && !full_content.is_empty() {
        let _ = tx.send(StreamItem::FullResponse(full_content)).await;
    }
    let _ = tx.send(StreamItem::Done).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: &str) -> ModelEndpoint {
        ModelEndpoint {
            model_id: id.to_string(),
            api_base_url: "http://localhost".to_string(),
            api_key_env: "TEST_KEY".to_string(),
        }
    }

    #[test]
    fn resolve_model_prefers_exact_match() {
        let mut models = std::collections::HashMap::new();
        models.insert("gemini".to_string(), endpoint("gemini-pro"));
        models.insert("replyer".to_string(), endpoint("gpt"));
        let (name, _) = resolve_model("gemini;replyer", &models).unwrap();
        assert_eq!(name, "gemini");
    }

    #[test]
    fn resolve_model_falls_back_to_substring_match() {
        let mut models = std::collections::HashMap::new();
        models.insert("utils.gemini-pro".to_string(), endpoint("gemini-pro"));
        let (name, _) = resolve_model("gemini", &models).unwrap();
        assert_eq!(name, "utils.gemini-pro");
    }

    #[test]
    fn resolve_model_falls_back_to_replyer_then_any() {
        let mut models = std::collections::HashMap::new();
        models.insert("replyer".to_string(), endpoint("gpt"));
        let (name, _) = resolve_model("nonexistent", &models).unwrap();
        assert_eq!(name, "replyer");

        let mut only_other = std::collections::HashMap::new();
        only_other.insert("other".to_string(), endpoint("x"));
        let (name2, _) = resolve_model("nonexistent", &only_other).unwrap();
        assert_eq!(name2, "other");
    }

    #[test]
    fn resolve_model_returns_none_when_registry_empty() {
        let models = std::collections::HashMap::new();
        assert!(resolve_model("anything", &models).is_none());
    }
}
