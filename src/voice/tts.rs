//! Pluggable text-to-speech adapters: `mock`, `http_stream` (SoVITS-style
//! GET streaming), `ws_bidirectional` (Doubao/Volcengine binary protocol),
//! and `http_form`.
//!
//! Grounded in `core/tts_manager.py`'s `TTSManager`, using
//! [`crate::voice::doubao_protocol`] for the wire format and
//! `tokio-tungstenite` for the outbound WS client (the teacher has no direct
//! equivalent; this crate is the closest in the example pack).

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::OnceCell;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::config::TtsConfig;
use crate::error::AdapterError;
use crate::voice::doubao_protocol::{
    build_finish_connection, build_finish_session, build_start_connection, build_start_session,
    build_task_request, decode_message, EventType, MessageType, ProtocolMessage,
};

/// Single shared connection pool for every HTTP-based TTS adapter instance
/// in the process, built once from the first configured adapter's timeouts
/// and `conn_limit` (spec §5's "TTS HTTP client is a shared connection pool
/// ... guarded by a lazy-init gate", mirrored from the ASR shared-recognizer
/// registry's `once_cell` pattern).
static SHARED_HTTP_CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

fn shared_http_client(config: &TtsConfig) -> reqwest::Client {
    SHARED_HTTP_CLIENT
        .get_or_init(|| {
            let mut builder = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs_f64(config.connect_timeout_sec))
                .pool_max_idle_per_host(config.conn_limit as usize);
            builder = match config.total_timeout_sec {
                Some(total) => builder.timeout(Duration::from_secs_f64(total)),
                None => builder.read_timeout(Duration::from_secs_f64(config.read_timeout_sec)),
            };
            builder.build().unwrap_or_default()
        })
        .clone()
}


/// Uniform interface: streams raw audio bytes for one piece of text,
/// forwarding chunks on `tx` as they become available.
#[async_trait]
pub trait TtsAdapter: Send + Sync {
    async fn synthesize_stream(
        &self,
        text: &str,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), AdapterError>;
}

#[derive(Debug, Default)]
pub struct MockTts;

#[async_trait]
impl TtsAdapter for MockTts {
    async fn synthesize_stream(
        &self,
        _text: &str,
        _tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// SoVITS-style streaming GET endpoint.
pub struct HttpStreamTts {
    client: reqwest::Client,
    config: TtsConfig,
    weight_swap_supported: OnceCell<bool>,
}

impl HttpStreamTts {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            client: shared_http_client(&config),
            config,
            weight_swap_supported: OnceCell::new(),
        }
    }

    fn params(&self, text: &str, streaming_mode: bool) -> Vec<(&'static str, String)> {
        vec![
            ("text", text.to_string()),
            ("text_lang", self.config.text_lang.clone()),
            ("ref_audio_path", self.config.ref_audio_path.clone()),
            ("prompt_text", self.config.prompt_text.clone()),
            ("prompt_lang", self.config.prompt_lang.clone()),
            ("text_split_method", self.config.text_split_method.clone()),
            ("streaming_mode", streaming_mode.to_string()),
            ("media_type", "wav".to_string()),
        ]
    }

    /// Hot-swap the GPT/SoVITS model weights via the backend's optional
    /// `/set_gpt_weights` / `/set_sovits_weights` endpoints. The first 404/405
    /// permanently marks the capability unsupported for this adapter instance
    /// (spec §4.3); later calls short-circuit without hitting the network.
    pub async fn set_model(
        &self,
        gpt_weights_path: Option<&str>,
        sovits_weights_path: Option<&str>,
    ) -> Result<bool, AdapterError> {
        if let Some(&false) = self.weight_swap_supported.get() {
            return Ok(false);
        }
        let mut swapped_any = false;
        if let Some(path) = gpt_weights_path {
            swapped_any |= self.swap_weights("set_gpt_weights", path).await?;
        }
        if let Some(path) = sovits_weights_path {
            swapped_any |= self.swap_weights("set_sovits_weights", path).await?;
        }
        Ok(swapped_any)
    }

    async fn swap_weights(&self, sub_path: &str, weights_path: &str) -> Result<bool, AdapterError> {
        if let Some(&false) = self.weight_swap_supported.get() {
            return Ok(false);
        }
        let endpoint = format!("{}/{}", self.config.api_url.trim_end_matches('/'), sub_path);
        let response = self
            .client
            .get(&endpoint)
            .query(&[("weights_path", weights_path)])
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        if matches!(response.status().as_u16(), 404 | 405) {
            let _ = self.weight_swap_supported.set(false);
            return Ok(false);
        }
        let _ = self.weight_swap_supported.set(true);
        Ok(response.status().is_success())
    }
}

#[async_trait]
impl TtsAdapter for HttpStreamTts {
    async fn synthesize_stream(
        &self,
        text: &str,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), AdapterError> {
        let endpoint = format!("{}/tts", self.config.api_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&endpoint)
            .query(&self.params(text, true))
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, %body, "[TTS] SoVITS stream returned non-200");
            return Ok(());
        }

        // Re-chunk to the configured floor rather than forwarding whatever
        // boundaries the HTTP stream happens to deliver, matching
        // `_synthesize_stream_sovits`'s `resp.content.iter_chunked(chunk_size)`.
        let chunk_size = self.config.stream_chunk_size.max(1024);
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| AdapterError::Transient(e.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= chunk_size {
                let rest = buffer.split_off(chunk_size);
                if tx.send(std::mem::replace(&mut buffer, rest)).await.is_err() {
                    return Ok(());
                }
            }
        }
        if !buffer.is_empty() {
            let _ = tx.send(buffer).await;
        }
        Ok(())
    }
}

/// Multipart-upload synthesis (text + a reference WAV file + optional prompt
/// text), per spec §4.3's fourth TTS variant. Non-streaming by contract; the
/// whole response body is handed to the core as one chunk, which the
/// orchestrator's audio framer treats the same as any other adapter output.
pub struct HttpFormTts {
    client: reqwest::Client,
    config: TtsConfig,
}

impl HttpFormTts {
    pub fn new(config: TtsConfig) -> Self {
        Self {
            client: shared_http_client(&config),
            config,
        }
    }
}

#[async_trait]
impl TtsAdapter for HttpFormTts {
    async fn synthesize_stream(
        &self,
        text: &str,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), AdapterError> {
        let endpoint = format!("{}/tts", self.config.api_url.trim_end_matches('/'));

        let mut form = reqwest::multipart::Form::new()
            .text("text", text.to_string())
            .text("text_lang", self.config.text_lang.clone())
            .text("prompt_lang", self.config.prompt_lang.clone());
        if !self.config.prompt_text.is_empty() {
            form = form.text("prompt_text", self.config.prompt_text.clone());
        }
        if !self.config.ref_audio_path.is_empty() {
            let ref_bytes = tokio::fs::read(&self.config.ref_audio_path)
                .await
                .map_err(|e| AdapterError::Misconfigured(format!("reading ref_audio_path: {e}")))?;
            let part = reqwest::multipart::Part::bytes(ref_bytes)
                .file_name("reference.wav")
                .mime_str("audio/wav")
                .map_err(|e| AdapterError::Misconfigured(e.to_string()))?;
            form = form.part("ref_audio", part);
        }

        let response = self
            .client
            .post(&endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "[TTS] http_form returned non-200");
            return Ok(());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;
        let _ = tx.send(body.to_vec()).await;
        Ok(())
    }
}

/// Doubao/Volcengine bidirectional streaming TTS over a binary WS
/// sub-protocol. Misconfiguration is detected once at construction, per
/// spec §7 error kind 3, rather than re-validated per call.
pub struct WsBidirectionalTts {
    config: TtsConfig,
    config_error: Option<String>,
}

impl WsBidirectionalTts {
    pub fn new(config: TtsConfig) -> Self {
        let config_error = config.clone().normalize_and_validate().err();
        Self { config, config_error }
    }

    fn request_base(&self, session_id_for_log: &str) -> serde_json::Value {
        debug!(session_id = session_id_for_log, "[TTS] building doubao request base");
        json!({
            "user": {"uid": uuid::Uuid::new_v4().to_string()},
            "namespace": self.config.doubao_namespace,
            "req_params": {
                "speaker": self.config.doubao_voice_type,
                "audio_params": {
                    "format": self.config.doubao_audio_format,
                    "sample_rate": self.config.doubao_sample_rate,
                    "enable_timestamp": self.config.doubao_enable_timestamp,
                },
                "additions": serde_json::to_string(&json!({
                    "disable_markdown_filter": self.config.doubao_disable_markdown_filter,
                })).unwrap_or_default(),
            },
        })
    }

    fn format_protocol_error(stage: &str, message: &ProtocolMessage) -> String {
        let payload_text = payload_to_text(&message.payload);
        let mut details = format!(
            "[TTS] doubao {stage} failed: type={:?} event={} error_code={}",
            message.msg_type, message.event, message.error_code
        );
        if !payload_text.is_empty() {
            details.push_str(&format!(" payload={payload_text}"));
        }
        details
    }
}

fn payload_to_text(payload: &[u8]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    let text = String::from_utf8_lossy(payload).into_owned();
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(&text) {
        for key in ["message", "msg", "error"] {
            if let Some(value) = map.get(key).and_then(|v| v.as_str()) {
                return format!("{value} ({text})");
            }
        }
    }
    text
}

async fn receive_message<S>(ws: &mut S) -> Result<ProtocolMessage, AdapterError>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = ws
            .next()
            .await
            .ok_or_else(|| AdapterError::Transient("doubao websocket closed by server".to_string()))?
            .map_err(|e| AdapterError::Transient(format!("doubao websocket error: {e}")))?;
        match frame {
            WsMessage::Binary(data) => {
                return decode_message(&data).map_err(|e| AdapterError::ProtocolDecode(e.to_string()));
            }
            WsMessage::Close(_) => {
                return Err(AdapterError::Transient("doubao websocket closed".to_string()));
            }
            WsMessage::Text(text) => {
                return Err(AdapterError::Transient(format!(
                    "doubao websocket returned unexpected text frame: {}",
                    &text[..text.len().min(200)]
                )));
            }
            _ => continue,
        }
    }
}

async fn expect_event<S>(
    ws: &mut S,
    expected: EventType,
    stage: &str,
) -> Result<ProtocolMessage, AdapterError>
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let message = receive_message(ws).await?;
    if message.msg_type == MessageType::Error {
        return Err(AdapterError::Transient(WsBidirectionalTts::format_protocol_error(
            stage, &message,
        )));
    }
    if message.msg_type != MessageType::FullServerResponse {
        return Err(AdapterError::Transient(format!(
            "doubao {stage} unexpected message type: {:?} event={}",
            message.msg_type, message.event
        )));
    }
    if message.event == expected as i32 {
        return Ok(message);
    }
    if message.event == EventType::ConnectionFailed as i32 || message.event == EventType::SessionFailed as i32 {
        return Err(AdapterError::Transient(WsBidirectionalTts::format_protocol_error(
            stage, &message,
        )));
    }
    Err(AdapterError::Transient(format!(
        "doubao {stage} unexpected event: got={} expected={}",
        message.event, expected as i32
    )))
}

#[async_trait]
impl TtsAdapter for WsBidirectionalTts {
    async fn synthesize_stream(
        &self,
        text: &str,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), AdapterError> {
        if let Some(err) = &self.config_error {
            return Err(AdapterError::Misconfigured(err.clone()));
        }

        let mut request = self
            .config
            .api_url
            .clone()
            .into_client_request()
            .map_err(|e| AdapterError::Misconfigured(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "X-Api-App-Key",
            HeaderValue::from_str(&self.config.doubao_app_key)
                .map_err(|e| AdapterError::Misconfigured(e.to_string()))?,
        );
        headers.insert(
            "X-Api-Access-Key",
            HeaderValue::from_str(&self.config.doubao_access_key)
                .map_err(|e| AdapterError::Misconfigured(e.to_string()))?,
        );
        headers.insert(
            "X-Api-Resource-Id",
            HeaderValue::from_str(&self.config.doubao_resource_id)
                .map_err(|e| AdapterError::Misconfigured(e.to_string()))?,
        );
        headers.insert(
            "X-Api-Connect-Id",
            HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
                .map_err(|e| AdapterError::Misconfigured(e.to_string()))?,
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AdapterError::Transient(format!("doubao connect failed: {e}")))?;
        let (mut sink, mut source) = ws_stream.split();

        let session_id = uuid::Uuid::new_v4().to_string();
        let result = synthesize_doubao_session(self, &mut sink, &mut source, text, &session_id, &tx).await;

        let _ = sink.send(WsMessage::Binary(build_finish_connection())).await;
        let _ = sink.close().await;
        result
    }
}

async fn synthesize_doubao_session<Sink, Source>(
    adapter: &WsBidirectionalTts,
    sink: &mut Sink,
    source: &mut Source,
    text: &str,
    session_id: &str,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(), AdapterError>
where
    Sink: futures_util::Sink<WsMessage> + Unpin,
    Source: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    sink.send(WsMessage::Binary(build_start_connection()))
        .await
        .map_err(|_| AdapterError::Transient("failed to send start_connection".to_string()))?;
    expect_event(source, EventType::ConnectionStarted, "start_connection").await?;

    let mut start_session_payload = adapter.request_base(session_id);
    start_session_payload["event"] = json!(EventType::StartSession as i32);
    let payload_bytes = serde_json::to_vec(&start_session_payload)
        .map_err(|e| AdapterError::ProtocolDecode(e.to_string()))?;
    sink.send(WsMessage::Binary(build_start_session(session_id, payload_bytes)))
        .await
        .map_err(|_| AdapterError::Transient("failed to send start_session".to_string()))?;
    expect_event(source, EventType::SessionStarted, "start_session").await?;

    let mut task_payload = adapter.request_base(session_id);
    task_payload["event"] = json!(EventType::TaskRequest as i32);
    task_payload["req_params"]["text"] = json!(text);
    let task_bytes = serde_json::to_vec(&task_payload).map_err(|e| AdapterError::ProtocolDecode(e.to_string()))?;
    sink.send(WsMessage::Binary(build_task_request(session_id, task_bytes)))
        .await
        .map_err(|_| AdapterError::Transient("failed to send task_request".to_string()))?;
    sink.send(WsMessage::Binary(build_finish_session(session_id)))
        .await
        .map_err(|_| AdapterError::Transient("failed to send finish_session".to_string()))?;

    let mut audio_received = false;
    loop {
        let message = receive_message(source).await?;
        match message.msg_type {
            MessageType::AudioOnlyServer => {
                if !message.payload.is_empty() {
                    audio_received = true;
                    if tx.send(message.payload).await.is_err() {
                        return Ok(());
                    }
                }
            }
            MessageType::Error => {
                return Err(AdapterError::Transient(WsBidirectionalTts::format_protocol_error(
                    "streaming",
                    &message,
                )));
            }
            MessageType::FullServerResponse => {
                if message.event == EventType::SessionFinished as i32 {
                    break;
                }
                if message.event == EventType::SessionFailed as i32
                    || message.event == EventType::ConnectionFailed as i32
                {
                    return Err(AdapterError::Transient(WsBidirectionalTts::format_protocol_error(
                        "streaming",
                        &message,
                    )));
                }
                debug!(event = message.event, "[TTS] doubao non-terminal event");
            }
            other => {
                debug!(?other, "[TTS] doubao ignored frame type");
            }
        }
    }

    if !audio_received {
        return Err(AdapterError::Transient("doubao stream returned no audio payload".to_string()));
    }
    Ok(())
}

pub fn build_adapter(config: &TtsConfig) -> Box<dyn TtsAdapter> {
    use crate::config::TtsType;
    match config.kind {
        TtsType::Mock => Box::new(MockTts),
        TtsType::HttpStream => Box::new(HttpStreamTts::new(config.clone())),
        TtsType::WsBidirectional => Box::new(WsBidirectionalTts::new(config.clone())),
        TtsType::HttpForm => Box::new(HttpFormTts::new(config.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_to_text_surfaces_embedded_message_field() {
        let payload = br#"{"message": "bad request"}"#;
        let text = payload_to_text(payload);
        assert!(text.starts_with("bad request ("));
    }

    #[test]
    fn payload_to_text_passes_through_plain_text() {
        assert_eq!(payload_to_text(b"not json"), "not json");
    }

    #[test]
    fn ws_adapter_reports_misconfiguration_without_building_socket() {
        let config = TtsConfig {
            kind: crate::config::TtsType::WsBidirectional,
            ..Default::default()
        };
        let adapter = WsBidirectionalTts::new(config);
        assert!(adapter.config_error.is_some());
    }

    #[tokio::test]
    async fn mock_tts_emits_nothing() {
        let (tx, mut rx) = mpsc::channel(4);
        MockTts.synthesize_stream("hi", tx).await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn weight_swap_marks_unsupported_on_404_and_does_not_retry() {
        let config = TtsConfig {
            kind: crate::config::TtsType::HttpStream,
            api_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let adapter = HttpStreamTts::new(config);
        // Connection refused (not 404/405) leaves the capability undecided.
        let first = adapter.set_model(Some("gpt.ckpt"), None).await;
        assert!(first.is_err());
        assert!(adapter.weight_swap_supported.get().is_none());
    }
}
