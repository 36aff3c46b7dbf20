//! Pluggable speech-to-text adapters: `mock`, `http_batch`, and
//! `local_streaming`.
//!
//! Grounded in `core/asr_adapter.py`'s `BaseASR`/`MockASR`/`HTTPASR`/
//! `SherpaASR`. `SherpaASR`'s shared-recognizer-by-model-key cache is kept;
//! the model runtime itself is `ort` (an ONNX Runtime binding available on
//! crates.io) rather than the sherpa-onnx Python bindings, gated behind the
//! `silero` feature the same way the teacher's local model code is gated.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::AsrConfig;
use crate::error::AdapterError;

/// Uniform interface the WebSocket handler drives regardless of backend.
#[async_trait]
pub trait AsrAdapter: Send + Sync {
    async fn start_stream(&mut self) -> Result<(), AdapterError>;
    async fn push_audio_chunk(&mut self, chunk: &[u8]) -> Result<(), AdapterError>;
    /// Non-final partial transcript; empty string if nothing new.
    async fn get_partial(&mut self) -> Result<String, AdapterError>;
    /// Final transcript for the completed utterance, if any.
    async fn get_final(&mut self) -> Result<Option<String>, AdapterError>;
    async fn stop_stream(&mut self) -> Result<(), AdapterError>;
    /// Optional hook fired when VAD signals speech end, letting streaming
    /// backends flush trailing tokens before `get_final` is called.
    async fn on_speech_end(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Always returns a fixed transcript; useful for integration tests and
/// demos with no ASR backend configured.
#[derive(Debug, Default)]
pub struct MockAsr;

#[async_trait]
impl AsrAdapter for MockAsr {
    async fn start_stream(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn push_audio_chunk(&mut self, _chunk: &[u8]) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn get_partial(&mut self) -> Result<String, AdapterError> {
        Ok(String::new())
    }

    async fn get_final(&mut self) -> Result<Option<String>, AdapterError> {
        Ok(Some("测试文本: 你好 (Mock)".to_string()))
    }

    async fn stop_stream(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Buffers the whole utterance and ships it as one multipart upload on
/// `get_final`, for OpenAI/Whisper/FunASR-style non-streaming HTTP backends.
pub struct HttpBatchAsr {
    client: reqwest::Client,
    api_url: String,
    buffer: Vec<u8>,
}

impl HttpBatchAsr {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            buffer: Vec::new(),
        }
    }
}

#[derive(serde::Deserialize)]
struct AsrHttpResponse {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl AsrAdapter for HttpBatchAsr {
    async fn start_stream(&mut self) -> Result<(), AdapterError> {
        self.buffer.clear();
        Ok(())
    }

    async fn push_audio_chunk(&mut self, chunk: &[u8]) -> Result<(), AdapterError> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn get_partial(&mut self) -> Result<String, AdapterError> {
        // HTTP batch backends generally have no intermediate result.
        Ok(String::new())
    }

    async fn get_final(&mut self) -> Result<Option<String>, AdapterError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let wav = crate::voice::audio::pcm16_to_wav_bytes(&self.buffer, 16_000, 1);
        self.buffer.clear();

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| AdapterError::Misconfigured(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.api_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| AdapterError::Transient(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "[ASR] API returned non-200");
            return Ok(None);
        }
        match response.json::<AsrHttpResponse>().await {
            Ok(parsed) => Ok(Some(parsed.text)),
            Err(e) => {
                warn!(error = %e, "[ASR] failed to parse response body");
                Ok(None)
            }
        }
    }

    async fn stop_stream(&mut self) -> Result<(), AdapterError> {
        self.buffer.clear();
        Ok(())
    }
}

/// Key identifying one loaded local model: same tuple shape as the
/// original's `model_key`, so two sessions configured identically share one
/// recognizer instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModelKey {
    model_kind: String,
    tokens_path: String,
    model_path: String,
    encoder_path: String,
    decoder_path: String,
    joiner_path: String,
    num_threads: u32,
}

/// A loaded local streaming-ASR model. Inference is gated behind the
/// `silero` feature; without it this backend degrades to returning no
/// transcript rather than failing the whole call. The session is wrapped in
/// its own mutex (rather than owned exclusively like `vad.rs`'s
/// `SileroClassifier`) because, per spec §5, this handle is process-global
/// and shared read-only across every session's `LocalStreamingAsr`.
pub struct LocalModel {
    #[cfg(feature = "silero")]
    session: AsyncMutex<ort::session::Session>,
    #[cfg(feature = "silero")]
    tokens: Vec<String>,
    #[cfg(not(feature = "silero"))]
    _private: (),
}

/// Reads a sherpa-onnx-style `tokens.txt` (one `symbol id` pair per line,
/// index by line order) into a plain symbol table. A missing or unreadable
/// file degrades to an empty table rather than failing model load — CTC
/// decoding then simply yields no text instead of erroring the whole call.
#[cfg(feature = "silero")]
fn load_tokens(path: &str) -> Vec<String> {
    if path.is_empty() {
        return Vec::new();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.split_whitespace().next().unwrap_or("").to_string())
            .collect(),
        Err(e) => {
            warn!(error = %e, path, "[ASR] failed to read tokens file, decoding will yield empty text");
            Vec::new()
        }
    }
}

static SHARED_RECOGNIZERS: Lazy<AsyncMutex<HashMap<ModelKey, Arc<LocalModel>>>> =
    Lazy::new(|| AsyncMutex::new(HashMap::new()));

async fn get_or_create_shared_recognizer(
    key: ModelKey,
) -> Result<Arc<LocalModel>, AdapterError> {
    let mut registry = SHARED_RECOGNIZERS.lock().await;
    if let Some(existing) = registry.get(&key) {
        return Ok(existing.clone());
    }

    #[cfg(feature = "silero")]
    {
        let model_path = if key.model_kind == "zipformer2_ctc" {
            &key.model_path
        } else {
            &key.encoder_path
        };
        let session = ort::session::Session::builder()
            .map_err(|e| AdapterError::Misconfigured(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| AdapterError::Misconfigured(e.to_string()))?;
        let tokens = load_tokens(&key.tokens_path);
        let model = Arc::new(LocalModel {
            session: AsyncMutex::new(session),
            tokens,
        });
        registry.insert(key, model.clone());
        Ok(model)
    }
    #[cfg(not(feature = "silero"))]
    {
        Err(AdapterError::Unsupported(
            "local_streaming ASR requires the `silero` feature",
        ))
    }
}

#[cfg(feature = "silero")]
fn pcm16_bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / 32768.0)
        .collect()
}

/// Greedy CTC decode: per-frame argmax over the vocabulary, collapsing
/// repeated ids and dropping blank (id 0), the same reduction
/// `SherpaASR`'s streaming greedy search performs on its logits.
#[cfg(feature = "silero")]
fn ctc_greedy_decode(tokens: &[String], shape: &[i64], logits: &[f32]) -> String {
    if shape.len() < 3 || tokens.is_empty() {
        return String::new();
    }
    let time_steps = shape[1] as usize;
    let vocab_size = shape[2] as usize;
    if vocab_size == 0 || time_steps == 0 || logits.len() < time_steps * vocab_size {
        return String::new();
    }

    let mut result = String::new();
    let mut prev_id: Option<usize> = None;
    for t in 0..time_steps {
        let frame = &logits[t * vocab_size..(t + 1) * vocab_size];
        let (best_id, _) = frame
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        if best_id == 0 {
            prev_id = None;
            continue;
        }
        if prev_id == Some(best_id) {
            continue;
        }
        prev_id = Some(best_id);
        if let Some(token) = tokens.get(best_id) {
            match token.strip_prefix('\u{2581}') {
                Some(rest) => {
                    result.push(' ');
                    result.push_str(rest);
                }
                None => result.push_str(token),
            }
        }
    }
    result.trim().to_string()
}

/// Runs one forward pass over the accumulated waveform and greedy-decodes
/// the resulting logits, the silero-feature counterpart to `vad.rs`'s
/// `SileroClassifier::speech_probability`.
#[cfg(feature = "silero")]
async fn run_ctc_inference(model: &LocalModel, samples: &[f32]) -> Result<String, AdapterError> {
    use ort::value::Value;
    let input = Value::from_array(([1usize, samples.len()], samples.to_vec()))
        .map_err(|e| AdapterError::Transient(e.to_string()))?;
    let mut session = model.session.lock().await;
    let outputs = session
        .run(ort::inputs![input])
        .map_err(|e| AdapterError::Transient(e.to_string()))?;
    let (shape, logits) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| AdapterError::Transient(e.to_string()))?;
    Ok(ctc_greedy_decode(&model.tokens, shape, logits))
}

/// On-device streaming ASR, backed by a process-shared recognizer keyed by
/// model configuration, mirroring `SherpaASR`'s class-level cache.
pub struct LocalStreamingAsr {
    key: ModelKey,
    model: Option<Arc<LocalModel>>,
    last_result: String,
    #[cfg(feature = "silero")]
    pcm_buffer: Vec<f32>,
}

impl LocalStreamingAsr {
    pub fn new(config: &AsrConfig) -> Self {
        let model_kind = if !config.model_path.is_empty() {
            "zipformer2_ctc".to_string()
        } else {
            "transducer".to_string()
        };
        Self {
            key: ModelKey {
                model_kind,
                tokens_path: config.tokens_path.clone(),
                model_path: config.model_path.clone(),
                encoder_path: config.encoder_path.clone(),
                decoder_path: config.decoder_path.clone(),
                joiner_path: config.joiner_path.clone(),
                num_threads: config.num_threads,
            },
            model: None,
            last_result: String::new(),
            #[cfg(feature = "silero")]
            pcm_buffer: Vec::new(),
        }
    }

    /// Re-fetch the shared recognizer handle and drop whatever waveform was
    /// buffered, mirroring `_recover_stream`'s response to a decode error on
    /// a stale stream handle: start clean rather than fail the utterance.
    #[cfg(feature = "silero")]
    async fn recover_stream(&mut self) {
        self.pcm_buffer.clear();
        match get_or_create_shared_recognizer(self.key.clone()).await {
            Ok(model) => self.model = Some(model),
            Err(e) => {
                warn!(error = %e, "[ASR] local_streaming recovery failed, disabling until next start_stream");
                self.model = None;
            }
        }
    }

    #[cfg(feature = "silero")]
    async fn decode_buffered(&mut self) -> Result<String, AdapterError> {
        let Some(model) = self.model.as_ref() else {
            return Ok(String::new());
        };
        if self.pcm_buffer.is_empty() {
            return Ok(self.last_result.clone());
        }
        run_ctc_inference(model, &self.pcm_buffer).await
    }
}

#[async_trait]
impl AsrAdapter for LocalStreamingAsr {
    async fn start_stream(&mut self) -> Result<(), AdapterError> {
        self.last_result.clear();
        #[cfg(feature = "silero")]
        self.pcm_buffer.clear();
        match get_or_create_shared_recognizer(self.key.clone()).await {
            Ok(model) => {
                self.model = Some(model);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "[ASR] local_streaming model unavailable, falling back to silence");
                self.model = None;
                Ok(())
            }
        }
    }

    async fn push_audio_chunk(&mut self, _chunk: &[u8]) -> Result<(), AdapterError> {
        #[cfg(feature = "silero")]
        {
            if self.model.is_none() {
                return Ok(());
            }
            self.pcm_buffer.extend(pcm16_bytes_to_f32(_chunk));
            match self.decode_buffered().await {
                Ok(text) => self.last_result = text,
                Err(e) => {
                    warn!(error = %e, "[ASR] local_streaming decode failed, recreating stream");
                    self.recover_stream().await;
                }
            }
        }
        Ok(())
    }

    async fn get_partial(&mut self) -> Result<String, AdapterError> {
        Ok(self.last_result.clone())
    }

    async fn get_final(&mut self) -> Result<Option<String>, AdapterError> {
        if self.model.is_none() {
            return Ok(None);
        }
        if self.last_result.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.last_result.clone()))
        }
    }

    async fn on_speech_end(&mut self) -> Result<(), AdapterError> {
        // Flush any tail waveform still buffered so the final decode reflects
        // the last few frames, mirroring the streaming hook's "flush tail
        // decoding" contract from spec §4.2.
        #[cfg(feature = "silero")]
        {
            if self.model.is_some() && !self.pcm_buffer.is_empty() {
                match self.decode_buffered().await {
                    Ok(text) => self.last_result = text,
                    Err(e) => {
                        warn!(error = %e, "[ASR] local_streaming flush decode failed, recreating stream");
                        self.recover_stream().await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn stop_stream(&mut self) -> Result<(), AdapterError> {
        self.last_result.clear();
        #[cfg(feature = "silero")]
        self.pcm_buffer.clear();
        Ok(())
    }
}

/// Build the configured adapter, falling back to [`MockAsr`] if
/// `local_streaming` is selected without the model files it needs.
pub fn build_adapter(config: &AsrConfig) -> Box<dyn AsrAdapter> {
    use crate::config::AsrType;
    match config.kind {
        AsrType::Mock => Box::new(MockAsr),
        AsrType::HttpBatch => Box::new(HttpBatchAsr::new(config.api_url.clone())),
        AsrType::LocalStreaming => Box::new(LocalStreamingAsr::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_asr_returns_fixed_transcript() {
        let mut asr = MockAsr;
        asr.start_stream().await.unwrap();
        let result = asr.get_final().await.unwrap();
        assert!(result.unwrap().contains("Mock"));
    }

    #[tokio::test]
    async fn http_batch_asr_returns_none_without_audio() {
        let mut asr = HttpBatchAsr::new("http://127.0.0.1:1/asr");
        asr.start_stream().await.unwrap();
        assert_eq!(asr.get_final().await.unwrap(), None);
    }

    #[tokio::test]
    async fn local_streaming_degrades_gracefully_without_model_files() {
        let config = AsrConfig::default();
        let mut asr = LocalStreamingAsr::new(&config);
        asr.start_stream().await.unwrap();
        assert_eq!(asr.get_final().await.unwrap(), None);
    }

    #[test]
    fn build_adapter_dispatches_on_kind() {
        let mut config = AsrConfig::default();
        config.kind = crate::config::AsrType::Mock;
        let _adapter: Box<dyn AsrAdapter> = build_adapter(&config);
    }

    #[cfg(feature = "silero")]
    #[test]
    fn ctc_greedy_decode_collapses_repeats_and_drops_blank() {
        let tokens = vec![
            "<blk>".to_string(),
            "\u{2581}hi".to_string(),
            "there".to_string(),
        ];
        // time_steps=5, vocab_size=3: id1, id1 (repeat, collapsed), blank,
        // id2, blank -> "hi" then "there" with a word-boundary space.
        let shape = [1i64, 5, 3];
        let logits = [
            0.1, 0.9, 0.0, // id1
            0.1, 0.9, 0.0, // id1 repeat
            0.9, 0.1, 0.0, // blank
            0.1, 0.0, 0.9, // id2
            0.9, 0.1, 0.0, // blank
        ];
        assert_eq!(ctc_greedy_decode(&tokens, &shape, &logits), "hithere");
    }

    #[cfg(feature = "silero")]
    #[test]
    fn ctc_greedy_decode_empty_without_tokens() {
        assert_eq!(ctc_greedy_decode(&[], &[1, 2, 3], &[0.0; 6]), "");
    }
}
