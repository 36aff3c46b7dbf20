//! Configuration tree for the voice-call core.
//!
//! Loaded from TOML on disk (default path resolved via `directories`), with
//! every field defaulted to match the original plugin's `_resolve_*`
//! helpers and adapter constructors so an operator migrating an existing
//! deployment gets identical runtime behavior out of the box.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "call-core", "call-core")
}

/// Directory for downloaded model files (Silero VAD, local ASR models).
pub fn data_dir() -> Result<PathBuf> {
    let dirs = project_dirs().context("could not resolve a data directory for this platform")?;
    let dir = dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&dir).with_context(|| format!("creating data dir {:?}", dir))?;
    Ok(dir)
}

/// Default on-disk location of `config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    let dirs = project_dirs().context("could not resolve a config directory for this platform")?;
    Ok(dirs.config_dir().join("config.toml"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadMode {
    Webrtc,
    Silero,
    Energy,
}

impl Default for VadMode {
    fn default() -> Self {
        VadMode::Webrtc
    }
}

/// VAD Engine parameters. Defaults follow the original `VADManager`
/// constructor, with `speech_end_ms` overridden to the spec's explicit
/// value (see DESIGN.md Open Question #1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    pub mode: VadMode,
    pub speech_start_ms: u32,
    pub speech_end_ms: u32,
    pub min_utterance_ms: u32,
    pub max_utterance_ms: u32,
    pub pre_start_silence_tolerance_ms: u32,
    pub energy_threshold: i32,
    pub sample_rate: u32,
    pub webrtc_aggressiveness: u8,
    /// Silero model file name under `data_dir()/models`.
    pub silero_model_name: String,
    pub pre_roll_ms: Option<u32>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            mode: VadMode::default(),
            speech_start_ms: 150,
            speech_end_ms: 400,
            min_utterance_ms: 50,
            max_utterance_ms: 15_000,
            pre_start_silence_tolerance_ms: 80,
            energy_threshold: 500,
            sample_rate: 16_000,
            webrtc_aggressiveness: 2,
            silero_model_name: "silero_vad.onnx".to_string(),
            pre_roll_ms: None,
        }
    }
}

impl VadConfig {
    /// Clamp fields to the ranges the original enforced at construction time.
    pub fn normalize(&mut self) {
        self.webrtc_aggressiveness = self.webrtc_aggressiveness.min(3);
    }

    /// Preroll duration in ms, defaulting to `max(speech_start_ms + 120, 420)`
    /// as the original websocket handler computes it.
    pub fn effective_pre_roll_ms(&self) -> u32 {
        self.pre_roll_ms
            .unwrap_or_else(|| (self.speech_start_ms + 120).max(420))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrType {
    Mock,
    HttpBatch,
    LocalStreaming,
}

impl Default for AsrType {
    fn default() -> Self {
        AsrType::Mock
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    #[serde(rename = "type")]
    pub kind: AsrType,
    pub api_url: String,
    pub final_delay_ms: u32,
    /// `local_streaming` model selection (tokens/encoder/decoder/joiner or a
    /// single packaged model path, adapter-specific).
    pub model_path: String,
    pub tokens_path: String,
    pub encoder_path: String,
    pub decoder_path: String,
    pub joiner_path: String,
    pub num_threads: u32,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            kind: AsrType::default(),
            api_url: "http://127.0.0.1:10095".to_string(),
            final_delay_ms: 80,
            model_path: String::new(),
            tokens_path: String::new(),
            encoder_path: String::new(),
            decoder_path: String::new(),
            joiner_path: String::new(),
            num_threads: 1,
        }
    }
}

impl AsrConfig {
    pub fn normalize(&mut self) {
        self.final_delay_ms = self.final_delay_ms.min(1000);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsType {
    Mock,
    HttpStream,
    WsBidirectional,
    HttpForm,
}

impl Default for TtsType {
    fn default() -> Self {
        TtsType::Mock
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    #[serde(rename = "type")]
    pub kind: TtsType,
    pub api_url: String,
    pub voice_id: String,
    pub connect_timeout_sec: f64,
    pub read_timeout_sec: f64,
    pub total_timeout_sec: Option<f64>,
    pub conn_limit: u32,
    pub stream_chunk_size: usize,

    // http_stream (SoVITS-style) params
    pub text_lang: String,
    pub ref_audio_path: String,
    pub prompt_text: String,
    pub prompt_lang: String,
    pub text_split_method: String,

    // ws_bidirectional (Doubao/Volcengine) params
    pub doubao_app_key: String,
    pub doubao_access_key: String,
    pub doubao_resource_id: String,
    pub doubao_voice_type: String,
    pub doubao_namespace: String,
    pub doubao_audio_format: String,
    pub doubao_sample_rate: u32,
    pub doubao_enable_timestamp: bool,
    pub doubao_disable_markdown_filter: bool,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            kind: TtsType::default(),
            api_url: "http://127.0.0.1:9880".to_string(),
            voice_id: "default".to_string(),
            connect_timeout_sec: 3.0,
            read_timeout_sec: 20.0,
            total_timeout_sec: None,
            conn_limit: 32,
            stream_chunk_size: 8192,
            text_lang: "zh".to_string(),
            ref_audio_path: String::new(),
            prompt_text: String::new(),
            prompt_lang: "zh".to_string(),
            text_split_method: "cut5".to_string(),
            doubao_app_key: String::new(),
            doubao_access_key: String::new(),
            doubao_resource_id: String::new(),
            doubao_voice_type: String::new(),
            doubao_namespace: "BidirectionalTTS".to_string(),
            doubao_audio_format: "pcm".to_string(),
            doubao_sample_rate: 24_000,
            doubao_enable_timestamp: false,
            doubao_disable_markdown_filter: false,
        }
    }
}

impl TtsConfig {
    /// Matches `TTSManager.configure`'s clamping and the `doubao_ws`
    /// misconfiguration check (spec §7 error kind 3).
    pub fn normalize_and_validate(&mut self) -> Result<(), String> {
        self.connect_timeout_sec = self.connect_timeout_sec.max(0.2);
        self.read_timeout_sec = self.read_timeout_sec.max(0.5);
        if let Some(t) = self.total_timeout_sec {
            if t <= 0.0 {
                self.total_timeout_sec = None;
            }
        }
        self.conn_limit = self.conn_limit.max(4);
        self.stream_chunk_size = self.stream_chunk_size.max(1024);

        if self.kind == TtsType::WsBidirectional {
            let mut missing = Vec::new();
            if self.api_url.is_empty() {
                missing.push("api_url");
            }
            if self.doubao_app_key.is_empty() {
                missing.push("doubao_app_key");
            }
            if self.doubao_access_key.is_empty() {
                missing.push("doubao_access_key");
            }
            if self.doubao_resource_id.is_empty() {
                missing.push("doubao_resource_id");
            }
            if self.doubao_voice_type.is_empty() {
                missing.push("doubao_voice_type");
            }
            if !missing.is_empty() {
                return Err(format!(
                    "missing required doubao config fields: {}",
                    missing.join(", ")
                ));
            }
            if self.doubao_audio_format != "pcm" {
                return Err("doubao_audio_format must be 'pcm' in current implementation".into());
            }
        }
        Ok(())
    }
}

/// One named, reachable chat-completion backend. A deployment can register
/// several (e.g. a fast local model alongside a hosted fallback); the LLM
/// adapter resolves `;`-separated preference lists against these keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub model_id: String,
    pub api_base_url: String,
    pub api_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `;`-separated candidate list, e.g. `"utils.gemini;replyer"`.
    pub model_preference: String,
    pub history_window_messages: usize,
    pub models: std::collections::HashMap<String, ModelEndpoint>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let mut models = std::collections::HashMap::new();
        models.insert(
            "replyer".to_string(),
            ModelEndpoint {
                model_id: "openrouter/auto".to_string(),
                api_base_url: "https://openrouter.ai/api/v1".to_string(),
                api_key_env: "CALL_CORE_LLM_API_KEY".to_string(),
            },
        );
        Self {
            model_preference: "replyer".to_string(),
            history_window_messages: 12,
            models,
        }
    }
}

impl LlmConfig {
    pub fn normalize(&mut self) {
        self.history_window_messages = self.history_window_messages.clamp(2, 120);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrethinkConfig {
    pub enabled: bool,
    pub model_name: String,
    pub timeout_ms: u64,
    pub max_history_messages: usize,
    pub max_output_chars: usize,
    pub min_user_text_chars: usize,
}

impl Default for PrethinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_name: String::new(),
            timeout_ms: 600,
            max_history_messages: 10,
            max_output_chars: 220,
            min_user_text_chars: 2,
        }
    }
}

impl PrethinkConfig {
    pub fn normalize(&mut self) {
        self.timeout_ms = self.timeout_ms.max(100);
        self.max_history_messages = self.max_history_messages.max(2);
        self.max_output_chars = self.max_output_chars.max(60);
        self.min_user_text_chars = self.min_user_text_chars.max(1);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub playback_startup_buffer_ms: u32,
    pub playback_startup_max_wait_ms: u32,
    pub playback_schedule_lead_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            playback_startup_buffer_ms: 120,
            playback_startup_max_wait_ms: 120,
            playback_schedule_lead_ms: 30,
        }
    }
}

impl AudioConfig {
    pub fn normalize(&mut self) {
        self.playback_startup_buffer_ms = self.playback_startup_buffer_ms.min(1000);
        self.playback_startup_max_wait_ms = self.playback_startup_max_wait_ms.min(1000);
        self.playback_schedule_lead_ms = self.playback_schedule_lead_ms.min(300);
    }

    pub fn playback_tunables(&self) -> serde_json::Value {
        serde_json::json!({
            "startup_buffer_ms": self.playback_startup_buffer_ms,
            "startup_max_wait_ms": self.playback_startup_max_wait_ms,
            "schedule_lead_ms": self.playback_schedule_lead_ms,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub bot_name: String,
    pub alias: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            bot_name: "Assistant".to_string(),
            alias: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub vad: VadConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub prethink: PrethinkConfig,
    pub audio: AudioConfig,
    pub persona: PersonaConfig,
}

impl VoiceConfig {
    pub fn normalize(&mut self) -> Result<(), String> {
        self.vad.normalize();
        self.asr.normalize();
        self.tts.normalize_and_validate()?;
        self.llm.normalize();
        self.prethink.normalize();
        self.audio.normalize();
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        let mut cfg: VoiceConfig =
            toml::from_str(&text).with_context(|| format!("parsing config file {:?}", path))?;
        cfg.normalize()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config dir {:?}", parent))?;
        }
        let text = toml::to_string_pretty(self).context("serializing configuration")?;
        std::fs::write(path, text).with_context(|| format!("writing config file {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_plugin() {
        let cfg = VoiceConfig::default();
        assert_eq!(cfg.vad.speech_start_ms, 150);
        assert_eq!(cfg.vad.speech_end_ms, 400); // spec.md explicit value, see DESIGN.md
        assert_eq!(cfg.vad.pre_start_silence_tolerance_ms, 80);
        assert_eq!(cfg.tts.conn_limit, 32);
        assert_eq!(cfg.prethink.timeout_ms, 600);
        assert_eq!(cfg.llm.history_window_messages, 12);
    }

    #[test]
    fn tts_doubao_requires_credentials() {
        let mut cfg = TtsConfig {
            kind: TtsType::WsBidirectional,
            ..TtsConfig::default()
        };
        let err = cfg.normalize_and_validate().unwrap_err();
        assert!(err.contains("doubao_app_key"));
    }

    #[test]
    fn audio_playback_tunables_clamped() {
        let mut cfg = AudioConfig {
            playback_startup_buffer_ms: 5000,
            playback_schedule_lead_ms: 9000,
            ..AudioConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.playback_startup_buffer_ms, 1000);
        assert_eq!(cfg.playback_schedule_lead_ms, 300);
    }

    #[test]
    fn vad_preroll_default_matches_original_formula() {
        let cfg = VadConfig::default();
        assert_eq!(cfg.effective_pre_roll_ms(), 420);
        let cfg2 = VadConfig {
            speech_start_ms: 400,
            ..VadConfig::default()
        };
        assert_eq!(cfg2.effective_pre_roll_ms(), 520);
    }
}
