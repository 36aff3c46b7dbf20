//! Voice activity detection: classify one frame at a time into at most one
//! `start`/`end` event, with energy/webrtc/silero backends and a preroll
//! buffer so the first syllable before `speech_start_ms` fires isn't lost.
//!
//! Grounded in `core/vad.py`'s state machine (accumulate duration, cross a
//! threshold, emit one event) and the teacher's `src/voice/silero_vad.rs`
//! for the ONNX inference pattern, folded in here as the `silero` mode
//! instead of a standalone module (see DESIGN.md's trim list).

use std::collections::VecDeque;

use tracing::warn;

use crate::config::{VadConfig, VadMode};

/// The only two events the engine ever emits; everything else is silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    Start,
    End,
}

#[cfg(feature = "silero")]
const SILERO_SAMPLE_RATE: i64 = 16_000;

/// ONNX-backed classifier, folded in from the teacher's standalone
/// `silero_vad.rs`. Holds the recurrent state tensor across calls; a fresh
/// `Vad` gets a fresh (zeroed) state.
#[cfg(feature = "silero")]
struct SileroClassifier {
    session: ort::session::Session,
    state: Vec<f32>,
}

#[cfg(feature = "silero")]
impl SileroClassifier {
    fn load(config: &VadConfig) -> anyhow::Result<Self> {
        use anyhow::Context;
        let model_dir = crate::config::data_dir()?.join("models");
        std::fs::create_dir_all(&model_dir).context("creating models directory")?;
        let model_path = model_dir.join(&config.silero_model_name);
        if !model_path.exists() {
            Self::download_model(&model_path)?;
        }
        let session = ort::session::Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(&model_path)
            .context("loading silero vad onnx model")?;
        Ok(Self {
            session,
            state: vec![0.0f32; 2 * 1 * 128],
        })
    }

    fn download_model(model_path: &std::path::Path) -> anyhow::Result<()> {
        use anyhow::Context;
        const SILERO_VAD_URL: &str =
            "https://github.com/snakers4/silero-vad/raw/master/src/silero_vad/data/silero_vad.onnx";
        let response = reqwest::blocking::get(SILERO_VAD_URL)
            .context("downloading silero vad model")?;
        if !response.status().is_success() {
            anyhow::bail!("silero vad model download failed: HTTP {}", response.status());
        }
        let bytes = response.bytes().context("reading silero vad model body")?;
        std::fs::write(model_path, &bytes).context("writing silero vad model to disk")?;
        Ok(())
    }

    /// Run one inference pass over a frame already resampled to 16 kHz f32.
    fn speech_probability(&mut self, frame: &[f32]) -> anyhow::Result<f32> {
        use ort::value::Value;
        let input = Value::from_array(([1usize, frame.len()], frame.to_vec()))?;
        let state = Value::from_array(([2usize, 1usize, 128usize], self.state.clone()))?;
        let sr = Value::from_array(([1usize], vec![SILERO_SAMPLE_RATE]))?;
        let outputs = self.session.run(ort::inputs![input, state, sr])?;

        let (_shape, prob_data) = outputs[0].try_extract_tensor::<f32>()?;
        let prob = prob_data.first().copied().unwrap_or(0.0);

        let (_state_shape, new_state) = outputs[1].try_extract_tensor::<f32>()?;
        if new_state.len() == self.state.len() {
            self.state.copy_from_slice(new_state);
        }
        Ok(prob)
    }
}

fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

fn rms_energy(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt()
}

fn energy_classify(frame: &[i16], threshold: i32) -> bool {
    rms_energy(frame) > threshold as f64
}

/// A rough stand-in for libwebrtc's VAD: the aggressiveness setting narrows
/// the effective energy threshold, but classification is only trusted for
/// exact 10/20/30-ms frames (spec §4.1); any other frame size falls back to
/// plain energy classification one level up in [`Vad::classify`].
fn webrtc_classify(frame: &[i16], aggressiveness: u8, threshold: i32) -> bool {
    let scale = match aggressiveness.min(3) {
        0 => 1.4,
        1 => 1.15,
        2 => 1.0,
        _ => 0.8,
    };
    rms_energy(frame) > (threshold as f64 * scale)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Active,
}

/// One VAD instance per session. Not `Clone`/`Send`-shared across sessions;
/// each connection owns its own state machine and (if silero) its own model
/// handle and recurrent state.
pub struct Vad {
    config: VadConfig,
    state: State,
    speech_duration_ms: f64,
    silence_duration_ms: f64,
    #[cfg(feature = "silero")]
    silero: Option<SileroClassifier>,
}

impl Vad {
    pub fn new(config: VadConfig) -> Self {
        #[cfg(feature = "silero")]
        let silero = if config.mode == VadMode::Silero {
            match SileroClassifier::load(&config) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "[VAD] silero model unavailable, falling back to energy");
                    None
                }
            }
        } else {
            None
        };

        Self {
            config,
            state: State::Idle,
            speech_duration_ms: 0.0,
            silence_duration_ms: 0.0,
            #[cfg(feature = "silero")]
            silero,
        }
    }

    /// Classify one frame (PCM16 mono) of the given duration, returning at
    /// most one event.
    pub fn process_frame(&mut self, frame: &[i16], frame_ms: u32) -> Option<VadEvent> {
        let is_speech = self.classify(frame, frame_ms);
        self.advance(is_speech, frame_ms as f64)
    }

    fn classify(&mut self, frame: &[i16], frame_ms: u32) -> bool {
        match self.config.mode {
            VadMode::Energy => energy_classify(frame, self.config.energy_threshold),
            VadMode::Webrtc => {
                if matches!(frame_ms, 10 | 20 | 30) {
                    webrtc_classify(frame, self.config.webrtc_aggressiveness, self.config.energy_threshold)
                } else {
                    energy_classify(frame, self.config.energy_threshold)
                }
            }
            VadMode::Silero => self.classify_silero(frame),
        }
    }

    #[cfg(feature = "silero")]
    fn classify_silero(&mut self, frame: &[i16]) -> bool {
        let Some(classifier) = self.silero.as_mut() else {
            return energy_classify(frame, self.config.energy_threshold);
        };
        let samples = i16_to_f32(frame);
        match classifier.speech_probability(&samples) {
            Ok(prob) => prob >= 0.5,
            Err(e) => {
                warn!(error = %e, "[VAD] silero inference error, falling back to energy for this frame");
                energy_classify(frame, self.config.energy_threshold)
            }
        }
    }

    #[cfg(not(feature = "silero"))]
    fn classify_silero(&mut self, frame: &[i16]) -> bool {
        energy_classify(frame, self.config.energy_threshold)
    }

    fn advance(&mut self, is_speech: bool, frame_ms: f64) -> Option<VadEvent> {
        match self.state {
            State::Idle => {
                if is_speech {
                    self.speech_duration_ms += frame_ms;
                    self.silence_duration_ms = 0.0;
                    if self.speech_duration_ms >= self.config.speech_start_ms as f64 {
                        self.state = State::Active;
                        return Some(VadEvent::Start);
                    }
                    None
                } else if self.speech_duration_ms > 0.0 {
                    // Pre-start hangover: tolerate brief silence so a weak
                    // first syllable isn't dropped.
                    self.silence_duration_ms += frame_ms;
                    if self.silence_duration_ms > self.config.pre_start_silence_tolerance_ms as f64 {
                        self.speech_duration_ms = 0.0;
                        self.silence_duration_ms = 0.0;
                    }
                    None
                } else {
                    None
                }
            }
            State::Active => {
                if is_speech {
                    self.speech_duration_ms += frame_ms;
                    self.silence_duration_ms = 0.0;
                    if self.speech_duration_ms >= self.config.max_utterance_ms as f64 {
                        // Safety cap: force an end rather than let one utterance
                        // run unbounded even while the caller keeps speaking.
                        self.state = State::Idle;
                        self.speech_duration_ms = 0.0;
                        self.silence_duration_ms = 0.0;
                        return Some(VadEvent::End);
                    }
                    None
                } else {
                    self.silence_duration_ms += frame_ms;
                    if self.silence_duration_ms >= self.config.speech_end_ms as f64 {
                        let speech_duration_ms = self.speech_duration_ms;
                        self.state = State::Idle;
                        self.speech_duration_ms = 0.0;
                        self.silence_duration_ms = 0.0;
                        if speech_duration_ms >= self.config.min_utterance_ms as f64 {
                            return Some(VadEvent::End);
                        }
                    }
                    None
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }
}

/// Fixed-capacity byte buffer of the last `effective_pre_roll_ms()` of audio,
/// drained into the ASR adapter once VAD fires `start` so the recognizer
/// sees the syllables that accumulated while still below `speech_start_ms`.
pub struct Preroll {
    max_bytes: usize,
    total_bytes: usize,
    chunks: VecDeque<Vec<u8>>,
}

impl Preroll {
    /// `bytes_per_ms` is `sample_rate * 2 / 1000` for PCM16 mono audio.
    pub fn new(pre_roll_ms: u32, bytes_per_ms: u32) -> Self {
        Self {
            max_bytes: (pre_roll_ms * bytes_per_ms) as usize,
            total_bytes: 0,
            chunks: VecDeque::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.max_bytes == 0 {
            return;
        }
        self.chunks.push_back(chunk.to_vec());
        self.total_bytes += chunk.len();
        while self.total_bytes > self.max_bytes {
            if let Some(front) = self.chunks.pop_front() {
                self.total_bytes -= front.len();
            } else {
                break;
            }
        }
    }

    /// Drain all buffered audio in order, clearing the buffer.
    pub fn drain(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.total_bytes = 0;
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_frame(samples: usize) -> Vec<i16> {
        vec![0; samples]
    }

    fn loud_frame(samples: usize) -> Vec<i16> {
        vec![20_000; samples]
    }

    fn energy_config() -> VadConfig {
        VadConfig {
            mode: VadMode::Energy,
            speech_start_ms: 40,
            speech_end_ms: 60,
            min_utterance_ms: 20,
            ..VadConfig::default()
        }
    }

    #[test]
    fn emits_start_once_speech_duration_crosses_threshold() {
        let mut vad = Vad::new(energy_config());
        assert_eq!(vad.process_frame(&loud_frame(320), 20), None);
        assert_eq!(vad.process_frame(&loud_frame(320), 20), Some(VadEvent::Start));
        assert!(vad.is_active());
    }

    #[test]
    fn emits_end_after_enough_trailing_silence() {
        let mut vad = Vad::new(energy_config());
        vad.process_frame(&loud_frame(320), 20);
        vad.process_frame(&loud_frame(320), 20);
        assert!(vad.is_active());
        vad.process_frame(&silent_frame(320), 20);
        let event = vad.process_frame(&silent_frame(320), 20);
        assert_eq!(event, Some(VadEvent::End));
        assert!(!vad.is_active());
    }

    #[test]
    fn swallows_too_short_utterance() {
        let mut config = energy_config();
        config.min_utterance_ms = 1000;
        let mut vad = Vad::new(config);
        vad.process_frame(&loud_frame(320), 20);
        vad.process_frame(&loud_frame(320), 20);
        assert!(vad.is_active());
        vad.process_frame(&silent_frame(320), 20);
        let event = vad.process_frame(&silent_frame(320), 20);
        assert_eq!(event, None);
        assert!(!vad.is_active());
    }

    #[test]
    fn pre_start_hangover_tolerates_brief_silence() {
        let mut config = energy_config();
        config.pre_start_silence_tolerance_ms = 25;
        let mut vad = Vad::new(config);
        vad.process_frame(&loud_frame(320), 20);
        // One brief silent frame within tolerance shouldn't reset progress.
        assert_eq!(vad.process_frame(&silent_frame(320), 20), None);
        assert_eq!(vad.process_frame(&loud_frame(320), 20), Some(VadEvent::Start));
    }

    #[test]
    fn webrtc_mode_falls_back_to_energy_for_nonstandard_frame_size() {
        let mut config = energy_config();
        config.mode = VadMode::Webrtc;
        let mut vad = Vad::new(config);
        // 13ms is not a valid webrtc frame size; still classifies via energy.
        vad.process_frame(&loud_frame(208), 13);
        let event = vad.process_frame(&loud_frame(208), 13);
        assert_eq!(event, Some(VadEvent::Start));
    }

    #[test]
    fn forces_end_at_max_utterance_ms_even_without_silence() {
        let mut config = energy_config();
        config.max_utterance_ms = 60;
        let mut vad = Vad::new(config);
        assert_eq!(vad.process_frame(&loud_frame(320), 20), None);
        assert_eq!(vad.process_frame(&loud_frame(320), 20), Some(VadEvent::Start));
        let event = vad.process_frame(&loud_frame(320), 20);
        assert_eq!(event, Some(VadEvent::End));
        assert!(!vad.is_active());
    }

    #[test]
    fn preroll_evicts_oldest_bytes_past_capacity() {
        let mut preroll = Preroll::new(20, 32); // 640 bytes capacity
        preroll.push(&[1u8; 400]);
        preroll.push(&[2u8; 400]);
        let drained = preroll.drain();
        assert_eq!(drained.len(), 640);
        assert_eq!(preroll.drain().len(), 0);
    }
}
