//! Turn Orchestrator: prompt -> LLM stream -> emotion resolver -> chunker ->
//! bounded queue -> TTS worker -> WebSocket send, plus the prethink job this
//! turn leaves running for the next one.
//!
//! Grounded in `websocket_handler.py`'s `process_turn` (the richest source
//! for this module) and the teacher's `src/server/realtime_voice.rs`
//! `process_voice_response` for the task/queue idiom: one task streams the
//! LLM and feeds a channel, a second task drains it strictly in order and
//! calls the TTS adapter. Spec §5 says there is no queue between the TTS
//! worker and the socket itself (a slow client slows synthesis down, not the
//! other way around), so the worker writes straight through a shared
//! `WsSender` rather than its own outbound channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::config::VoiceConfig;
use crate::server::ws::WsSender;
use crate::voice::audio;
use crate::voice::chunker::TextChunker;
use crate::voice::emotion::{self, EmotionPrefixAccumulator, LeadingPrefixResolution};
use crate::voice::llm::{self, StreamItem};
use crate::voice::metrics::{MetricsCollector, TurnTiming};
use crate::voice::prethink;
use crate::voice::prompt::build_full_prompt;
use crate::voice::session::{CallState, CancelToken, ChatMessage, Session};
use crate::voice::tts::TtsAdapter;

/// Cap on in-flight TTS segments per spec §5's bounded queue.
const TTS_QUEUE_CAPACITY: usize = 32;
/// Re-run the heuristic emotion inference roughly every this many characters
/// of accumulated response text, per the periodic mid-reply re-inference.
const EMOTION_REINFER_CHARS: usize = 60;

fn is_meaningful(text: &str) -> bool {
    text.chars()
        .any(|c| c.is_ascii_alphanumeric() || is_cjk_or_kana(c))
}

fn is_cjk_or_kana(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3040..=0x309F | 0x30A0..=0x30FF | 0xAC00..=0xD7A3)
}

struct TtsSegment {
    seq: u64,
    text: String,
}

/// How the currently-held emotion was arrived at, mirroring
/// `websocket_handler.py`'s `send_avatar_state(emotion, source)` call sites:
/// an explicit leading tag, the first heuristic guess once no tag showed up,
/// a periodic heuristic re-inference, or the end-of-turn fallback when no
/// emotion was ever resolved.
#[derive(Clone, Copy, PartialEq, Eq)]
enum EmotionSource {
    LlmTag,
    Heuristic,
    HeuristicUpdate,
    Fallback,
}

impl EmotionSource {
    fn as_str(self) -> &'static str {
        match self {
            EmotionSource::LlmTag => "llm_tag",
            EmotionSource::Heuristic => "heuristic",
            EmotionSource::HeuristicUpdate => "heuristic_update",
            EmotionSource::Fallback => "fallback",
        }
    }
}

#[derive(Default)]
struct WorkerTiming {
    tts_first_request_ms: Option<f64>,
    tts_first_audio_ms: Option<f64>,
    tts_audio_chunks_sent: u32,
}

/// Schedule a new turn for `session`: cancels whatever the session was doing,
/// resets its cancellation flag, appends the user's text to history, and
/// spawns [`run_turn`] tracked so a later interruption can cancel it.
pub async fn schedule_turn(
    session: Arc<Session>,
    config: Arc<VoiceConfig>,
    tts: Arc<dyn TtsAdapter>,
    out: WsSender,
    metrics: Arc<Mutex<MetricsCollector>>,
    user_text: String,
    source: &'static str,
    asr_final_ms: Option<f64>,
) {
    session.cancel_prethink_task().await;
    session.create_prethink_job();
    session.cancel_tracked_tasks().await;
    session.wait_tracked_tasks(Duration::from_millis(500)).await;
    session.reset_cancel_flag();

    session.set_state(CallState::Thinking).await;
    session
        .append_history(ChatMessage::user(user_text))
        .await;
    out.send_json(&serde_json::json!({
        "type": "state.update",
        "data": {"state": "thinking"}
    }))
    .await;

    let turn_id = session.next_turn_id();
    let turn_session = session.clone();
    let handle = tokio::spawn(async move {
        run_turn(turn_session, config, tts, turn_id, source, asr_final_ms, out, metrics).await;
    });
    session.track_task(handle).await;
}

/// Run one full turn to completion: steps correspond 1:1 to spec §4.9.
#[allow(clippy::too_many_arguments)]
pub async fn run_turn(
    session: Arc<Session>,
    config: Arc<VoiceConfig>,
    tts: Arc<dyn TtsAdapter>,
    turn_id: u64,
    source: &'static str,
    asr_final_ms: Option<f64>,
    out: WsSender,
    metrics: Arc<Mutex<MetricsCollector>>,
) {
    let _permit = session.process_mutex.lock().await;
    if session.is_cancelled() {
        return;
    }

    let turn_start = Instant::now();
    let mut timing = TurnTiming {
        turn_id,
        source: source.to_string(),
        asr_final_ms,
        ..Default::default()
    };

    // Step 1: consume the prethink slot at most once and fold it into the prompt.
    let prethink_hint = session.consume_prethink_hint().await;
    let injection_block = match &prethink_hint {
        Some((hint, age_ms, source_turn)) => {
            timing.prethink_hit = true;
            timing.prethink_age_ms = Some(*age_ms);
            timing.prethink_source_turn_id = Some(*source_turn);
            let block = prethink::build_prethink_injection_block(hint);
            if block.is_empty() { None } else { Some(block) }
        }
        None => None,
    };
    let history = session
        .recent_history(config.llm.history_window_messages)
        .await;
    let prompt = build_full_prompt(&config.persona, injection_block.as_deref(), &history);

    // Step 2: open the LLM stream under this turn's cancel signal.
    let cancel = session.cancel_token();
    let (llm_tx, mut llm_rx) = mpsc::channel(64);
    let llm_config = config.llm.clone();
    let model_preference = config.llm.model_preference.clone();
    let llm_task: JoinHandle<()> = tokio::spawn(async move {
        if let Err(e) = llm::generate_stream(&llm_config, prompt, &model_preference, cancel, llm_tx).await {
            warn!(error = %e, "[Orchestrator] llm stream ended with an error");
        }
    });

    // Steps 3-5: emotion resolver -> chunker -> bounded queue -> TTS worker.
    let (seg_tx, seg_rx) = mpsc::channel::<TtsSegment>(TTS_QUEUE_CAPACITY);
    let worker_cancel = session.cancel_token();
    let worker_session = session.clone();
    let worker_handle: JoinHandle<WorkerTiming> = tokio::spawn(run_tts_worker(
        seg_rx,
        tts,
        out.clone(),
        config.audio.sample_rate,
        worker_cancel,
        worker_session,
    ));

    let mut emotion_acc = EmotionPrefixAccumulator::new();
    let mut leading_resolved = false;
    let mut chunker = TextChunker::default();
    let mut full_text = String::new();
    let mut current_emotion: Option<String> = None;
    let mut current_emotion_source: Option<EmotionSource> = None;
    let mut last_announced_emotion: Option<String> = None;
    let mut chars_since_inference = 0usize;
    let mut llm_first_token_seen = false;

    while let Some(item) = llm_rx.recv().await {
        if session.is_cancelled() {
            break;
        }
        let text = match item {
            StreamItem::Chunk(t) | StreamItem::FullResponse(t) => t,
            StreamItem::Done => break,
        };
        if text.is_empty() {
            continue;
        }
        if !llm_first_token_seen {
            llm_first_token_seen = true;
            timing.llm_first_token_ms = Some(turn_start.elapsed().as_secs_f64() * 1000.0);
        }

        let visible_text = if leading_resolved {
            text
        } else {
            match emotion_acc.push(&text) {
                LeadingPrefixResolution::NeedMore => continue,
                LeadingPrefixResolution::Resolved(emotion_name, rest) => {
                    leading_resolved = true;
                    current_emotion = Some(emotion_name);
                    current_emotion_source = Some(EmotionSource::LlmTag);
                    rest
                }
                LeadingPrefixResolution::NoTag(passthrough) => {
                    leading_resolved = true;
                    passthrough
                }
            }
        };
        if visible_text.is_empty() {
            continue;
        }

        full_text.push_str(&visible_text);
        chars_since_inference += visible_text.chars().count();
        if current_emotion.is_none() || chars_since_inference >= EMOTION_REINFER_CHARS {
            let inferred =
                emotion::infer_emotion(&full_text, current_emotion.as_deref().unwrap_or("neutral"));
            current_emotion_source = Some(if current_emotion.is_none() {
                EmotionSource::Heuristic
            } else {
                EmotionSource::HeuristicUpdate
            });
            current_emotion = Some(inferred);
            chars_since_inference = 0;
        }
        if current_emotion.as_deref() != last_announced_emotion.as_deref() {
            if let (Some(emotion_name), Some(method)) = (&current_emotion, current_emotion_source) {
                out.send_json(&serde_json::json!({
                    "type": "avatar.state",
                    "data": {"emotion": emotion_name, "source": method.as_str(), "turn_id": turn_id}
                }))
                .await;
                last_announced_emotion = current_emotion.clone();
            }
        }

        for (seq, chunk_text, _is_final) in chunker.process(&visible_text) {
            if session.is_cancelled() {
                break;
            }
            if !is_meaningful(&chunk_text) {
                continue;
            }
            timing.tts_segment_count += 1;
            if seg_tx.send(TtsSegment { seq, text: chunk_text }).await.is_err() {
                break;
            }
        }
    }

    let _ = llm_task.await;

    if current_emotion.is_none() && !session.is_cancelled() {
        let inferred = emotion::infer_emotion(&full_text, "neutral");
        out.send_json(&serde_json::json!({
            "type": "avatar.state",
            "data": {"emotion": inferred, "source": EmotionSource::Fallback.as_str(), "turn_id": turn_id}
        }))
        .await;
        current_emotion = Some(inferred);
    }

    if !session.is_cancelled() {
        if let Some((seq, chunk_text, _)) = chunker.flush() {
            if is_meaningful(&chunk_text) {
                timing.tts_segment_count += 1;
                let _ = seg_tx.send(TtsSegment { seq, text: chunk_text }).await;
            }
        }
    }
    drop(seg_tx);

    let worker_timing = worker_handle.await.unwrap_or_default();
    timing.tts_first_request_ms = worker_timing.tts_first_request_ms;
    timing.tts_first_audio_ms = worker_timing.tts_first_audio_ms;
    timing.tts_audio_chunks_sent = worker_timing.tts_audio_chunks_sent;

    // Step 7: append the assistant turn, return to LISTENING.
    let trimmed = full_text.trim();
    if !trimmed.is_empty() {
        session
            .append_history(ChatMessage::assistant(trimmed.to_string()))
            .await;
    }
    if !session.is_cancelled() {
        session.set_state(CallState::Listening).await;
        out.send_json(&serde_json::json!({
            "type": "state.update",
            "data": {"state": "listening"}
        }))
        .await;
    }

    timing.turn_total_ms = turn_start.elapsed().as_secs_f64() * 1000.0;
    timing.log(&session.session_id);
    metrics.lock().await.record_turn(&timing);

    // Step 8: leave a fresh prethink job running for the next turn.
    if !session.is_cancelled() {
        maybe_spawn_prethink(session, config, turn_id).await;
    }
}

/// Pulls synthesis segments strictly in order and writes audio straight to
/// the socket; no queue sits between this and the client on purpose.
async fn run_tts_worker(
    mut seg_rx: mpsc::Receiver<TtsSegment>,
    tts: Arc<dyn TtsAdapter>,
    out: WsSender,
    default_sample_rate: u32,
    cancel: CancelToken,
    session: Arc<Session>,
) -> WorkerTiming {
    let worker_start = Instant::now();
    let mut timing = WorkerTiming::default();
    let mut speaking_announced = false;

    while let Some(segment) = seg_rx.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        out.send_json(&serde_json::json!({
            "type": "tts.text_stream",
            "seq": segment.seq,
            "data": {"seq": segment.seq, "text": segment.text}
        }))
        .await;

        if timing.tts_first_request_ms.is_none() {
            timing.tts_first_request_ms = Some(worker_start.elapsed().as_secs_f64() * 1000.0);
        }

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(8);
        let synth_tts = tts.clone();
        let text = segment.text.clone();
        let synth_handle = tokio::spawn(async move {
            if let Err(e) = synth_tts.synthesize_stream(&text, audio_tx).await {
                warn!(error = %e, "[Orchestrator] tts synthesis failed for a segment");
            }
        });

        let mut pcm_carry: Vec<u8> = Vec::new();
        let mut sample_rate = default_sample_rate;
        let mut pending: Option<Vec<u8>> = None;

        while let Some(chunk) = audio_rx.recv().await {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(rate) = audio::extract_wav_sample_rate(&chunk) {
                sample_rate = rate;
            }
            let (wav_chunk, carry) =
                audio::to_playable_wav_chunk(&chunk, sample_rate, 1, &pcm_carry);
            pcm_carry = carry;
            if wav_chunk.is_empty() {
                continue;
            }

            if let Some(prev) = pending.take() {
                emit_audio_chunk(&out, &session, &mut speaking_announced, &mut timing, worker_start, segment.seq, prev, sample_rate, false).await;
            }
            pending = Some(wav_chunk);
        }
        let _ = synth_handle.await;

        match pending.take() {
            Some(last) => {
                emit_audio_chunk(&out, &session, &mut speaking_announced, &mut timing, worker_start, segment.seq, last, sample_rate, true).await;
            }
            None => {
                out.send_json(&serde_json::json!({
                    "type": "tts.audio_chunk",
                    "seq": segment.seq,
                    "is_final": true,
                    "data": {"chunk": "", "sample_rate": sample_rate}
                }))
                .await;
            }
        }
    }

    timing
}

#[allow(clippy::too_many_arguments)]
async fn emit_audio_chunk(
    out: &WsSender,
    session: &Arc<Session>,
    speaking_announced: &mut bool,
    timing: &mut WorkerTiming,
    worker_start: Instant,
    seq: u64,
    wav_chunk: Vec<u8>,
    sample_rate: u32,
    is_final: bool,
) {
    if !*speaking_announced {
        session.set_state(CallState::Speaking).await;
        out.send_json(&serde_json::json!({
            "type": "state.update",
            "data": {"state": "speaking"}
        }))
        .await;
        *speaking_announced = true;
    }
    if timing.tts_first_audio_ms.is_none() {
        timing.tts_first_audio_ms = Some(worker_start.elapsed().as_secs_f64() * 1000.0);
    }
    timing.tts_audio_chunks_sent += 1;
    out.send_json(&serde_json::json!({
        "type": "tts.audio_chunk",
        "seq": seq,
        "is_final": is_final,
        "data": {"chunk": audio::encode_wav_to_b64(&wav_chunk), "sample_rate": sample_rate}
    }))
    .await;
}

/// Spawns a speculative "predict the user's next turn" job. The job is
/// time-boxed by `timeout_ms` and stores its result (if any survives
/// sanitizing) against `job_id`, so a turn that starts before it finishes
/// invalidates it for free via [`Session::store_prethink_hint`]'s staleness
/// check.
async fn maybe_spawn_prethink(session: Arc<Session>, config: Arc<VoiceConfig>, source_turn_id: u64) {
    if !config.prethink.enabled {
        return;
    }
    let history = session
        .recent_history(config.prethink.max_history_messages)
        .await;
    let Some(last_user) = history.iter().rev().find(|m| m.role == "user") else {
        return;
    };
    if last_user.content.chars().count() < config.prethink.min_user_text_chars {
        return;
    }

    let job_id = session.create_prethink_job();
    let prompt = prethink::build_prethink_prompt(&history);
    let model_name = if config.prethink.model_name.is_empty() {
        config.llm.model_preference.clone()
    } else {
        config.prethink.model_name.clone()
    };
    let llm_config = config.llm.clone();
    let timeout_ms = config.prethink.timeout_ms;
    let max_output_chars = config.prethink.max_output_chars;
    let job_session = session.clone();

    let handle = tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel(32);
        let cancel = CancelToken::inert();
        let collect_limit = max_output_chars.saturating_mul(3).max(60);

        let run = async {
            let generate = llm::generate_stream(&llm_config, prompt, &model_name, cancel, tx);
            let collect = async {
                let mut collected = String::new();
                while let Some(item) = rx.recv().await {
                    match item {
                        StreamItem::Chunk(t) | StreamItem::FullResponse(t) => {
                            collected.push_str(&t);
                            if collected.chars().count() >= collect_limit {
                                break;
                            }
                        }
                        StreamItem::Done => break,
                    }
                }
                collected
            };
            let (_, collected) = tokio::join!(generate, collect);
            collected
        };

        let raw = match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(text) => text,
            Err(_) => return,
        };
        let sanitized = prethink::sanitize_prethink_result(&raw, max_output_chars);
        if sanitized.is_empty() {
            return;
        }
        job_session
            .store_prethink_hint(job_id, sanitized, source_turn_id)
            .await;
    });
    session.set_prethink_task(handle).await;
}
