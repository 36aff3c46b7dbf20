//! Per-session and per-turn latency accounting.
//!
//! Grounded in `utils/metrics.py`'s `MetricsCollector` and the `[Perf]` log
//! line emitted by `websocket_handler.py::process_turn`.

use std::time::Instant;

use tracing::info;

/// Per-session counters, reset once per WebSocket connection.
#[derive(Debug)]
pub struct MetricsCollector {
    session_id: String,
    start_time: Instant,
    pub ttfb_ms: Option<f64>,
    pub ttfa_ms: Option<f64>,
    pub asr_latencies_ms: Vec<f64>,
    pub tts_latencies_ms: Vec<f64>,
    pub interrupt_count: u32,
}

impl MetricsCollector {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            start_time: Instant::now(),
            ttfb_ms: None,
            ttfa_ms: None,
            asr_latencies_ms: Vec::new(),
            tts_latencies_ms: Vec::new(),
            interrupt_count: 0,
        }
    }

    pub fn record_interrupt(&mut self) {
        self.interrupt_count += 1;
    }

    pub fn record_asr_latency(&mut self, ms: f64) {
        self.asr_latencies_ms.push(ms);
    }

    pub fn record_tts_latency(&mut self, ms: f64) {
        self.tts_latencies_ms.push(ms);
    }

    /// Fold one completed turn's timing into the session-level aggregates:
    /// `ttfb_ms`/`ttfa_ms` latch on the first turn that has them, and the
    /// per-turn ASR/TTS latencies append to their running arrays.
    pub fn record_turn(&mut self, timing: &TurnTiming) {
        if self.ttfb_ms.is_none() {
            self.ttfb_ms = timing.llm_first_token_ms;
        }
        if self.ttfa_ms.is_none() {
            self.ttfa_ms = timing.tts_first_audio_ms;
        }
        if let Some(asr_ms) = timing.asr_final_ms {
            self.record_asr_latency(asr_ms);
        }
        if let Some(tts_ms) = timing.tts_first_audio_ms {
            self.record_tts_latency(tts_ms);
        }
    }

    pub fn session_duration_s(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Emit the final per-session summary line.
    pub fn finalize(&self) {
        info!(
            session_id = %self.session_id,
            interrupt_count = self.interrupt_count,
            session_duration_s = self.session_duration_s(),
            "[Metrics] session summary"
        );
    }
}

/// One turn's timing, assembled and logged at the end of
/// [`crate::voice::orchestrator::run_turn`].
#[derive(Debug, Default, Clone)]
pub struct TurnTiming {
    pub turn_id: u64,
    pub source: String,
    pub asr_final_ms: Option<f64>,
    pub llm_first_token_ms: Option<f64>,
    pub tts_first_request_ms: Option<f64>,
    pub tts_first_audio_ms: Option<f64>,
    pub tts_segment_count: u32,
    pub tts_audio_chunks_sent: u32,
    pub prethink_hit: bool,
    pub prethink_age_ms: Option<f64>,
    pub prethink_source_turn_id: Option<u64>,
    pub turn_total_ms: f64,
}

fn fmt_opt_ms(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}"),
        None => "n/a".to_string(),
    }
}

impl TurnTiming {
    /// Log the `[Perf]` line the original plugin emits at the end of every
    /// turn, one field per diagnostic the spec's §4.13 and §8 scenarios key
    /// off of.
    pub fn log(&self, session_id: &str) {
        info!(
            "[Perf][{session_id}][turn={turn}] source={source} asr_final_ms={asr} \
             llm_first_token_ms={llm} tts_first_request_ms={tts_req} tts_first_audio_ms={tts_audio} \
             tts_segments={segs} tts_audio_chunks={chunks} prethink_hit={hit} \
             prethink_age_ms={age} prethink_source_turn={src_turn} turn_total_ms={total:.1}",
            session_id = session_id,
            turn = self.turn_id,
            source = self.source,
            asr = fmt_opt_ms(self.asr_final_ms),
            llm = fmt_opt_ms(self.llm_first_token_ms),
            tts_req = fmt_opt_ms(self.tts_first_request_ms),
            tts_audio = fmt_opt_ms(self.tts_first_audio_ms),
            segs = self.tts_segment_count,
            chunks = self.tts_audio_chunks_sent,
            hit = self.prethink_hit as u8,
            age = fmt_opt_ms(self.prethink_age_ms),
            src_turn = self
                .prethink_source_turn_id
                .map(|t| t.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            total = self.turn_total_ms,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_collector_tracks_interrupts() {
        let mut m = MetricsCollector::new("sess-1");
        m.record_interrupt();
        m.record_interrupt();
        assert_eq!(m.interrupt_count, 2);
    }

    #[test]
    fn fmt_opt_ms_handles_none() {
        assert_eq!(fmt_opt_ms(None), "n/a");
        assert_eq!(fmt_opt_ms(Some(12.345)), "12.3");
    }

    #[test]
    fn record_turn_latches_ttfb_and_ttfa_on_first_turn_only() {
        let mut m = MetricsCollector::new("sess-1");
        let first = TurnTiming {
            asr_final_ms: Some(40.0),
            llm_first_token_ms: Some(100.0),
            tts_first_audio_ms: Some(250.0),
            ..Default::default()
        };
        m.record_turn(&first);
        assert_eq!(m.ttfb_ms, Some(100.0));
        assert_eq!(m.ttfa_ms, Some(250.0));
        assert_eq!(m.asr_latencies_ms, vec![40.0]);
        assert_eq!(m.tts_latencies_ms, vec![250.0]);

        let second = TurnTiming {
            asr_final_ms: Some(30.0),
            llm_first_token_ms: Some(80.0),
            tts_first_audio_ms: Some(200.0),
            ..Default::default()
        };
        m.record_turn(&second);
        assert_eq!(m.ttfb_ms, Some(100.0));
        assert_eq!(m.ttfa_ms, Some(250.0));
        assert_eq!(m.asr_latencies_ms, vec![40.0, 30.0]);
    }
}
