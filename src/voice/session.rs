//! Per-connection call state: history, cancellation, tracked tasks, and the
//! single-slot prethink cache.
//!
//! Grounded in `core/session_manager.py`'s `SessionContext`/`SessionManager`
//! and `core/state_machine.py`'s `CallState`. The two asyncio locks
//! (`speaking_lock`/`process_lock`) collapse into one `process_mutex` here —
//! see DESIGN.md Open Question #3.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

/// One turn of conversation, mirroring the `{"role": ..., "content": ...}`
/// dicts the original plugin threads through its prompt builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
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

/// The call's coarse-grained lifecycle, per spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Interrupted,
}

impl Default for CallState {
    fn default() -> Self {
        CallState::Idle
    }
}

const CHAT_HISTORY_LIMIT: usize = 80;

/// A prethink prediction stashed against a job id, consumed at most once.
#[derive(Debug, Clone)]
struct PrethinkHint {
    job_id: u64,
    text: String,
    stored_at: Instant,
    source_turn_id: u64,
}

/// Everything that survives for the lifetime of one WebSocket connection.
pub struct Session {
    pub session_id: String,
    state: RwLock<CallState>,
    history: Mutex<Vec<ChatMessage>>,
    pub process_mutex: Mutex<()>,
    cancel_flag: Arc<AtomicBool>,
    interrupt_count: AtomicU64,
    turn_seq: AtomicU64,
    last_partial_text: Mutex<String>,

    tracked_tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_task_id: AtomicU64,

    prethink_job_counter: AtomicU64,
    prethink_task: Mutex<Option<JoinHandle<()>>>,
    prethink_hint: Mutex<Option<PrethinkHint>>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: RwLock::new(CallState::Idle),
            history: Mutex::new(Vec::new()),
            process_mutex: Mutex::new(()),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            interrupt_count: AtomicU64::new(0),
            turn_seq: AtomicU64::new(0),
            last_partial_text: Mutex::new(String::new()),
            tracked_tasks: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(0),
            prethink_job_counter: AtomicU64::new(0),
            prethink_task: Mutex::new(None),
            prethink_hint: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> CallState {
        *self.state.read().await
    }

    pub async fn set_state(&self, state: CallState) {
        *self.state.write().await = state;
    }

    pub fn next_turn_id(&self) -> u64 {
        self.turn_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    // --- cancellation -----------------------------------------------------

    /// A cheap flag handle for adapters/workers to poll at suspension points,
    /// the Rust equivalent of polling `cancel_event.is_set()`.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            flag: self.cancel_flag.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Raise the cancel flag, bump the interrupt counter, and abort every
    /// tracked task including any in-flight prethink job. Mirrors
    /// `cancel_current_tasks`.
    pub async fn cancel_current_tasks(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.interrupt_count.fetch_add(1, Ordering::SeqCst);
        self.cancel_tracked_tasks().await;
        self.cancel_prethink_task().await;
    }

    /// Drop the flag once a fresh turn begins.
    pub fn reset_cancel_flag(&self) {
        self.cancel_flag.store(false, Ordering::SeqCst);
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupt_count.load(Ordering::SeqCst)
    }

    // --- chat history -------------------------------------------------

    pub async fn append_history(&self, message: ChatMessage) {
        let mut history = self.history.lock().await;
        history.push(message);
        if history.len() > CHAT_HISTORY_LIMIT {
            let overflow = history.len() - CHAT_HISTORY_LIMIT;
            history.drain(0..overflow);
        }
    }

    pub async fn history_snapshot(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }

    pub async fn recent_history(&self, n: usize) -> Vec<ChatMessage> {
        let history = self.history.lock().await;
        let start = history.len().saturating_sub(n);
        history[start..].to_vec()
    }

    pub async fn set_last_partial_text(&self, text: String) {
        *self.last_partial_text.lock().await = text;
    }

    pub async fn last_partial_text(&self) -> String {
        self.last_partial_text.lock().await.clone()
    }

    // --- tracked tasks --------------------------------------------------

    /// Register a spawned task for cancellation tracking; returns a handle
    /// the caller can use to untrack it on natural completion.
    pub async fn track_task(&self, handle: JoinHandle<()>) -> u64 {
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        self.tracked_tasks.lock().await.insert(id, handle);
        id
    }

    pub async fn untrack_task(&self, id: u64) {
        self.tracked_tasks.lock().await.remove(&id);
    }

    pub async fn has_tracked_tasks(&self) -> bool {
        !self.tracked_tasks.lock().await.is_empty()
    }

    pub async fn cancel_tracked_tasks(&self) {
        let mut tasks = self.tracked_tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }

    /// Join every tracked task with a bounded wait, mirroring
    /// `wait_tracked_tasks(timeout=0.5)`.
    pub async fn wait_tracked_tasks(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tracked_tasks.lock().await;
            tasks.drain().map(|(_, h)| h).collect()
        };
        let joined = futures_util::future::join_all(handles.into_iter().map(|h| async move {
            let _ = h.await;
        }));
        let _ = tokio::time::timeout(timeout, joined).await;
    }

    // --- prethink -----------------------------------------------------

    /// Allocate a new prethink job id, invalidating any older in-flight job's
    /// ability to store its result.
    pub fn create_prethink_job(&self) -> u64 {
        self.prethink_job_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_prethink_job(&self) -> u64 {
        self.prethink_job_counter.load(Ordering::SeqCst)
    }

    /// Register the task running a prethink job, cancelling whatever was
    /// running before it.
    pub async fn set_prethink_task(&self, handle: JoinHandle<()>) {
        let mut slot = self.prethink_task.lock().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(handle);
    }

    pub async fn cancel_prethink_task(&self) {
        let mut slot = self.prethink_task.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Store a prediction iff `job_id` is still the most recent job issued
    /// (a stale job completing after a barge-in must not overwrite a fresher
    /// hint, or stash anything at all).
    pub async fn store_prethink_hint(&self, job_id: u64, text: String, source_turn_id: u64) {
        if job_id != self.current_prethink_job() {
            return;
        }
        let mut slot = self.prethink_hint.lock().await;
        *slot = Some(PrethinkHint {
            job_id,
            text,
            stored_at: Instant::now(),
            source_turn_id,
        });
    }

    /// Take the stored hint (if any), returning `(text, age_ms, source_turn_id)`.
    /// The slot is cleared on read: a hint is used at most once.
    pub async fn consume_prethink_hint(&self) -> Option<(String, f64, u64)> {
        let mut slot = self.prethink_hint.lock().await;
        let hint = slot.take()?;
        let age_ms = hint.stored_at.elapsed().as_secs_f64() * 1000.0;
        Some((hint.text, age_ms, hint.source_turn_id))
    }
}

/// Cheap `Clone`-able handle to a session's cancellation flag, passed into
/// adapters and the TTS worker so they can bail out at suspension points
/// without holding a reference to the whole `Session`.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// A standalone token with no session behind it, for callers (like a
    /// prethink job) that satisfy an adapter's `cancel_signal` parameter but
    /// are actually stopped by aborting their task handle directly.
    pub fn inert() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Registry of live sessions, one per process, guarded the way the original
/// plugin's `SessionManager` guards its dict with an `asyncio.Lock`.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_session(&self, session_id: impl Into<String>) -> Arc<Session> {
        let session_id = session_id.into();
        let session = Arc::new(Session::new(session_id.clone()));
        self.sessions
            .write()
            .await
            .insert(session_id, session.clone());
        session
    }

    pub async fn remove_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(session_id)
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_trims_to_limit() {
        let session = Session::new("s1");
        for i in 0..100 {
            session.append_history(ChatMessage::user(format!("msg{i}"))).await;
        }
        let snapshot = session.history_snapshot().await;
        assert_eq!(snapshot.len(), CHAT_HISTORY_LIMIT);
        assert_eq!(snapshot[0].content, "msg20");
    }

    #[tokio::test]
    async fn cancel_current_tasks_raises_flag_and_counts_interrupts() {
        let session = Session::new("s1");
        assert!(!session.is_cancelled());
        session.cancel_current_tasks().await;
        assert!(session.is_cancelled());
        assert_eq!(session.interrupt_count(), 1);
        session.reset_cancel_flag();
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn prethink_hint_ignored_if_job_is_stale() {
        let session = Session::new("s1");
        let job1 = session.create_prethink_job();
        let _job2 = session.create_prethink_job();

        session.store_prethink_hint(job1, "stale".to_string(), 1).await;
        assert!(session.consume_prethink_hint().await.is_none());
    }

    #[tokio::test]
    async fn prethink_hint_consumed_once() {
        let session = Session::new("s1");
        let job = session.create_prethink_job();
        session.store_prethink_hint(job, "hint text".to_string(), 3).await;

        let (text, _age_ms, source_turn) = session.consume_prethink_hint().await.unwrap();
        assert_eq!(text, "hint text");
        assert_eq!(source_turn, 3);
        assert!(session.consume_prethink_hint().await.is_none());
    }

    #[tokio::test]
    async fn session_manager_tracks_lifecycle() {
        let manager = SessionManager::new();
        manager.create_session("a").await;
        assert_eq!(manager.session_count().await, 1);
        assert!(manager.get_session("a").await.is_some());
        manager.remove_session("a").await;
        assert_eq!(manager.session_count().await, 0);
    }
}
