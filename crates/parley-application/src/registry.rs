//! Provider session lifecycle management.
//!
//! One provider connection per conversation, kept warm across turns so
//! context resumption stays cheap. The registry owns the decision of
//! when to reuse a cached connection, when to rebuild it (process-level
//! config changed) and when to push runtime parameters onto it
//! (dynamic config changed).
//!
//! Stopping a turn is cooperative: signal the turn's cancellation token,
//! ask the provider to interrupt, then drain the remaining events of the
//! aborted turn so the connection is clean for reuse. The drain is
//! bounded; a wedged connection is abandoned rather than waited on.

use parley_core::conversation::ConversationRepository;
use parley_core::provider::{
    DynamicConfig, OutboundMessage, ProcessConfig, ProviderFactory, ProviderSession,
    SessionConfig, SessionSpec,
};
use parley_core::{ParleyError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `stop` waits for an interrupted turn to reach its terminal
/// event before abandoning the drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tick interval of the background idle sweeper.
pub const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Sessions idle longer than this are closed by the sweeper.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// A cached provider connection plus its turn-scoped state.
struct ProcessEntry {
    session: Arc<dyn ProviderSession>,
    /// Config captured at connection start; a mismatch forces a rebuild.
    process: ProcessConfig,
    /// Token for the current (or most recent) turn.
    cancel: CancellationToken,
    last_used: Instant,
    /// Continuation for an in-flight permission request. Dropped on
    /// teardown, which the receiver must read as denial.
    pending_approval: Option<oneshot::Sender<bool>>,
}

/// Everything the caller needs to pump one turn.
pub struct TurnHandle {
    /// The live session to pull events from.
    pub session: Arc<dyn ProviderSession>,
    /// Signalled when this turn is stopped.
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for TurnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnHandle")
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// Keeps provider sessions warm per conversation and manages their
/// lifecycle.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    factory: Arc<dyn ProviderFactory>,
    store: Arc<dyn ConversationRepository>,
    drain_timeout: Duration,
    idle_threshold: Duration,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ProviderFactory>, store: Arc<dyn ConversationRepository>) -> Self {
        Self::with_limits(factory, store, DRAIN_TIMEOUT, IDLE_THRESHOLD)
    }

    /// Same as `new` with explicit drain and idle limits.
    pub fn with_limits(
        factory: Arc<dyn ProviderFactory>,
        store: Arc<dyn ConversationRepository>,
        drain_timeout: Duration,
        idle_threshold: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            factory,
            store,
            drain_timeout,
            idle_threshold,
        }
    }

    /// Number of live cached sessions.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Pre-establishes a connection so the first turn does not pay the
    /// startup latency. Best effort; failures are logged and swallowed,
    /// the real `send` will retry and surface them.
    pub async fn ensure_warm(&self, space_id: &str, conversation_id: &str, config: &SessionConfig) {
        if let Err(e) = self.connect(space_id, conversation_id, config, None).await {
            debug!(conversation_id, error = %e, "Session warm-up failed");
        }
    }

    /// Establishes (or reuses) the conversation's session without sending
    /// anything on it. Lets callers surface connection failures before
    /// they commit any per-turn state; a follow-up `send` reuses the
    /// connection made here.
    pub async fn connect(
        &self,
        space_id: &str,
        conversation_id: &str,
        config: &SessionConfig,
        explicit_resume: Option<String>,
    ) -> Result<()> {
        self.obtain(space_id, conversation_id, config, explicit_resume)
            .await?;
        Ok(())
    }

    /// Submits a message on the conversation's session, creating or
    /// rebuilding the connection as needed, and returns the turn handle.
    ///
    /// `explicit_resume` overrides the session token stored on the
    /// conversation record.
    pub async fn send(
        &self,
        space_id: &str,
        conversation_id: &str,
        outbound: OutboundMessage,
        config: &SessionConfig,
        explicit_resume: Option<String>,
    ) -> Result<TurnHandle> {
        let session = self
            .obtain(space_id, conversation_id, config, explicit_resume)
            .await?;

        // Fresh token per turn; stored on the entry so stop() can reach it.
        let cancel = CancellationToken::new();
        {
            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get_mut(conversation_id) {
                entry.cancel = cancel.clone();
                entry.last_used = Instant::now();
            }
        }

        if let Err(e) = session.send(outbound).await {
            warn!(conversation_id, error = %e, "Send failed, evicting dead session");
            self.evict(conversation_id).await;
            return Err(e);
        }

        Ok(TurnHandle { session, cancel })
    }

    /// Stops the turn of one conversation, or of all conversations.
    ///
    /// Signals the cancellation token, interrupts the provider and drains
    /// the aborted turn's remaining events so the session can serve the
    /// next turn. A no-op for conversations without a live session; never
    /// fails.
    pub async fn stop(&self, conversation_id: Option<&str>) {
        let targets: Vec<(String, Arc<dyn ProviderSession>, CancellationToken)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(id, _)| conversation_id.is_none_or(|target| target == id.as_str()))
                .map(|(id, entry)| {
                    (id.clone(), Arc::clone(&entry.session), entry.cancel.clone())
                })
                .collect()
        };

        for (id, session, cancel) in targets {
            cancel.cancel();
            if let Err(e) = session.interrupt().await {
                warn!(conversation_id = %id, error = %e, "Interrupt request failed");
            }

            let drain = async {
                loop {
                    match session.next_event().await {
                        Ok(Some(event)) if event.is_terminal() => break,
                        Ok(Some(_)) => {}
                        Ok(None) | Err(_) => break,
                    }
                }
            };
            if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
                warn!(conversation_id = %id, "Gave up draining interrupted turn");
            }
            debug!(conversation_id = %id, "Stopped generation");
        }
    }

    /// Removes and closes one conversation's session.
    ///
    /// Used when a connection is found dead mid-turn. Dropping the entry
    /// also drops any pending approval sender, denying the request.
    pub async fn evict(&self, conversation_id: &str) {
        let entry = self.sessions.write().await.remove(conversation_id);
        if let Some(entry) = entry {
            Self::close_entry(conversation_id, entry).await;
        }
    }

    /// Closes every session idle past the threshold. One sweep.
    pub async fn close_idle(&self) {
        let stale: Vec<(String, ProcessEntry)> = {
            let mut sessions = self.sessions.write().await;
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() >= self.idle_threshold)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in stale {
            info!(conversation_id = %id, "Closing idle provider session");
            Self::close_entry(&id, entry).await;
        }
    }

    /// Spawns the periodic idle sweep task.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.close_idle().await;
            }
        })
    }

    /// Closes every cached session. In-flight turns keep their handles;
    /// the next turn per conversation rebuilds from scratch.
    pub async fn invalidate_all(&self) {
        let entries: Vec<(String, ProcessEntry)> =
            self.sessions.write().await.drain().collect();
        info!(count = entries.len(), "Invalidating all provider sessions");
        for (id, entry) in entries {
            Self::close_entry(&id, entry).await;
        }
    }

    /// Registers a pending permission request for the conversation and
    /// returns the receiver its answer arrives on.
    ///
    /// A dropped sender (entry teardown, replacement by a newer request)
    /// surfaces as a receive error, which callers must treat as denial.
    pub async fn register_approval(
        &self,
        conversation_id: &str,
    ) -> Result<oneshot::Receiver<bool>> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(conversation_id)
            .ok_or_else(|| ParleyError::not_found("Session", conversation_id))?;
        let (tx, rx) = oneshot::channel();
        if entry.pending_approval.replace(tx).is_some() {
            warn!(conversation_id, "Replacing unanswered approval request");
        }
        Ok(rx)
    }

    /// Delivers the user's answer to the pending permission request.
    ///
    /// Returns whether a request was actually waiting.
    pub async fn resolve_approval(&self, conversation_id: &str, approved: bool) -> bool {
        let sender = {
            let mut sessions = self.sessions.write().await;
            sessions
                .get_mut(conversation_id)
                .and_then(|entry| entry.pending_approval.take())
        };
        match sender {
            Some(tx) => tx.send(approved).is_ok(),
            None => {
                warn!(conversation_id, "No pending approval to resolve");
                false
            }
        }
    }

    /// Returns a usable session for the conversation, reusing, rebuilding
    /// or creating as dictated by the config.
    async fn obtain(
        &self,
        space_id: &str,
        conversation_id: &str,
        config: &SessionConfig,
        explicit_resume: Option<String>,
    ) -> Result<Arc<dyn ProviderSession>> {
        let stale = {
            let mut sessions = self.sessions.write().await;
            match sessions.get_mut(conversation_id) {
                Some(entry) if entry.process == config.process => {
                    entry.last_used = Instant::now();
                    let session = Arc::clone(&entry.session);
                    drop(sessions);
                    self.apply_dynamic(&session, &config.dynamic).await?;
                    return Ok(session);
                }
                Some(_) => {
                    info!(
                        conversation_id,
                        "Process config changed, rebuilding provider session"
                    );
                    sessions.remove(conversation_id)
                }
                None => None,
            }
        };
        if let Some(entry) = stale {
            Self::close_entry(conversation_id, entry).await;
        }

        // Explicit resume id wins over the one stored on the record.
        let resume_session_id = match explicit_resume {
            Some(id) => Some(id),
            None => self
                .store
                .get(space_id, conversation_id)
                .await?
                .and_then(|conversation| conversation.session_id),
        };

        let session: Arc<dyn ProviderSession> = Arc::from(
            self.factory
                .create(SessionSpec {
                    space_id: space_id.to_string(),
                    conversation_id: conversation_id.to_string(),
                    resume_session_id,
                    process: config.process.clone(),
                })
                .await?,
        );
        self.apply_dynamic(&session, &config.dynamic).await?;

        let replaced = self.sessions.write().await.insert(
            conversation_id.to_string(),
            ProcessEntry {
                session: Arc::clone(&session),
                process: config.process.clone(),
                cancel: CancellationToken::new(),
                last_used: Instant::now(),
                pending_approval: None,
            },
        );
        // A concurrent obtain may have raced us; last writer wins.
        if let Some(entry) = replaced {
            Self::close_entry(conversation_id, entry).await;
        }

        debug!(conversation_id, "Created provider session");
        Ok(session)
    }

    /// Pushes runtime-tunable parameters onto a live session.
    async fn apply_dynamic(
        &self,
        session: &Arc<dyn ProviderSession>,
        dynamic: &DynamicConfig,
    ) -> Result<()> {
        if !dynamic.model.is_empty() {
            session.set_model(&dynamic.model).await?;
        }
        session.set_reasoning_budget(dynamic.reasoning_budget).await?;
        Ok(())
    }

    async fn close_entry(conversation_id: &str, entry: ProcessEntry) {
        if let Err(e) = entry.session.close().await {
            warn!(conversation_id, error = %e, "Failed to close provider session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::conversation::ConversationPatch;
    use parley_core::provider::{ProviderEvent, TurnUsage};
    use parley_infrastructure::JsonConversationStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct SessionState {
        interrupted: AtomicBool,
        closed: AtomicBool,
        drained: AtomicBool,
        models: StdMutex<Vec<String>>,
        budgets: StdMutex<Vec<Option<u32>>>,
    }

    struct MockSession {
        state: Arc<SessionState>,
        events: tokio::sync::Mutex<VecDeque<ProviderEvent>>,
        fail_send: bool,
        /// Never yields a terminal event, even after interrupt.
        wedged: bool,
    }

    #[async_trait]
    impl ProviderSession for MockSession {
        async fn send(&self, _message: OutboundMessage) -> Result<()> {
            if self.fail_send {
                return Err(ParleyError::provider("connection reset"));
            }
            Ok(())
        }

        async fn next_event(&self) -> Result<Option<ProviderEvent>> {
            if self.wedged {
                tokio::time::sleep(Duration::from_secs(60)).await;
                return Ok(None);
            }
            if let Some(event) = self.events.lock().await.pop_front() {
                return Ok(Some(event));
            }
            if self.state.interrupted.load(Ordering::SeqCst)
                && !self.state.drained.swap(true, Ordering::SeqCst)
            {
                return Ok(Some(ProviderEvent::FinalResult {
                    usage: TurnUsage::default(),
                    is_error: false,
                    cancelled: true,
                }));
            }
            Ok(None)
        }

        async fn interrupt(&self) -> Result<()> {
            self.state.interrupted.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.state.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn set_model(&self, model: &str) -> Result<()> {
            self.state.models.lock().unwrap().push(model.to_string());
            Ok(())
        }

        async fn set_reasoning_budget(&self, budget: Option<u32>) -> Result<()> {
            self.state.budgets.lock().unwrap().push(budget);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        created: AtomicUsize,
        specs: StdMutex<Vec<SessionSpec>>,
        states: StdMutex<Vec<Arc<SessionState>>>,
        fail_send: bool,
        wedged: bool,
        scripted_events: StdMutex<Vec<ProviderEvent>>,
    }

    #[async_trait]
    impl ProviderFactory for MockFactory {
        async fn create(&self, spec: SessionSpec) -> Result<Box<dyn ProviderSession>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            self.specs.lock().unwrap().push(spec);
            let state = Arc::new(SessionState::default());
            self.states.lock().unwrap().push(Arc::clone(&state));
            let events: VecDeque<ProviderEvent> =
                self.scripted_events.lock().unwrap().iter().cloned().collect();
            Ok(Box::new(MockSession {
                state,
                events: tokio::sync::Mutex::new(events),
                fail_send: self.fail_send,
                wedged: self.wedged,
            }))
        }
    }

    struct Fixture {
        _temp_dir: TempDir,
        factory: Arc<MockFactory>,
        store: Arc<JsonConversationStore>,
        registry: SessionRegistry,
    }

    fn fixture_with(factory: MockFactory, drain: Duration, idle: Duration) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let factory = Arc::new(factory);
        let store = Arc::new(JsonConversationStore::new(temp_dir.path().to_path_buf()));
        let registry = SessionRegistry::with_limits(
            Arc::clone(&factory) as Arc<dyn ProviderFactory>,
            Arc::clone(&store) as Arc<dyn ConversationRepository>,
            drain,
            idle,
        );
        Fixture {
            _temp_dir: temp_dir,
            factory,
            store,
            registry,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MockFactory::default(), DRAIN_TIMEOUT, IDLE_THRESHOLD)
    }

    #[tokio::test]
    async fn test_session_reused_when_process_config_matches() {
        let fx = fixture();
        let config = SessionConfig::default();

        fx.registry.ensure_warm("s", "c1", &config).await;
        fx.registry
            .send("s", "c1", OutboundMessage::default(), &config, None)
            .await
            .unwrap();

        assert_eq!(fx.factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(fx.registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_process_config_change_rebuilds_session() {
        let fx = fixture();

        fx.registry
            .send("s", "c1", OutboundMessage::default(), &SessionConfig::default(), None)
            .await
            .unwrap();

        let mut config = SessionConfig::default();
        config.process.browser_tools = true;
        fx.registry
            .send("s", "c1", OutboundMessage::default(), &config, None)
            .await
            .unwrap();

        assert_eq!(fx.factory.created.load(Ordering::SeqCst), 2);
        // The first session was closed when it was replaced.
        let states = fx.factory.states.lock().unwrap();
        assert!(states[0].closed.load(Ordering::SeqCst));
        assert!(!states[1].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dynamic_config_pushed_without_rebuild() {
        let fx = fixture();

        fx.registry
            .send("s", "c1", OutboundMessage::default(), &SessionConfig::default(), None)
            .await
            .unwrap();

        let mut config = SessionConfig::default();
        config.dynamic.model = "bigger-model".to_string();
        config.dynamic.reasoning_budget = Some(4096);
        fx.registry
            .send("s", "c1", OutboundMessage::default(), &config, None)
            .await
            .unwrap();

        assert_eq!(fx.factory.created.load(Ordering::SeqCst), 1);
        let states = fx.factory.states.lock().unwrap();
        assert_eq!(states[0].models.lock().unwrap().as_slice(), ["bigger-model"]);
        assert!(states[0].budgets.lock().unwrap().contains(&Some(4096)));
    }

    #[tokio::test]
    async fn test_resume_id_resolution_explicit_wins_over_stored() {
        let fx = fixture();

        let conv = fx.store.create("s", None).await.unwrap();
        fx.store
            .update(
                "s",
                &conv.id,
                ConversationPatch {
                    session_id: Some("stored-token".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        fx.registry
            .send("s", &conv.id, OutboundMessage::default(), &SessionConfig::default(), None)
            .await
            .unwrap();
        fx.registry.invalidate_all().await;
        fx.registry
            .send(
                "s",
                &conv.id,
                OutboundMessage::default(),
                &SessionConfig::default(),
                Some("explicit-token".to_string()),
            )
            .await
            .unwrap();

        let specs = fx.factory.specs.lock().unwrap();
        assert_eq!(specs[0].resume_session_id.as_deref(), Some("stored-token"));
        assert_eq!(specs[1].resume_session_id.as_deref(), Some("explicit-token"));
    }

    #[tokio::test]
    async fn test_stop_without_session_is_noop() {
        let fx = fixture();
        fx.registry.stop(Some("nothing-here")).await;
        fx.registry.stop(None).await;
        assert_eq!(fx.registry.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_and_drains_to_terminal() {
        let fx = fixture();

        let handle = fx
            .registry
            .send("s", "c1", OutboundMessage::default(), &SessionConfig::default(), None)
            .await
            .unwrap();

        fx.registry.stop(Some("c1")).await;

        assert!(handle.cancel.is_cancelled());
        let states = fx.factory.states.lock().unwrap();
        assert!(states[0].interrupted.load(Ordering::SeqCst));
        assert!(states[0].drained.load(Ordering::SeqCst));
        // The session stays warm for the next turn.
        assert!(!states[0].closed.load(Ordering::SeqCst));
        drop(states);
        assert_eq!(fx.registry.active_count().await, 1);
    }

    #[tokio::test]
    async fn test_stop_gives_up_on_wedged_connection() {
        let factory = MockFactory {
            wedged: true,
            ..Default::default()
        };
        let fx = fixture_with(factory, Duration::from_millis(50), IDLE_THRESHOLD);

        fx.registry
            .send("s", "c1", OutboundMessage::default(), &SessionConfig::default(), None)
            .await
            .unwrap();

        let started = Instant::now();
        fx.registry.stop(Some("c1")).await;
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_send_failure_evicts_dead_session() {
        let factory = MockFactory {
            fail_send: true,
            ..Default::default()
        };
        let fx = fixture_with(factory, DRAIN_TIMEOUT, IDLE_THRESHOLD);

        let err = fx
            .registry
            .send("s", "c1", OutboundMessage::default(), &SessionConfig::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Provider(_)));
        assert_eq!(fx.registry.active_count().await, 0);
        let states = fx.factory.states.lock().unwrap();
        assert!(states[0].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_idle_sweep_evicts_only_stale_sessions() {
        let fx = fixture_with(MockFactory::default(), DRAIN_TIMEOUT, Duration::from_millis(80));
        let config = SessionConfig::default();

        fx.registry.ensure_warm("s", "old", &config).await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        fx.registry.ensure_warm("s", "fresh", &config).await;

        fx.registry.close_idle().await;

        assert_eq!(fx.registry.active_count().await, 1);
        let states = fx.factory.states.lock().unwrap();
        assert!(states[0].closed.load(Ordering::SeqCst));
        assert!(!states[1].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_invalidate_all_closes_everything() {
        let fx = fixture();
        let config = SessionConfig::default();

        fx.registry.ensure_warm("s", "c1", &config).await;
        fx.registry.ensure_warm("s", "c2", &config).await;
        assert_eq!(fx.registry.active_count().await, 2);

        fx.registry.invalidate_all().await;
        assert_eq!(fx.registry.active_count().await, 0);
        let states = fx.factory.states.lock().unwrap();
        assert!(states.iter().all(|s| s.closed.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn test_approval_resolves_once() {
        let fx = fixture();
        fx.registry
            .ensure_warm("s", "c1", &SessionConfig::default())
            .await;

        let rx = fx.registry.register_approval("c1").await.unwrap();
        assert!(fx.registry.resolve_approval("c1", true).await);
        assert_eq!(rx.await.unwrap_or(false), true);

        // Nothing left to resolve.
        assert!(!fx.registry.resolve_approval("c1", true).await);
    }

    #[tokio::test]
    async fn test_approval_defaults_to_deny_on_teardown() {
        let fx = fixture();
        fx.registry
            .ensure_warm("s", "c1", &SessionConfig::default())
            .await;

        let rx = fx.registry.register_approval("c1").await.unwrap();
        fx.registry.evict("c1").await;

        // The dropped sender surfaces as a receive error; the caller
        // must treat that as denial.
        assert!(!rx.await.unwrap_or(false));
    }
}
