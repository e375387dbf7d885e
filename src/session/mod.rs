//! Per-request session orchestration.
//!
//! A [`SessionCallback`] owns every per-session stage (splitter, combiner,
//! safety gate, optional simulation bridge) and the caller-facing stream.
//! It moves `Open -> Streaming -> {Completed | Failed}` and produces exactly
//! one [`SessionOutcome`]: either `[DONE]` or one terminal error chunk is
//! written to the caller, never both.

pub mod handshake;

use std::sync::Arc;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::combine::DeltaCombiner;
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::observability::{
    CompletionRecord, CompletionSink, StreamMetrics, TracingCompletionSink,
};
use crate::protocol::canonical::{ChoiceDelta, Chunk, ChunkError, OutboundEvent};
use crate::protocol::ProviderConverter;
use crate::reasoning::{NativeStage, ReasoningMode, ReasoningSplitter};
use crate::safety::{NoopChecker, SafetyChecker, SafetyGate, TermListChecker};
use crate::simulation::{
    SharedIdentity, SimulationBridge, SimulationListener, SimulationPool, SimulationSettings,
    StreamIdentity,
};
use crate::stream::SseEvent;
use crate::util::next_session_id;

pub use crate::observability::SessionOutcome;
pub use handshake::await_started;

// ---------------------------------------------------------------------------
// Caller stream
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CallerState {
    closed: bool,
    sent: u64,
}

/// Caller-facing event stream.
///
/// Clones share one gate: once a terminal event has been written every
/// later send is dropped, so the terminal event is always the last one the
/// caller sees.
#[derive(Debug, Clone)]
pub struct CallerStream {
    tx: mpsc::UnboundedSender<OutboundEvent>,
    state: Arc<Mutex<CallerState>>,
}

impl CallerStream {
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<OutboundEvent>) -> Self {
        Self {
            tx,
            state: Arc::new(Mutex::new(CallerState::default())),
        }
    }

    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Write one event. Returns `false` if it was dropped.
    pub fn send(&self, event: OutboundEvent) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            tracing::debug!("dropping event after terminal event");
            return false;
        }
        if event.is_terminal() {
            state.closed = true;
        }
        if self.tx.send(event).is_err() {
            tracing::debug!("caller stream closed, dropping event");
            return false;
        }
        state.sent += 1;
        true
    }

    #[must_use]
    pub fn events_sent(&self) -> u64 {
        self.state.lock().sent
    }
}

struct CallerListener {
    caller: CallerStream,
}

impl SimulationListener for CallerListener {
    fn on_text(&mut self, chunk: Chunk) {
        self.caller.send(OutboundEvent::Chunk(chunk));
    }

    fn on_tool_call_chunk(&mut self, chunk: Chunk) {
        self.caller.send(OutboundEvent::Chunk(chunk));
    }

    fn on_forward(&mut self, chunk: Chunk) {
        self.caller.send(OutboundEvent::Chunk(chunk));
    }

    fn on_done(&mut self) {
        tracing::debug!("tool-call simulation drained");
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-session behavior switches.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub reasoning: ReasoningMode,
    /// Route narration through the tool-call simulation bridge.
    pub simulation: Option<SimulationSettings>,
    pub block_on_findings: bool,
}

impl SessionOptions {
    /// Derive session options from application config.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the reasoning settings conflict.
    pub fn from_config(config: &AppConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            reasoning: config.stream.reasoning.mode()?,
            simulation: config
                .simulation
                .enabled
                .then(|| config.simulation.settings()),
            block_on_findings: config.safety.block_on_findings,
        })
    }
}

/// The safety checker the config asks for.
#[must_use]
pub fn checker_from_config(config: &AppConfig) -> Arc<dyn SafetyChecker> {
    if config.safety.blocked_terms.is_empty() {
        Arc::new(NoopChecker)
    } else {
        Arc::new(TermListChecker::new(&config.safety.blocked_terms))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Streaming,
    Completed,
    Failed,
}

impl SessionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

pub struct SessionCallback {
    state: SessionState,
    outcome: Option<SessionOutcome>,
    splitter: ReasoningSplitter,
    combiner: DeltaCombiner,
    gate: SafetyGate,
    block_on_findings: bool,
    caller: CallerStream,
    sink: Arc<dyn CompletionSink>,
    simulation: Option<SimulationSettings>,
    bridge: Option<SimulationBridge>,
    identity: SharedIdentity,
    /// Finish / usage chunks held until the simulation bridge drains.
    held: Vec<Chunk>,
    metrics: StreamMetrics,
    started_at: Instant,
    first_fragment_at: Option<Instant>,
}

impl std::fmt::Debug for SessionCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallback")
            .field("state", &self.state)
            .field("simulating", &self.bridge.is_some())
            .field("held", &self.held.len())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl SessionCallback {
    #[must_use]
    pub fn new(options: SessionOptions, caller: CallerStream) -> Self {
        Self {
            state: SessionState::Open,
            outcome: None,
            splitter: ReasoningSplitter::new(options.reasoning),
            combiner: DeltaCombiner::new(),
            gate: SafetyGate::new(Arc::new(NoopChecker)),
            block_on_findings: options.block_on_findings,
            caller,
            sink: Arc::new(TracingCompletionSink),
            simulation: options.simulation,
            bridge: None,
            identity: Arc::new(Mutex::new(StreamIdentity::default())),
            held: Vec::new(),
            metrics: StreamMetrics::default(),
            started_at: Instant::now(),
            first_fragment_at: None,
        }
    }

    #[must_use]
    pub fn with_checker(mut self, checker: Arc<dyn SafetyChecker>) -> Self {
        self.gate = SafetyGate::new(checker);
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Start the simulation bridge on `pool` if the options enabled it.
    #[must_use]
    pub fn with_simulation_pool(mut self, pool: &SimulationPool) -> Self {
        if let Some(settings) = self.simulation.clone() {
            let listener = CallerListener {
                caller: self.caller.clone(),
            };
            self.bridge = Some(SimulationBridge::start(
                pool,
                settings,
                Arc::clone(&self.identity),
                listener,
            ));
        }
        self
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Handle one converted upstream chunk.
    pub fn on_chunk(&mut self, mut chunk: Chunk) {
        match self.state {
            SessionState::Completed | SessionState::Failed => {
                tracing::debug!("chunk after session end dropped");
                return;
            }
            SessionState::Open => self.state = SessionState::Streaming,
            SessionState::Streaming => {}
        }
        self.metrics.chunks_in += 1;

        if let Some(error) = chunk.error.take() {
            self.terminate(error);
            return;
        }

        self.identity.lock().observe(&chunk);
        if self.splitter.rewrite(&mut chunk).answer_started {
            self.gate.reset();
        }
        self.note_first_fragment(&chunk);
        if let Err(err) = self.check_safety(&chunk) {
            self.fail(err);
            return;
        }

        if self.bridge.is_some() {
            self.route_to_bridge(chunk);
        } else {
            self.combiner.apply(&chunk);
            self.forward(chunk);
        }
    }

    /// While simulating, choice-0 content becomes narration and everything
    /// else is queued on the bridge ahead of it, so both reach the caller
    /// through one ordered path. Finish and usage chunks wait for the drain.
    fn route_to_bridge(&mut self, mut chunk: Chunk) {
        let Some(bridge) = self.bridge.as_mut() else {
            return;
        };
        let mut narration = String::new();
        for choice in chunk.choices.iter_mut().filter(|c| c.index == 0) {
            if let Some(text) = choice.delta.content.take() {
                narration.push_str(&text);
            }
        }
        if chunk.has_finish_reason() || chunk.usage.is_some() {
            bridge.append(&narration);
            self.held.push(chunk);
            return;
        }
        self.combiner.apply(&chunk);
        if let Some(chunk) = prune(chunk) {
            bridge.forward(chunk);
        }
        bridge.append(&narration);
    }

    /// Upstream reached its end marker.
    pub async fn complete(&mut self) -> SessionOutcome {
        if let Some(outcome) = self.terminal_outcome() {
            return outcome;
        }

        let trailing = self.splitter.flush();
        if !trailing.is_empty() {
            let mut chunk = self.identity.lock().chunk();
            chunk.choices = trailing;
            self.on_chunk(chunk);
            if let Some(outcome) = self.terminal_outcome() {
                return outcome;
            }
        }

        let mut finish_reason_override = None;
        if let Some(mut bridge) = self.bridge.take() {
            match bridge.finish().await {
                Ok(outcome) => {
                    for chunk in &outcome.chunks {
                        self.combiner.apply(chunk);
                    }
                    self.metrics.simulated_tool_calls = outcome.tool_calls;
                    if outcome.tool_calls > 0 {
                        finish_reason_override = Some("tool_calls");
                    }
                }
                Err(err) => return self.fail(err),
            }
        }

        let blocked = self.gate.finish().cloned().filter(|_| self.block_on_findings);
        if let Some(findings) = blocked {
            return self.fail(GatewayError::ContentFilter(findings.detail));
        }

        self.release_held(finish_reason_override);
        self.caller.send(OutboundEvent::Done);
        self.finalize(SessionState::Completed, SessionOutcome::Done)
    }

    /// Terminate with an error. Idempotent: a terminal session ignores it.
    pub fn fail(&mut self, err: GatewayError) -> SessionOutcome {
        if let Some(outcome) = self.terminal_outcome() {
            return outcome;
        }
        tracing::warn!(error = %err, "stream session failed");
        self.terminate(err.to_chunk_error())
    }

    fn terminate(&mut self, error: ChunkError) -> SessionOutcome {
        if let Some(mut bridge) = self.bridge.take() {
            bridge.abort();
        }
        self.held.clear();
        let mut chunk = self.identity.lock().chunk();
        if chunk.id.is_empty() {
            chunk.id = next_session_id();
        }
        chunk.error = Some(error.clone());
        self.caller.send(OutboundEvent::Chunk(chunk));
        self.finalize(SessionState::Failed, SessionOutcome::Error(error))
    }

    /// Fail early once the simulation task has stopped on its own; it only
    /// does that on a parse failure.
    async fn check_simulation(&mut self) {
        if !self.bridge.as_ref().is_some_and(SimulationBridge::is_stopped) {
            return;
        }
        let Some(mut bridge) = self.bridge.take() else {
            return;
        };
        let err = match bridge.finish().await {
            Err(err) => err,
            Ok(_) => GatewayError::Internal("simulation task stopped before finish".to_string()),
        };
        self.fail(err);
    }

    fn terminal_outcome(&self) -> Option<SessionOutcome> {
        if self.state.is_terminal() {
            self.outcome.clone()
        } else {
            None
        }
    }

    fn finalize(&mut self, state: SessionState, outcome: SessionOutcome) -> SessionOutcome {
        self.state = state;
        self.outcome = Some(outcome.clone());
        self.metrics.safety_checks = self.gate.invocations();
        self.metrics.events_out = self.caller.events_sent();
        let combiner = std::mem::take(&mut self.combiner);
        let record = CompletionRecord {
            message: combiner.into_message(),
            outcome: outcome.clone(),
            findings: self.gate.take_findings(),
            metrics: self.metrics,
            first_fragment_latency: self
                .first_fragment_at
                .map(|at| at.duration_since(self.started_at)),
            total_latency: self.started_at.elapsed(),
        };
        self.sink.record(record);
        outcome
    }

    fn forward(&mut self, chunk: Chunk) {
        if let Some(chunk) = prune(chunk) {
            self.caller.send(OutboundEvent::Chunk(chunk));
        }
    }

    fn release_held(&mut self, finish_reason_override: Option<&str>) {
        let mut held = std::mem::take(&mut self.held);
        if let Some(reason) = finish_reason_override {
            let mut rewrote = false;
            for choice in held.iter_mut().flat_map(|c| c.choices.iter_mut()) {
                if choice.index == 0 && choice.finish_reason.is_some() {
                    choice.finish_reason = Some(reason.to_string());
                    rewrote = true;
                }
            }
            if !rewrote {
                let mut choice = ChoiceDelta::new(0);
                choice.finish_reason = Some(reason.to_string());
                held.insert(0, self.identity.lock().chunk().with_choice(choice));
            }
        }
        for chunk in held {
            self.combiner.apply(&chunk);
            self.forward(chunk);
        }
    }

    fn note_first_fragment(&mut self, chunk: &Chunk) {
        if self.first_fragment_at.is_some() {
            return;
        }
        let has_fragment = chunk.choices.iter().any(|choice| {
            let delta = &choice.delta;
            delta.content.as_deref().is_some_and(|t| !t.is_empty())
                || delta.reasoning_content.as_deref().is_some_and(|t| !t.is_empty())
                || !delta.tool_calls.is_empty()
        });
        if has_fragment {
            self.first_fragment_at = Some(Instant::now());
        }
    }

    /// Feed the user-visible text of choice 0 to the safety gate: native
    /// reasoning while it is active, answer content otherwise.
    fn check_safety(&mut self, chunk: &Chunk) -> Result<(), GatewayError> {
        let reasoning_visible = matches!(self.splitter.mode(), ReasoningMode::NativeField)
            && self.splitter.native_stage(0) == NativeStage::Active;
        for choice in chunk.choices.iter().filter(|c| c.index == 0) {
            let text = if reasoning_visible {
                choice.delta.reasoning_content.as_deref()
            } else {
                choice.delta.content.as_deref()
            };
            let Some(text) = text else {
                continue;
            };
            let Some(findings) = self.gate.observe(text) else {
                continue;
            };
            if self.block_on_findings {
                return Err(GatewayError::ContentFilter(findings.detail.clone()));
            }
        }
        Ok(())
    }
}

/// Drop choices with nothing to say; `None` if the whole chunk is empty.
fn prune(mut chunk: Chunk) -> Option<Chunk> {
    chunk
        .choices
        .retain(|choice| !choice.delta.is_empty() || choice.finish_reason.is_some());
    if chunk.choices.is_empty() && chunk.usage.is_none() {
        return None;
    }
    Some(chunk)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Pump an upstream frame stream through `converter` into `session` until
/// it resolves.
///
/// The provider's end marker completes the session; a frame error or a
/// stream that ends without the marker fails it.
pub async fn drive<S, C>(
    frames: S,
    converter: &mut C,
    session: &mut SessionCallback,
) -> SessionOutcome
where
    S: Stream<Item = Result<SseEvent, GatewayError>>,
    C: ProviderConverter + ?Sized,
{
    futures_util::pin_mut!(frames);
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(err) => return session.fail(err),
        };
        if converter.is_end_of_stream(&frame) {
            return session.complete().await;
        }
        if let Some(chunk) = converter.convert(&frame) {
            session.on_chunk(chunk);
        }
        session.check_simulation().await;
        if let Some(outcome) = session.terminal_outcome() {
            return outcome;
        }
    }
    session.fail(GatewayError::Transport(
        "upstream stream ended without an end marker".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::canonical::{Role, ToolCallFragment, Usage};
    use crate::reasoning::MarkerPair;
    use crate::safety::SafetyFindings;

    #[derive(Default)]
    struct CaptureSink {
        records: Mutex<Vec<CompletionRecord>>,
    }

    impl CompletionSink for CaptureSink {
        fn record(&self, record: CompletionRecord) {
            self.records.lock().push(record);
        }
    }

    fn session(options: SessionOptions) -> (
        SessionCallback,
        mpsc::UnboundedReceiver<OutboundEvent>,
        Arc<CaptureSink>,
    ) {
        let (caller, rx) = CallerStream::channel();
        let sink = Arc::new(CaptureSink::default());
        let session = SessionCallback::new(options, caller).with_sink(sink.clone());
        (session, rx, sink)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn content(text: &str) -> Chunk {
        Chunk::new("chatcmpl-1", "m", 1).with_choice(ChoiceDelta::content(0, text))
    }

    #[tokio::test]
    async fn test_content_then_done() {
        let (mut session, mut rx, sink) = session(SessionOptions::default());
        session.on_chunk(content("Hello, "));
        let mut last = content("world!");
        last.choices[0].finish_reason = Some("stop".to_string());
        session.on_chunk(last);
        assert_eq!(session.complete().await, SessionOutcome::Done);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events.last(), Some(&OutboundEvent::Done));
        let records = sink.records.lock();
        assert_eq!(records.len(), 1);
        let primary = records[0].message.primary().expect("choice 0");
        assert_eq!(primary.content, "Hello, world!");
        assert_eq!(primary.finish_reason.as_deref(), Some("stop"));
        assert!(records[0].first_fragment_latency.is_some());
    }

    #[tokio::test]
    async fn test_error_chunk_terminates_once() {
        let (mut session, mut rx, sink) = session(SessionOptions::default());
        let mut failed = Chunk::new("", "", 1);
        failed.error = Some(
            GatewayError::Upstream {
                status: 500,
                message: "boom".to_string(),
            }
            .to_chunk_error(),
        );
        session.on_chunk(failed);
        assert_eq!(session.state(), SessionState::Failed);

        session.on_chunk(content("late"));
        let again = session.complete().await;
        assert!(matches!(again, SessionOutcome::Error(ref e) if e.http_code == 503));
        let _ = session.fail(GatewayError::Transport("x".to_string()));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let OutboundEvent::Chunk(chunk) = &events[0] else {
            panic!("expected error chunk");
        };
        assert_eq!(chunk.error.as_ref().map(|e| e.http_code), Some(503));
        assert!(chunk.id.starts_with("chatcmpl-"));
        assert_eq!(sink.records.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_marker_reasoning_is_split_and_flushed() {
        let options = SessionOptions {
            reasoning: ReasoningMode::Markers(MarkerPair {
                start: "<START>".to_string(),
                end: "<END>".to_string(),
                assume_open: false,
            }),
            ..SessionOptions::default()
        };
        let (mut session, mut rx, sink) = session(options);
        session.on_chunk(content("pre<START>think-a"));
        session.on_chunk(content("think-b<END>post<"));
        session.complete().await;

        let records = sink.records.lock();
        let primary = records[0].message.primary().expect("choice 0");
        assert_eq!(primary.content, "prepost<");
        assert_eq!(primary.reasoning_content, "think-athink-b");
        assert_eq!(drain(&mut rx).last(), Some(&OutboundEvent::Done));
    }

    #[derive(Default)]
    struct CountingChecker {
        calls: Mutex<Vec<String>>,
    }

    impl SafetyChecker for CountingChecker {
        fn check(&self, text: &str) -> Option<SafetyFindings> {
            self.calls.lock().push(text.to_string());
            None
        }
    }

    #[tokio::test]
    async fn test_safety_checks_at_sentence_ends_and_final() {
        let checker = Arc::new(CountingChecker::default());
        let (session, _rx, sink) = session(SessionOptions::default());
        let mut session = session.with_checker(checker.clone());
        for text in ["One", " two.", " three", " four", " five."] {
            session.on_chunk(content(text));
        }
        session.complete().await;
        assert_eq!(checker.calls.lock().len(), 3);
        assert_eq!(sink.records.lock()[0].metrics.safety_checks, 3);
    }

    #[tokio::test]
    async fn test_native_reasoning_resets_checkpoint_on_answer() {
        let checker = Arc::new(CountingChecker::default());
        let options = SessionOptions {
            reasoning: ReasoningMode::NativeField,
            ..SessionOptions::default()
        };
        let (session, _rx, _sink) = session(options);
        let mut session = session.with_checker(checker.clone());
        session.on_chunk(Chunk::new("a", "m", 1).with_choice(ChoiceDelta::reasoning(0, "Think.")));
        session.on_chunk(content("Yes."));
        session.complete().await;
        let calls = checker.calls.lock().clone();
        assert_eq!(calls, vec!["Think.", "Yes.", "Yes."]);
    }

    #[tokio::test]
    async fn test_native_reasoning_on_choice_zero_stays_checked_beside_other_choices() {
        let checker = Arc::new(CountingChecker::default());
        let options = SessionOptions {
            reasoning: ReasoningMode::NativeField,
            ..SessionOptions::default()
        };
        let (session, _rx, _sink) = session(options);
        let mut session = session.with_checker(checker.clone());
        session.on_chunk(Chunk::new("a", "m", 1).with_choice(ChoiceDelta::reasoning(0, "x")));
        session.on_chunk(
            Chunk::new("a", "m", 1)
                .with_choice(ChoiceDelta::reasoning(0, "y."))
                .with_choice(ChoiceDelta::content(1, "z")),
        );
        session.complete().await;
        assert_eq!(*checker.calls.lock(), vec!["xy.", "xy."]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_role_reaches_caller_before_simulated_narration() {
        let pool = SimulationPool::current(4).expect("pool");
        for _ in 0..50 {
            let options = SessionOptions {
                simulation: Some(SimulationSettings {
                    trigger_signal: "<Function_AB12_Start/>".to_string(),
                    max_buffer_bytes: 64 * 1024,
                }),
                ..SessionOptions::default()
            };
            let (session, mut rx, _sink) = session(options);
            let mut session = session.with_simulation_pool(&pool);
            let mut choice = ChoiceDelta::content(0, "Hello");
            choice.delta.role = Some(Role::Assistant);
            session.on_chunk(Chunk::new("a", "m", 1).with_choice(choice));
            assert_eq!(session.complete().await, SessionOutcome::Done);

            let events = drain(&mut rx);
            assert_eq!(events.len(), 3, "events: {events:?}");
            let (OutboundEvent::Chunk(first), OutboundEvent::Chunk(second)) = (&events[0], &events[1])
            else {
                panic!("expected two chunks first: {events:?}");
            };
            assert_eq!(first.choices[0].delta.role, Some(Role::Assistant));
            assert!(first.choices[0].delta.content.is_none());
            assert_eq!(second.choices[0].delta.content.as_deref(), Some("Hello"));
            assert_eq!(events[2], OutboundEvent::Done);
        }
    }

    #[tokio::test]
    async fn test_blocking_findings_fail_with_content_filter() {
        let options = SessionOptions {
            block_on_findings: true,
            ..SessionOptions::default()
        };
        let (session, mut rx, _sink) = session(options);
        let terms = vec!["secret".to_string()];
        let mut session = session.with_checker(Arc::new(TermListChecker::new(&terms)));
        session.on_chunk(content("the secret is out."));
        assert_eq!(session.state(), SessionState::Failed);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let OutboundEvent::Chunk(chunk) = &events[0] else {
            panic!("expected error chunk");
        };
        let error = chunk.error.as_ref().expect("error");
        assert_eq!(error.error_type, "content_filter");
        assert_eq!(error.http_code, 400);
    }

    #[tokio::test]
    async fn test_native_tool_calls_pass_through() {
        let (mut session, mut rx, sink) = session(SessionOptions::default());
        let mut choice = ChoiceDelta::new(0);
        choice
            .delta
            .tool_calls
            .push(ToolCallFragment::start(0, "call_1", "f"));
        session.on_chunk(Chunk::new("a", "m", 1).with_choice(choice));
        let mut choice = ChoiceDelta::new(0);
        choice
            .delta
            .tool_calls
            .push(ToolCallFragment::arguments(0, "{}"));
        choice.finish_reason = Some("tool_calls".to_string());
        session.on_chunk(
            Chunk::new("a", "m", 1)
                .with_choice(choice)
                .with_usage(Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                }),
        );
        session.complete().await;
        assert_eq!(drain(&mut rx).len(), 3);
        let records = sink.records.lock();
        let call = &records[0].message.primary().expect("choice 0").tool_calls[&0];
        assert_eq!(call.name, "f");
        assert_eq!(call.arguments, "{}");
        assert_eq!(records[0].message.usage.map(|u| u.total_tokens), Some(2));
    }

    #[test]
    fn test_caller_stream_drops_after_terminal() {
        let (caller, mut rx) = CallerStream::channel();
        assert!(caller.send(OutboundEvent::Done));
        assert!(!caller.clone().send(OutboundEvent::Chunk(content("late"))));
        assert_eq!(caller.events_sent(), 1);
        assert_eq!(drain(&mut rx), vec![OutboundEvent::Done]);
    }
}
