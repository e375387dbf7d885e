//! Tool-call simulation bridge.
//!
//! When a provider cannot emit structured tool calls, the model is prompted
//! to narrate them instead. The session routes that narration into a
//! [`SimulationBridge`], whose background task parses it incrementally and
//! reports plain narration and synthetic tool-call chunks to a
//! [`SimulationListener`]. Everything else the session forwards while
//! simulating travels the same channel, so the listener sees one ordered
//! stream.

pub mod parser;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChoiceDelta, Chunk, ToolCallFragment};
use crate::util::{next_call_id, unix_now_secs};

use self::parser::{ParseEvent, SimulationParser};

// ---------------------------------------------------------------------------
// Shared identity
// ---------------------------------------------------------------------------

/// Stream identity stamped on synthetic chunks. Written by the session as
/// upstream chunks arrive, read by the background task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamIdentity {
    pub id: String,
    pub model: String,
    pub created: u64,
}

impl StreamIdentity {
    /// Record the identity fields a chunk carries (first id wins).
    pub fn observe(&mut self, chunk: &Chunk) {
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id.clone_from(&chunk.id);
        }
        if !chunk.model.is_empty() {
            self.model.clone_from(&chunk.model);
        }
        if chunk.created != 0 {
            self.created = chunk.created;
        }
    }

    #[must_use]
    pub fn chunk(&self) -> Chunk {
        let created = if self.created == 0 {
            unix_now_secs()
        } else {
            self.created
        };
        Chunk::new(self.id.clone(), self.model.clone(), created)
    }
}

pub type SharedIdentity = Arc<Mutex<StreamIdentity>>;

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Bounded pool the background parsers run on: a runtime handle plus a
/// semaphore capping how many parse concurrently.
#[derive(Debug, Clone)]
pub struct SimulationPool {
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl SimulationPool {
    #[must_use]
    pub fn new(handle: Handle, max_concurrent: usize) -> Self {
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Pool on the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Internal`] outside a tokio runtime.
    pub fn current(max_concurrent: usize) -> Result<Self, GatewayError> {
        let handle = Handle::try_current()
            .map_err(|err| GatewayError::Internal(format!("no tokio runtime: {err}")))?;
        Ok(Self::new(handle, max_concurrent))
    }

    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulationInput {
    Text(String),
    /// A chunk that bypasses the parser but must keep its place relative to
    /// the narration around it.
    Forward(Chunk),
    Finish,
}

/// Receives the bridge's output on the background task, in parse order.
pub trait SimulationListener: Send + 'static {
    /// Narration that is not part of a call block.
    fn on_text(&mut self, chunk: Chunk);
    /// One synthetic tool-call fragment chunk.
    fn on_tool_call_chunk(&mut self, chunk: Chunk);
    /// A [`SimulationInput::Forward`] chunk, passed through unchanged.
    fn on_forward(&mut self, chunk: Chunk);
    /// Called once after the final input was parsed successfully.
    fn on_done(&mut self);
}

#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub trigger_signal: String,
    pub max_buffer_bytes: usize,
}

/// Everything the background task emitted, in emission order.
#[derive(Debug, Clone, Default)]
pub struct SimulationOutcome {
    pub chunks: Vec<Chunk>,
    pub tool_calls: u32,
}

type ParserTask = JoinHandle<Result<SimulationOutcome, GatewayError>>;

/// Producer side of one session's background parser.
///
/// Text that is queued but not yet parsed counts against
/// `max_buffer_bytes`, the same budget the parser applies to its own
/// buffer. Crossing it stops the bridge with a parse failure.
#[derive(Debug)]
pub struct SimulationBridge {
    tx: Option<mpsc::UnboundedSender<SimulationInput>>,
    task: Option<ParserTask>,
    queued: Arc<AtomicUsize>,
    max_queued_bytes: usize,
    overflowed: bool,
}

impl SimulationBridge {
    /// Spawn the background parser on `pool`.
    pub fn start<L: SimulationListener>(
        pool: &SimulationPool,
        settings: SimulationSettings,
        identity: SharedIdentity,
        listener: L,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = Arc::clone(&pool.permits);
        let queued = Arc::new(AtomicUsize::new(0));
        let max_queued_bytes = settings.max_buffer_bytes;
        let consumer = ParserInput {
            rx,
            queued: Arc::clone(&queued),
        };
        let task = pool.handle.spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| GatewayError::Internal("simulation pool closed".to_string()))?;
            let parser = SimulationParser::new(settings.trigger_signal, settings.max_buffer_bytes);
            run_parser(consumer, parser, identity, listener).await
        });
        Self {
            tx: Some(tx),
            task: Some(task),
            queued,
            max_queued_bytes,
            overflowed: false,
        }
    }

    /// Append raw model text. Text sent after the task has stopped (it
    /// failed) is dropped; the failure surfaces from [`Self::finish`].
    pub fn append(&mut self, text: &str) {
        if text.is_empty() || self.overflowed {
            return;
        }
        let pending = self.queued.fetch_add(text.len(), Ordering::AcqRel) + text.len();
        if pending > self.max_queued_bytes {
            tracing::warn!(
                pending,
                limit = self.max_queued_bytes,
                "simulation input backlog over limit"
            );
            self.overflowed = true;
            self.abort();
            return;
        }
        self.send(SimulationInput::Text(text.to_string()));
    }

    /// Queue a chunk behind the text appended so far.
    pub fn forward(&self, chunk: Chunk) {
        self.send(SimulationInput::Forward(chunk));
    }

    fn send(&self, input: SimulationInput) {
        if let Some(tx) = &self.tx {
            if tx.send(input).is_err() {
                tracing::debug!("simulation task already stopped, dropping input");
            }
        }
    }

    /// `true` once the background task has exited (done or failed).
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.overflowed || self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signal end of input and wait for the task to drain.
    ///
    /// # Errors
    ///
    /// Returns the task's parse error, a [`GatewayError::SimulationParse`]
    /// if the input backlog overflowed, or [`GatewayError::Internal`] if the
    /// bridge was already finished or the task panicked.
    pub async fn finish(&mut self) -> Result<SimulationOutcome, GatewayError> {
        if std::mem::take(&mut self.overflowed) {
            return Err(GatewayError::SimulationParse(format!(
                "simulation input exceeded {} bytes",
                self.max_queued_bytes
            )));
        }
        if let Some(tx) = self.tx.take() {
            // A closed channel means the task already returned its error.
            let _ = tx.send(SimulationInput::Finish);
        }
        let task = self
            .task
            .take()
            .ok_or_else(|| GatewayError::Internal("simulation bridge already finished".into()))?;
        task.await
            .map_err(|err| GatewayError::Internal(format!("simulation task failed: {err}")))?
    }

    /// Stop the background task without waiting for it.
    pub fn abort(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SimulationBridge {
    fn drop(&mut self) {
        self.abort();
    }
}

struct ParserInput {
    rx: mpsc::UnboundedReceiver<SimulationInput>,
    queued: Arc<AtomicUsize>,
}

async fn run_parser<L: SimulationListener>(
    mut input: ParserInput,
    mut parser: SimulationParser,
    identity: SharedIdentity,
    mut listener: L,
) -> Result<SimulationOutcome, GatewayError> {
    let mut emitter = CallEmitter::default();
    while let Some(next) = input.rx.recv().await {
        match next {
            SimulationInput::Text(text) => {
                let events = parser.push(&text).inspect_err(log_parse_failure)?;
                input.queued.fetch_sub(text.len(), Ordering::AcqRel);
                emitter.emit(events, &identity, &mut listener);
            }
            SimulationInput::Forward(chunk) => listener.on_forward(chunk),
            SimulationInput::Finish => {
                let events = parser.finish().inspect_err(log_parse_failure)?;
                emitter.emit(events, &identity, &mut listener);
                listener.on_done();
                return Ok(emitter.outcome);
            }
        }
    }
    Err(GatewayError::Internal(
        "simulation input closed before finish".to_string(),
    ))
}

fn log_parse_failure(err: &GatewayError) {
    tracing::warn!(error = %err, "tool-call simulation parse failed");
}

#[derive(Default)]
struct CallEmitter {
    outcome: SimulationOutcome,
    used_ids: FxHashSet<String>,
}

impl CallEmitter {
    /// The model's own id if it has not been handed out yet, else a fresh one.
    fn assign_id(&mut self, supplied: Option<String>) -> String {
        let mut id = supplied.unwrap_or_else(next_call_id);
        while self.used_ids.contains(&id) {
            id = next_call_id();
        }
        self.used_ids.insert(id.clone());
        id
    }

    fn emit<L: SimulationListener>(
        &mut self,
        events: Vec<ParseEvent>,
        identity: &SharedIdentity,
        listener: &mut L,
    ) {
        if events.is_empty() {
            return;
        }
        let base = identity.lock().chunk();
        for event in events {
            match event {
                ParseEvent::Text(text) => {
                    let chunk = base.clone().with_choice(ChoiceDelta::content(0, text));
                    self.outcome.chunks.push(chunk.clone());
                    listener.on_text(chunk);
                }
                ParseEvent::Call(call) => {
                    let index = self.outcome.tool_calls;
                    self.outcome.tool_calls += 1;
                    let id = self.assign_id(call.id);
                    tracing::debug!(index, id = %id, name = %call.name, "simulated tool call");

                    let mut name_choice = ChoiceDelta::new(0);
                    name_choice
                        .delta
                        .tool_calls
                        .push(ToolCallFragment::start(index, id.clone(), call.name));
                    let mut args_choice = ChoiceDelta::new(0);
                    let mut args = ToolCallFragment::arguments(index, call.arguments);
                    args.id = Some(id);
                    args_choice.delta.tool_calls.push(args);

                    for choice in [name_choice, args_choice] {
                        let chunk = base.clone().with_choice(choice);
                        self.outcome.chunks.push(chunk.clone());
                        listener.on_tool_call_chunk(chunk);
                    }
                }
            }
        }
    }
}
