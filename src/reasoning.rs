use memchr::memmem;
use rustc_hash::FxHashMap;

use crate::error::GatewayError;
use crate::protocol::canonical::{ChoiceDelta, Chunk};
use crate::util::partial_suffix_len;

// Reasoning / answer separation.
//
// Two modes, never both at once:
// - Marker mode: the provider interleaves reasoning into `content`, wrapped
//   in configured start/end markers. A forward-only state machine splits the
//   text, holding back any suffix that may still grow into a marker.
// - Native-field mode: the provider already sends `reasoning_content`. The
//   text is forwarded unchanged; only the reasoning -> answer transition is
//   tracked so the safety checkpoint can restart on the answer.

// ---------------------------------------------------------------------------
// Mode selection
// ---------------------------------------------------------------------------

/// Start/end markers for marker mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPair {
    pub start: String,
    pub end: String,
    /// The provider omits the opening marker; text starts inside reasoning.
    pub assume_open: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReasoningMode {
    #[default]
    Disabled,
    Markers(MarkerPair),
    NativeField,
}

impl ReasoningMode {
    /// Resolve the per-request mode from the two independent switches.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when both modes are requested.
    pub fn from_flags(markers: Option<MarkerPair>, native: bool) -> Result<Self, GatewayError> {
        match (markers, native) {
            (Some(_), true) => Err(GatewayError::Config(
                "marker-mode and native-field reasoning cannot both be enabled".to_string(),
            )),
            (Some(pair), false) => Ok(Self::Markers(pair)),
            (None, true) => Ok(Self::NativeField),
            (None, false) => Ok(Self::Disabled),
        }
    }
}

// ---------------------------------------------------------------------------
// Marker mode
// ---------------------------------------------------------------------------

/// Forward-only marker split state. Once closed, reasoning never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningSplitState {
    Idle,
    InReasoning,
    Done,
}

/// Result of splitting one text fragment. Empty sides are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitOutput {
    pub content: Option<String>,
    pub reasoning: Option<String>,
}

impl SplitOutput {
    fn from_parts(content: String, reasoning: String) -> Self {
        Self {
            content: (!content.is_empty()).then_some(content),
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.reasoning.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct MarkerSplitter {
    start: String,
    end: String,
    state: ReasoningSplitState,
    held: String,
}

impl MarkerSplitter {
    #[must_use]
    pub fn new(markers: &MarkerPair) -> Self {
        Self {
            start: markers.start.clone(),
            end: markers.end.clone(),
            state: if markers.assume_open {
                ReasoningSplitState::InReasoning
            } else {
                ReasoningSplitState::Idle
            },
            held: String::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ReasoningSplitState {
        self.state
    }

    /// Split one content fragment into answer and reasoning parts.
    pub fn push(&mut self, text: &str) -> SplitOutput {
        if text.is_empty() {
            return SplitOutput::default();
        }
        let mut content = String::new();
        let mut reasoning = String::new();

        let mut pending = std::mem::take(&mut self.held);
        pending.push_str(text);
        let mut rest = pending.as_str();

        loop {
            match self.state {
                ReasoningSplitState::Done => {
                    content.push_str(rest);
                    break;
                }
                ReasoningSplitState::Idle => {
                    if let Some(at) = memmem::find(rest.as_bytes(), self.start.as_bytes()) {
                        content.push_str(&rest[..at]);
                        rest = &rest[at + self.start.len()..];
                        self.state = ReasoningSplitState::InReasoning;
                        continue;
                    }
                    let keep = partial_suffix_len(rest, &self.start);
                    let (emit, hold) = rest.split_at(rest.len() - keep);
                    content.push_str(emit);
                    self.held.push_str(hold);
                    break;
                }
                ReasoningSplitState::InReasoning => {
                    if let Some(at) = memmem::find(rest.as_bytes(), self.end.as_bytes()) {
                        reasoning.push_str(&rest[..at]);
                        rest = &rest[at + self.end.len()..];
                        self.state = ReasoningSplitState::Done;
                        continue;
                    }
                    let keep = partial_suffix_len(rest, &self.end);
                    let (emit, hold) = rest.split_at(rest.len() - keep);
                    reasoning.push_str(emit);
                    self.held.push_str(hold);
                    break;
                }
            }
        }

        SplitOutput::from_parts(content, reasoning)
    }

    /// Release any held-back partial marker at end of stream.
    ///
    /// The held text never completed a marker, so it is attributed to the
    /// side the splitter is currently on.
    pub fn flush(&mut self) -> SplitOutput {
        let held = std::mem::take(&mut self.held);
        match self.state {
            ReasoningSplitState::InReasoning => SplitOutput::from_parts(String::new(), held),
            ReasoningSplitState::Idle | ReasoningSplitState::Done => {
                SplitOutput::from_parts(held, String::new())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Native-field mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NativeStage {
    #[default]
    NotStarted,
    Active,
    Done,
}

#[derive(Debug, Default)]
pub struct NativeStageTracker {
    stage: NativeStage,
}

impl NativeStageTracker {
    #[must_use]
    pub fn stage(&self) -> NativeStage {
        self.stage
    }

    /// Observe one fragment. Returns `true` exactly once: on the first
    /// answer fragment that follows native reasoning.
    pub fn observe(&mut self, reasoning: Option<&str>, content: Option<&str>) -> bool {
        let has_reasoning = reasoning.is_some_and(|text| !text.is_empty());
        let has_content = content.is_some_and(|text| !text.is_empty());
        match self.stage {
            NativeStage::NotStarted if has_reasoning && !has_content => {
                self.stage = NativeStage::Active;
                false
            }
            NativeStage::NotStarted if has_reasoning => {
                self.stage = NativeStage::Done;
                true
            }
            NativeStage::NotStarted if has_content => {
                self.stage = NativeStage::Done;
                false
            }
            NativeStage::Active if has_content => {
                self.stage = NativeStage::Done;
                true
            }
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Chunk-level splitter
// ---------------------------------------------------------------------------

/// What the session needs to know after a chunk went through the splitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitSignal {
    /// Native reasoning on choice 0 just ended and its answer began.
    pub answer_started: bool,
}

/// Per-session reasoning splitter operating on whole chunks.
#[derive(Debug)]
pub struct ReasoningSplitter {
    mode: ReasoningMode,
    markers: FxHashMap<u32, MarkerSplitter>,
    native: FxHashMap<u32, NativeStageTracker>,
}

impl ReasoningSplitter {
    #[must_use]
    pub fn new(mode: ReasoningMode) -> Self {
        Self {
            mode,
            markers: FxHashMap::default(),
            native: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> &ReasoningMode {
        &self.mode
    }

    /// Native reasoning stage of one choice.
    #[must_use]
    pub fn native_stage(&self, index: u32) -> NativeStage {
        self.native
            .get(&index)
            .map_or(NativeStage::NotStarted, NativeStageTracker::stage)
    }

    /// Rewrite a chunk's choices in place.
    pub fn rewrite(&mut self, chunk: &mut Chunk) -> SplitSignal {
        let mut signal = SplitSignal::default();
        match &self.mode {
            ReasoningMode::Disabled => {}
            ReasoningMode::NativeField => {
                for choice in &chunk.choices {
                    let delta = &choice.delta;
                    let started = self.native.entry(choice.index).or_default().observe(
                        delta.reasoning_content.as_deref(),
                        delta.content.as_deref(),
                    );
                    if started && choice.index == 0 {
                        signal.answer_started = true;
                    }
                }
            }
            ReasoningMode::Markers(pair) => {
                for choice in &mut chunk.choices {
                    let Some(text) = choice.delta.content.take() else {
                        continue;
                    };
                    let splitter = self
                        .markers
                        .entry(choice.index)
                        .or_insert_with(|| MarkerSplitter::new(pair));
                    let out = splitter.push(&text);
                    apply_split(choice, out);
                }
            }
        }
        signal
    }

    /// Drain held-back marker prefixes as trailing choice deltas.
    pub fn flush(&mut self) -> Vec<ChoiceDelta> {
        let mut indexes: Vec<u32> = self.markers.keys().copied().collect();
        indexes.sort_unstable();
        let mut out = Vec::new();
        for index in indexes {
            let Some(splitter) = self.markers.get_mut(&index) else {
                continue;
            };
            let split = splitter.flush();
            if split.is_empty() {
                continue;
            }
            let mut choice = ChoiceDelta::new(index);
            apply_split(&mut choice, split);
            out.push(choice);
        }
        out
    }
}

fn apply_split(choice: &mut ChoiceDelta, out: SplitOutput) {
    choice.delta.content = out.content;
    if let Some(reasoning) = out.reasoning {
        match choice.delta.reasoning_content.as_mut() {
            Some(existing) => existing.push_str(&reasoning),
            None => choice.delta.reasoning_content = Some(reasoning),
        }
    }
}
