use std::sync::Arc;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Checker seam
// ---------------------------------------------------------------------------

/// What a safety checker reported for one checked prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyFindings {
    pub category: String,
    pub detail: String,
    /// Length in bytes of the text prefix that produced the findings.
    pub checked_len: usize,
}

/// Black-box content check, invoked with the visible text up to the current
/// point. Implementations are injected into the session.
pub trait SafetyChecker: Send + Sync {
    fn check(&self, text: &str) -> Option<SafetyFindings>;
}

/// Checker that never reports anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChecker;

impl SafetyChecker for NoopChecker {
    fn check(&self, _text: &str) -> Option<SafetyFindings> {
        None
    }
}

/// Case-insensitive blocked-term checker driven by configuration.
#[derive(Debug, Clone, Default)]
pub struct TermListChecker {
    terms: Vec<String>,
}

impl TermListChecker {
    #[must_use]
    pub fn new(terms: &[String]) -> Self {
        Self {
            terms: terms
                .iter()
                .map(|term| term.trim().to_lowercase())
                .filter(|term| !term.is_empty())
                .collect(),
        }
    }
}

impl SafetyChecker for TermListChecker {
    fn check(&self, text: &str) -> Option<SafetyFindings> {
        if self.terms.is_empty() {
            return None;
        }
        let lowered = text.to_lowercase();
        let term = self.terms.iter().find(|term| lowered.contains(term.as_str()))?;
        Some(SafetyFindings {
            category: "blocked_term".to_string(),
            detail: term.clone(),
            checked_len: text.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[inline]
fn is_sentence_terminal(c: char) -> bool {
    matches!(
        c,
        '.' | '!' | '?' | ';' | '\n' | '\u{3002}' | '\u{ff01}' | '\u{ff1f}' | '\u{ff1b}'
    )
}

/// Sentence-boundary checkpoint. Only ever touched by the session task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SafetyCheckpoint {
    last_checked_len: usize,
    dirty: bool,
}

impl SafetyCheckpoint {
    #[must_use]
    pub fn last_checked_len(&self) -> usize {
        self.last_checked_len
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// `true` when the text appended since the last check ends a sentence,
    /// or unconditionally on the final call.
    #[must_use]
    pub fn should_check(&self, text_so_far: &str, is_final: bool) -> bool {
        if is_final {
            return true;
        }
        if !self.dirty {
            return false;
        }
        text_so_far
            .get(self.last_checked_len..)
            .and_then(|suffix| suffix.chars().next_back())
            .is_some_and(is_sentence_terminal)
    }

    pub fn advance(&mut self, checked_len: usize) {
        self.last_checked_len = checked_len;
        self.dirty = false;
    }

    /// Restart on a fresh text (reasoning just handed over to the answer).
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Amortized safety gate: owns the visible text, the checkpoint and the
/// injected checker, and records every finding.
pub struct SafetyGate {
    checker: Arc<dyn SafetyChecker>,
    checkpoint: SafetyCheckpoint,
    text: String,
    findings: Vec<SafetyFindings>,
    invocations: u64,
}

impl std::fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyGate")
            .field("checkpoint", &self.checkpoint)
            .field("text_len", &self.text.len())
            .field("findings", &self.findings.len())
            .field("invocations", &self.invocations)
            .finish_non_exhaustive()
    }
}

impl SafetyGate {
    #[must_use]
    pub fn new(checker: Arc<dyn SafetyChecker>) -> Self {
        Self {
            checker,
            checkpoint: SafetyCheckpoint::default(),
            text: String::new(),
            findings: Vec::new(),
            invocations: 0,
        }
    }

    /// Append visible text and check if a sentence just ended.
    pub fn observe(&mut self, fragment: &str) -> Option<&SafetyFindings> {
        if fragment.is_empty() {
            return None;
        }
        self.text.push_str(fragment);
        self.checkpoint.mark_dirty();
        if self.checkpoint.should_check(&self.text, false) {
            self.run_check()
        } else {
            None
        }
    }

    /// Mandatory check at completion.
    pub fn finish(&mut self) -> Option<&SafetyFindings> {
        if self.checkpoint.should_check(&self.text, true) {
            self.run_check()
        } else {
            None
        }
    }

    /// Drop the tracked text and restart the checkpoint at zero.
    pub fn reset(&mut self) {
        self.text.clear();
        self.checkpoint.reset();
    }

    #[must_use]
    pub fn invocations(&self) -> u64 {
        self.invocations
    }

    #[must_use]
    pub fn checkpoint(&self) -> SafetyCheckpoint {
        self.checkpoint
    }

    #[must_use]
    pub fn findings(&self) -> &[SafetyFindings] {
        &self.findings
    }

    pub fn take_findings(&mut self) -> Vec<SafetyFindings> {
        std::mem::take(&mut self.findings)
    }

    fn run_check(&mut self) -> Option<&SafetyFindings> {
        self.invocations += 1;
        let checked_len = self.text.len();
        let result = self.checker.check(&self.text);
        self.checkpoint.advance(checked_len);
        let findings = result?;
        tracing::warn!(
            category = %findings.category,
            detail = %findings.detail,
            checked_len,
            "safety check reported findings"
        );
        self.findings.push(findings);
        self.findings.last()
    }
}
