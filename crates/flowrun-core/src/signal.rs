//! Log signal detection.
//!
//! Agent log lines are free text. This module recognises a small set of
//! markers in them (upstream quota exhaustion, credential rotation, and the
//! combined "exhausted and rotated" marker) and turns the newest one into a
//! typed [`LogSignal`]. The matching vocabulary is data ([`Vocabulary`]) and
//! the detector sits behind [`SignalDetector`], so a structured event source
//! can replace it without touching callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Number of newest lines inspected per scan.
pub const DEFAULT_SIGNAL_WINDOW: usize = 20;

/// How long a cleared quota signature stays suppressed.
pub const DEFAULT_SIGNAL_COOLDOWN: Duration = Duration::from_secs(60);

/// Severity of a log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    #[serde(alias = "warn")]
    Warning,
    #[serde(alias = "critical")]
    Error,
    #[serde(other)]
    Other,
}

/// One line of a task's log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Strictly increasing sequence number.
    pub seq: u64,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(seq: u64, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            seq,
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Bounded, incrementally-filled tail of a log stream.
#[derive(Debug, Clone)]
pub struct LogTail {
    capacity: usize,
    lines: Vec<LogLine>,
    last_seq: Option<u64>,
}

impl LogTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Vec::new(),
            last_seq: None,
        }
    }

    /// Append lines newer than anything seen so far; returns how many were kept.
    ///
    /// Replayed or out-of-order lines are dropped, so feeding the same page
    /// twice is harmless.
    pub fn append(&mut self, lines: impl IntoIterator<Item = LogLine>) -> usize {
        let mut appended = 0;
        for line in lines {
            if self.last_seq.is_some_and(|last| line.seq <= last) {
                continue;
            }
            self.last_seq = Some(line.seq);
            self.lines.push(line);
            appended += 1;
        }
        if self.lines.len() > self.capacity {
            let excess = self.lines.len() - self.capacity;
            self.lines.drain(..excess);
        }
        appended
    }

    /// Sequence number to resume fetching after.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }
}

/// Typed outcome of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSignal {
    #[default]
    None,
    /// Upstream engine reported a rate limit or exhausted quota.
    QuotaExhausted,
    /// A credential or session was rotated/restarted successfully.
    KeyRotation,
    /// Quota exhausted and the credential already rotated: the run can be
    /// recovered by cancelling and resuming.
    QuotaExhaustedRotated,
}

/// Classification of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Combined,
    Rotation,
    Quota,
    /// Quota vocabulary without an upstream-engine origin.
    Ambiguous,
    Unrelated,
}

/// Marker phrases, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Explicit "exhausted and rotated" markers.
    pub combined: Vec<String>,
    /// Successful credential/session rotation markers.
    pub rotation: Vec<String>,
    /// Rate-limit and quota vocabulary.
    pub quota: Vec<String>,
    /// Terms identifying the upstream generation engine as a line's origin.
    pub engine_origin: Vec<String>,
}

fn strings(terms: &[&str]) -> Vec<String> {
    terms.iter().map(|t| t.to_string()).collect()
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            combined: strings(&[
                "exhausted and rotated",
                "exhausted, rotated",
                "exhausted & rotated",
                "exhausted_and_rotated",
                "rotated after quota exhaustion",
                "rotated due to quota exhaustion",
            ]),
            rotation: strings(&[
                "key rotated",
                "keys rotated",
                "rotated api key",
                "rotated to key",
                "credential rotated",
                "credentials rotated",
                "rotation successful",
                "rotation succeeded",
                "session restarted",
                "restarted session",
            ]),
            quota: strings(&[
                "429",
                "resource exhausted",
                "resource_exhausted",
                "too many requests",
                "quota",
                "rate limit",
                "rate_limit",
                "ratelimit",
            ]),
            engine_origin: strings(&[
                "gemini",
                "claude",
                "anthropic",
                "openai",
                "codex",
                "vertex",
                "generativelanguage",
                "model api",
            ]),
        }
    }
}

impl Vocabulary {
    /// Classify one message.
    pub fn classify(&self, message: &str) -> LineClass {
        let lower = message.to_lowercase();
        if contains_any(&lower, &self.combined) {
            LineClass::Combined
        } else if contains_any(&lower, &self.rotation) {
            LineClass::Rotation
        } else if contains_any(&lower, &self.quota) {
            if contains_any(&lower, &self.engine_origin) {
                LineClass::Quota
            } else {
                LineClass::Ambiguous
            }
        } else {
            LineClass::Unrelated
        }
    }

    /// Returns true if a task error message describes quota exhaustion.
    pub fn is_quota_failure(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        contains_any(&lower, &self.combined) || contains_any(&lower, &self.quota)
    }
}

fn contains_any(haystack: &str, terms: &[String]) -> bool {
    terms.iter().any(|term| contains_term(haystack, &term.to_lowercase()))
}

/// Substring match; numeric terms (e.g. "429") must stand alone so they do
/// not match inside longer numbers.
fn contains_term(haystack: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    if !term.bytes().all(|b| b.is_ascii_digit()) {
        return haystack.contains(term);
    }
    let bytes = haystack.as_bytes();
    haystack.match_indices(term).any(|(start, _)| {
        let end = start + term.len();
        let before = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let after = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        before && after
    })
}

/// Normalized form of a message used to recognise repeats: lower-cased,
/// digit runs collapsed, whitespace squeezed.
pub fn signature(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut in_digits = false;
    for word in message.to_lowercase().split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        for ch in word.chars() {
            if ch.is_ascii_digit() {
                if !in_digits {
                    out.push('#');
                }
                in_digits = true;
            } else {
                out.push(ch);
                in_digits = false;
            }
        }
        in_digits = false;
    }
    out
}

/// Result of scanning a window.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Detection {
    pub signal: LogSignal,
    /// Sequence number of the line the signal came from.
    pub seq: Option<u64>,
    pub signature: Option<String>,
    /// Quota-like lines skipped for lacking an engine origin.
    pub ambiguous: usize,
    /// A quota line matched but was held back by the cool-down.
    pub suppressed: bool,
}

/// Turns a window of log lines into a signal.
pub trait SignalDetector: Send {
    /// Scan `window` (oldest first) newest-to-oldest.
    fn scan(&mut self, window: &[LogLine], now: Instant) -> Detection;

    /// Returns true if a task failure with this message can be recovered.
    fn is_retriable_failure(&self, error: &str) -> bool;
}

/// Vocabulary-driven [`SignalDetector`] with flap suppression.
#[derive(Debug, Clone)]
pub struct LogSignalDetector {
    vocabulary: Vocabulary,
    window: usize,
    cooldown: Duration,
    /// Signature of the quota signal currently raised.
    active: Option<String>,
    /// Signatures superseded by a rotation, and when.
    cleared: HashMap<String, Instant>,
}

impl LogSignalDetector {
    pub fn new(vocabulary: Vocabulary) -> Self {
        Self {
            vocabulary,
            window: DEFAULT_SIGNAL_WINDOW,
            cooldown: DEFAULT_SIGNAL_COOLDOWN,
            active: None,
            cleared: HashMap::new(),
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    fn settle(
        &mut self,
        signal: LogSignal,
        line: &LogLine,
        ambiguous: usize,
        now: Instant,
    ) -> Detection {
        let cooldown = self.cooldown;
        self.cleared
            .retain(|_, cleared_at| now.saturating_duration_since(*cleared_at) < cooldown);

        let signature = signature(&line.message);
        let mut detection = Detection {
            signal,
            seq: Some(line.seq),
            signature: Some(signature.clone()),
            ambiguous,
            suppressed: false,
        };

        if signal == LogSignal::KeyRotation {
            if let Some(active) = self.active.take() {
                self.cleared.insert(active, now);
            }
        } else if self.cleared.contains_key(&signature) {
            detection.signal = LogSignal::None;
            detection.suppressed = true;
        } else {
            self.active = Some(signature);
        }
        detection
    }
}

impl Default for LogSignalDetector {
    fn default() -> Self {
        Self::new(Vocabulary::default())
    }
}

impl SignalDetector for LogSignalDetector {
    fn scan(&mut self, window: &[LogLine], now: Instant) -> Detection {
        let start = window.len().saturating_sub(self.window);
        let mut ambiguous = 0;

        for line in window[start..].iter().rev() {
            let signal = match self.vocabulary.classify(&line.message) {
                LineClass::Combined => LogSignal::QuotaExhaustedRotated,
                LineClass::Rotation => LogSignal::KeyRotation,
                LineClass::Quota => LogSignal::QuotaExhausted,
                LineClass::Ambiguous => {
                    ambiguous += 1;
                    continue;
                }
                LineClass::Unrelated => continue,
            };
            return self.settle(signal, line, ambiguous, now);
        }

        Detection {
            ambiguous,
            ..Detection::default()
        }
    }

    fn is_retriable_failure(&self, error: &str) -> bool {
        self.vocabulary.is_quota_failure(error)
    }
}
