//! Incremental answer formatting and the client event protocol.
//!
//! Model fragments arrive in arbitrary splits; the formatter re-buffers
//! them into whole lines, applies line-level cleanup, and emits one token
//! event per formatted line. Only the incomplete trailing line is ever held
//! back, so streaming latency stays at one line. Every stream ends with
//! exactly one terminal event, done or error, never both.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::pipeline::context::Citation;

/// Wire events of the answer stream, serialized as SSE `data:` payloads.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Token { token: String },
    Done,
    Error { error: String },
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#{1,3} \S").unwrap())
}

pub struct StreamFormatter {
    citations: Vec<Citation>,
    /// Incomplete trailing line awaiting more input.
    pending: String,
    /// Everything emitted so far, for the structural guarantee that the
    /// emitted tokens concatenate to the formatted answer.
    formatted: String,
    blank_run: usize,
    emitted_any: bool,
    terminated: bool,
}

impl StreamFormatter {
    pub fn new(citations: Vec<Citation>) -> Self {
        Self {
            citations,
            pending: String::new(),
            formatted: String::new(),
            blank_run: 0,
            emitted_any: false,
            terminated: false,
        }
    }

    /// Feed a model fragment; returns zero or more token events.
    pub fn push(&mut self, fragment: &str) -> Vec<StreamEvent> {
        if self.terminated || fragment.is_empty() {
            return Vec::new();
        }

        self.pending.push_str(fragment);
        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            self.emit_line(&line, &mut events);
        }
        events
    }

    /// Flush the trailing line, append the sources section when the answer
    /// lacks one, and close with `Done`. Idempotent: a second call after any
    /// terminal returns nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }

        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit_line(&line, &mut events);
        }

        if !self.citations.is_empty() && !self.formatted.contains("Sources:") {
            let mut section = String::from("\n\nSources:\n");
            for citation in &self.citations {
                section.push_str(&format!("{} {}\n", citation.label, citation.source));
            }
            self.formatted.push_str(&section);
            events.push(StreamEvent::Token { token: section });
        }

        self.terminated = true;
        events.push(StreamEvent::Done);
        events
    }

    /// Close the stream with an error. When tokens were already emitted the
    /// client keeps the partial answer; the error event tells it the answer
    /// is truncated.
    pub fn fail(&mut self, message: String) -> Vec<StreamEvent> {
        if self.terminated {
            return Vec::new();
        }
        self.terminated = true;
        self.pending.clear();
        vec![StreamEvent::Error { error: message }]
    }

    pub fn emitted_any(&self) -> bool {
        self.emitted_any
    }

    /// Formatted answer accumulated so far.
    pub fn formatted(&self) -> &str {
        &self.formatted
    }

    fn emit_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let is_blank = line.trim().is_empty();

        // Collapse runs of three or more blank lines down to two.
        if is_blank {
            if self.blank_run >= 2 {
                return;
            }
            self.blank_run += 1;
        } else {
            self.blank_run = 0;
        }

        let mut out = line.to_string();

        // A heading jammed against its body gets breathing room.
        if heading_re().is_match(line.trim_end()) && out.ends_with('\n') {
            out.push('\n');
            self.blank_run = 1;
        }

        self.formatted.push_str(&out);
        self.emitted_any = true;
        events.push(StreamEvent::Token { token: out });
    }
}
