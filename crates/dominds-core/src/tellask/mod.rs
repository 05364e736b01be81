//! The tellask line protocol.
//!
//! Any line starting with `!?` is protocol syntax, everything else is
//! markdown. A run of consecutive `!?` lines forms one call block:
//!
//! ```text
//! !?@pangu compute 1+1        <- line 0: mention + headline
//! !?@also-cc this headline    <- `!?@` before any body line: more headline
//! !?return only the number    <- any other `!?` line: body
//! ```
//!
//! In the body, each line's `!?` becomes a single space, so the example's
//! body is `" return only the number\n"`.

mod parser;

pub use parser::TellaskParser;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedReason {
    MissingMentionPrefix,
    InvalidMentionId,
}

/// Outcome of checking a call block's first line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TellaskValidation {
    Valid { first_mention: String },
    Malformed { reason: MalformedReason },
}

impl TellaskValidation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Valid { .. } => "valid",
            Self::Malformed { .. } => "malformed",
        }
    }
}

/// A complete call block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TellaskCall {
    pub call_id: String,
    pub validation: TellaskValidation,
    pub headline: String,
    pub body: String,
}

impl TellaskCall {
    pub fn first_mention(&self) -> Option<&str> {
        match &self.validation {
            TellaskValidation::Valid { first_mention } => Some(first_mention),
            TellaskValidation::Malformed { .. } => None,
        }
    }

    /// Headline as the author wrote it, mention included.
    pub fn tellask_head(&self) -> String {
        match self.first_mention() {
            Some(mention) => format!("@{mention}{}", self.headline),
            None => self.headline.clone(),
        }
    }
}

/// Ordered callbacks produced by [`TellaskParser`].
///
/// Chunk callbacks may be split differently depending on how the input
/// arrived; the concatenated content and every other callback are stable.
pub trait TellaskEventsReceiver {
    fn markdown_start(&mut self);
    fn markdown_chunk(&mut self, chunk: &str);
    fn markdown_finish(&mut self);

    fn call_start(&mut self, validation: &TellaskValidation);
    fn call_headline_chunk(&mut self, chunk: &str);
    fn call_headline_finish(&mut self);
    fn call_body_start(&mut self);
    fn call_body_chunk(&mut self, chunk: &str);
    fn call_body_finish(&mut self);
    fn call_finish(&mut self, call: &TellaskCall);
}

/// Receiver that ignores everything; the parser still collects calls.
pub struct NullReceiver;

impl TellaskEventsReceiver for NullReceiver {
    fn markdown_start(&mut self) {}
    fn markdown_chunk(&mut self, _chunk: &str) {}
    fn markdown_finish(&mut self) {}
    fn call_start(&mut self, _validation: &TellaskValidation) {}
    fn call_headline_chunk(&mut self, _chunk: &str) {}
    fn call_headline_finish(&mut self) {}
    fn call_body_start(&mut self) {}
    fn call_body_chunk(&mut self, _chunk: &str) {}
    fn call_body_finish(&mut self) {}
    fn call_finish(&mut self, _call: &TellaskCall) {}
}

/// Parse a complete text in one go.
pub fn parse_text(text: &str) -> Vec<TellaskCall> {
    let mut parser = TellaskParser::new();
    parser.take_upstream_chunk(text, &mut NullReceiver);
    parser.finalize(&mut NullReceiver);
    parser.take_calls()
}
