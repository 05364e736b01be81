use std::mem;

use sha2::{Digest, Sha256};

use super::{MalformedReason, TellaskCall, TellaskEventsReceiver, TellaskValidation};

/// A body line's `!?` marker reads as this in the body text.
const BODY_LINE_LEAD: &str = " ";

/// Where the parser is within the current physical line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Nothing of this line consumed yet.
    LineStart,
    /// Consumed a leading `!`; the next char decides.
    Bang,
    Markdown,
    /// Consumed `!?`; the next char decides headline/body/mention.
    Prefix,
    /// Inside the `@mention` of a block's first line.
    Mention,
    Headline,
    Body,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkKind {
    Markdown,
    Headline,
    Body,
}

#[derive(Debug, Default)]
struct OpenCall {
    line: usize,
    validation: Option<TellaskValidation>,
    mention_raw: String,
    headline: String,
    body: String,
    headline_finished: bool,
    body_started: bool,
}

#[derive(Debug, Default)]
enum Block {
    #[default]
    None,
    Markdown,
    Call(OpenCall),
}

/// Incremental parser for the tellask line protocol.
///
/// Decisions are made one character at a time, so the callback sequence
/// does not depend on where the upstream split its chunks.
#[derive(Debug)]
pub struct TellaskParser {
    phase: Phase,
    block: Block,
    pending: String,
    pending_kind: Option<ChunkKind>,
    counter: u64,
    calls: Vec<TellaskCall>,
}

impl Default for TellaskParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TellaskParser {
    pub fn new() -> Self {
        Self {
            phase: Phase::LineStart,
            block: Block::None,
            pending: String::new(),
            pending_kind: None,
            counter: 0,
            calls: Vec::new(),
        }
    }

    pub fn take_upstream_chunk<R>(&mut self, chunk: &str, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        for ch in chunk.chars() {
            self.feed(ch, rcv);
        }
        self.flush(rcv);
    }

    /// Close whatever is open at end of input.
    pub fn finalize<R>(&mut self, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        match self.phase {
            Phase::Bang => {
                self.begin_markdown_line(rcv);
                self.push_chunk(ChunkKind::Markdown, "!", rcv);
            }
            Phase::Prefix if self.on_first_line() => {
                self.start_call(
                    TellaskValidation::Malformed {
                        reason: MalformedReason::MissingMentionPrefix,
                    },
                    rcv,
                );
            }
            Phase::Mention => self.resolve_mention(rcv),
            _ => {}
        }
        self.phase = Phase::LineStart;
        self.close_block(rcv);
    }

    /// Calls completed so far.
    pub fn calls(&self) -> &[TellaskCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<TellaskCall> {
        mem::take(&mut self.calls)
    }

    fn feed<R>(&mut self, ch: char, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        match self.phase {
            Phase::LineStart => {
                if ch == '!' {
                    self.phase = Phase::Bang;
                } else {
                    self.begin_markdown_line(rcv);
                    self.markdown_char(ch, rcv);
                }
            }
            Phase::Bang => {
                if ch == '?' {
                    self.begin_tellask_line(rcv);
                    self.phase = Phase::Prefix;
                } else {
                    self.begin_markdown_line(rcv);
                    self.push_chunk(ChunkKind::Markdown, "!", rcv);
                    self.markdown_char(ch, rcv);
                }
            }
            Phase::Markdown => self.markdown_char(ch, rcv),
            Phase::Prefix => self.after_prefix(ch, rcv),
            Phase::Mention => {
                if is_mention_char(ch) {
                    if let Block::Call(call) = &mut self.block {
                        call.mention_raw.push(ch);
                    }
                } else {
                    self.resolve_mention(rcv);
                    self.headline_char(ch, rcv);
                }
            }
            Phase::Headline => self.headline_char(ch, rcv),
            Phase::Body => self.body_char(ch, rcv),
        }
    }

    fn on_first_line(&self) -> bool {
        matches!(&self.block, Block::Call(call) if call.line == 0)
    }

    fn after_prefix<R>(&mut self, ch: char, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        let (first_line, body_started) = match &self.block {
            Block::Call(call) => (call.line == 0, call.body_started),
            _ => (true, false),
        };
        if first_line {
            if ch == '@' {
                self.phase = Phase::Mention;
            } else {
                self.start_call(
                    TellaskValidation::Malformed {
                        reason: MalformedReason::MissingMentionPrefix,
                    },
                    rcv,
                );
                self.phase = Phase::Headline;
                self.headline_char(ch, rcv);
            }
        } else if !body_started && ch == '@' {
            self.push_headline("\n@", rcv);
            self.phase = Phase::Headline;
        } else {
            self.begin_body(rcv);
            self.phase = Phase::Body;
            self.push_body(BODY_LINE_LEAD, rcv);
            self.body_char(ch, rcv);
        }
    }

    fn resolve_mention<R>(&mut self, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        let raw = match &mut self.block {
            Block::Call(call) => mem::take(&mut call.mention_raw),
            _ => String::new(),
        };
        let trimmed = raw.trim_end_matches('.');
        self.phase = Phase::Headline;
        if trimmed.is_empty() {
            self.start_call(
                TellaskValidation::Malformed {
                    reason: MalformedReason::InvalidMentionId,
                },
                rcv,
            );
            self.push_headline(&format!("@{raw}"), rcv);
        } else {
            self.start_call(
                TellaskValidation::Valid {
                    first_mention: trimmed.to_string(),
                },
                rcv,
            );
            self.push_headline(&raw[trimmed.len()..], rcv);
        }
    }

    fn start_call<R>(&mut self, validation: TellaskValidation, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        self.flush(rcv);
        rcv.call_start(&validation);
        if let Block::Call(call) = &mut self.block {
            call.validation = Some(validation);
        }
    }

    fn begin_markdown_line<R>(&mut self, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        if matches!(self.block, Block::Call(_)) {
            self.close_block(rcv);
        }
        if !matches!(self.block, Block::Markdown) {
            self.flush(rcv);
            rcv.markdown_start();
            self.block = Block::Markdown;
        }
    }

    fn begin_tellask_line<R>(&mut self, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        match &mut self.block {
            Block::Call(call) => call.line += 1,
            Block::Markdown => {
                self.close_block(rcv);
                self.block = Block::Call(OpenCall::default());
            }
            Block::None => self.block = Block::Call(OpenCall::default()),
        }
    }

    fn begin_body<R>(&mut self, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        self.flush(rcv);
        if let Block::Call(call) = &mut self.block {
            if !call.headline_finished {
                call.headline_finished = true;
                rcv.call_headline_finish();
            }
            if !call.body_started {
                call.body_started = true;
                rcv.call_body_start();
            }
        }
    }

    fn close_block<R>(&mut self, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        self.flush(rcv);
        match mem::take(&mut self.block) {
            Block::None => {}
            Block::Markdown => rcv.markdown_finish(),
            Block::Call(call) => self.finish_call(call, rcv),
        }
    }

    fn finish_call<R>(&mut self, mut call: OpenCall, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        let validation = match call.validation.take() {
            Some(v) => v,
            None => {
                let v = TellaskValidation::Malformed {
                    reason: MalformedReason::MissingMentionPrefix,
                };
                rcv.call_start(&v);
                v
            }
        };
        if !call.headline_finished {
            rcv.call_headline_finish();
        }
        if call.body_started {
            rcv.call_body_finish();
        }
        self.counter += 1;
        let done = TellaskCall {
            call_id: call_id(&validation, &call.headline, &call.body, self.counter),
            validation,
            headline: call.headline,
            body: call.body,
        };
        rcv.call_finish(&done);
        self.calls.push(done);
    }

    fn markdown_char<R>(&mut self, ch: char, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        let mut buf = [0u8; 4];
        self.push_chunk(ChunkKind::Markdown, ch.encode_utf8(&mut buf), rcv);
        self.phase = if ch == '\n' {
            Phase::LineStart
        } else {
            Phase::Markdown
        };
    }

    fn headline_char<R>(&mut self, ch: char, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        if ch == '\n' {
            self.phase = Phase::LineStart;
        } else {
            let mut buf = [0u8; 4];
            self.push_headline(ch.encode_utf8(&mut buf), rcv);
        }
    }

    fn body_char<R>(&mut self, ch: char, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        let mut buf = [0u8; 4];
        self.push_body(ch.encode_utf8(&mut buf), rcv);
        if ch == '\n' {
            self.phase = Phase::LineStart;
        }
    }

    fn push_body<R>(&mut self, s: &str, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        if let Block::Call(call) = &mut self.block {
            call.body.push_str(s);
        }
        self.push_chunk(ChunkKind::Body, s, rcv);
    }

    fn push_headline<R>(&mut self, s: &str, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        if s.is_empty() {
            return;
        }
        if let Block::Call(call) = &mut self.block {
            call.headline.push_str(s);
        }
        self.push_chunk(ChunkKind::Headline, s, rcv);
    }

    fn push_chunk<R>(&mut self, kind: ChunkKind, s: &str, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        if self.pending_kind != Some(kind) {
            self.flush(rcv);
            self.pending_kind = Some(kind);
        }
        self.pending.push_str(s);
    }

    fn flush<R>(&mut self, rcv: &mut R)
    where
        R: TellaskEventsReceiver + ?Sized,
    {
        let Some(kind) = self.pending_kind.take() else {
            return;
        };
        if self.pending.is_empty() {
            return;
        }
        let text = mem::take(&mut self.pending);
        match kind {
            ChunkKind::Markdown => rcv.markdown_chunk(&text),
            ChunkKind::Headline => rcv.call_headline_chunk(&text),
            ChunkKind::Body => rcv.call_body_chunk(&text),
        }
    }
}

fn is_mention_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.') || ch.is_alphabetic() || ch.is_numeric()
}

fn call_id(validation: &TellaskValidation, headline: &str, body: &str, counter: u64) -> String {
    let mention = match validation {
        TellaskValidation::Valid { first_mention } => first_mention.as_str(),
        TellaskValidation::Malformed { .. } => "",
    };
    let mut hasher = Sha256::new();
    for part in [validation.kind(), mention, headline, body] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(counter.to_le_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("tk{counter}-{hex}")
}
