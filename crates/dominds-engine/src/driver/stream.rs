//! Runs one generation and turns generator events into transcript entries,
//! dialog events and parsed calls.

use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use dominds_core::events::DialogEvent;
use dominds_core::generator::{BatchItem, BatchOutput, GenRequest};
use dominds_core::health::{ContextHealthSnapshot, ContextLimits, UsageSnapshot};
use dominds_core::ids::DialogId;
use dominds_core::messages::ChatMessage;
use dominds_core::stream::{GenEvent, StreamPhase, StreamViolation};
use dominds_core::tellask::{TellaskCall, TellaskEventsReceiver, TellaskParser, TellaskValidation};

use crate::dialog::{Dialog, DialogEnv, GenBracket};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::runs::RunHandle;

/// A function call as the model produced it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct FuncCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Default)]
pub(crate) struct GenerationOutput {
    pub saying: String,
    pub func_calls: Vec<FuncCallRequest>,
    pub tellask_calls: Vec<TellaskCall>,
    pub usage: Option<UsageSnapshot>,
}

/// Turns parser callbacks into dialog events.
struct Forwarder<'a> {
    env: &'a DialogEnv,
    id: &'a DialogId,
    genseq: u32,
}

impl Forwarder<'_> {
    fn emit(&self, event: DialogEvent) {
        self.env.emit(event);
    }
}

impl TellaskEventsReceiver for Forwarder<'_> {
    fn markdown_start(&mut self) {
        self.emit(DialogEvent::MarkdownStart {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
        });
    }

    fn markdown_chunk(&mut self, chunk: &str) {
        self.emit(DialogEvent::MarkdownChunk {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
            chunk: chunk.to_string(),
        });
    }

    fn markdown_finish(&mut self) {
        self.emit(DialogEvent::MarkdownFinish {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
        });
    }

    fn call_start(&mut self, validation: &TellaskValidation) {
        self.emit(DialogEvent::TellaskCallStart {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
            validation: validation.clone(),
        });
    }

    fn call_headline_chunk(&mut self, chunk: &str) {
        self.emit(DialogEvent::TellaskHeadlineChunk {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
            chunk: chunk.to_string(),
        });
    }

    fn call_headline_finish(&mut self) {
        self.emit(DialogEvent::TellaskHeadlineFinish {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
        });
    }

    fn call_body_start(&mut self) {
        self.emit(DialogEvent::TellaskBodyStart {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
        });
    }

    fn call_body_chunk(&mut self, chunk: &str) {
        self.emit(DialogEvent::TellaskBodyChunk {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
            chunk: chunk.to_string(),
        });
    }

    fn call_body_finish(&mut self) {
        self.emit(DialogEvent::TellaskBodyFinish {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
        });
    }

    fn call_finish(&mut self, call: &TellaskCall) {
        self.emit(DialogEvent::TellaskCallFinish {
            dialog_id: self.id.clone(),
            genseq: self.genseq,
            call_id: call.call_id.clone(),
        });
    }
}

/// Folds generator events into the dialog. Shared by the streaming and
/// batch paths so both produce the same transcript and events.
struct Collector<'a> {
    dialog: &'a Dialog,
    genseq: u32,
    phase: StreamPhase,
    buf: String,
    parser: TellaskParser,
    out: GenerationOutput,
}

impl<'a> Collector<'a> {
    fn new(dialog: &'a Dialog, genseq: u32) -> Self {
        Self {
            dialog,
            genseq,
            phase: StreamPhase::Idle,
            buf: String::new(),
            parser: TellaskParser::new(),
            out: GenerationOutput::default(),
        }
    }

    fn forwarder(&self) -> Forwarder<'a> {
        Forwarder {
            env: self.dialog.env(),
            id: self.dialog.id(),
            genseq: self.genseq,
        }
    }

    fn emit(&self, event: DialogEvent) {
        self.dialog.emit(event);
    }

    fn handle(&mut self, event: GenEvent) -> Result<(), EngineError> {
        self.phase.advance(&event)?;
        let id = self.dialog.id().clone();
        let genseq = self.genseq;
        match event {
            GenEvent::ThinkingStart => {
                self.buf.clear();
                self.emit(DialogEvent::ThinkingStart { dialog_id: id, genseq });
            }
            GenEvent::ThinkingChunk { chunk } => {
                self.buf.push_str(&chunk);
                self.emit(DialogEvent::ThinkingChunk {
                    dialog_id: id,
                    genseq,
                    chunk,
                });
            }
            GenEvent::ThinkingFinish => {
                let content = std::mem::take(&mut self.buf);
                self.dialog
                    .append_message(ChatMessage::Thinking { genseq, content })?;
                self.emit(DialogEvent::ThinkingFinish { dialog_id: id, genseq });
            }
            GenEvent::SayingStart => {
                self.buf.clear();
                self.emit(DialogEvent::SayingStart { dialog_id: id, genseq });
            }
            GenEvent::SayingChunk { chunk } => {
                self.buf.push_str(&chunk);
                let mut fwd = self.forwarder();
                self.parser.take_upstream_chunk(&chunk, &mut fwd);
            }
            GenEvent::SayingFinish => {
                let mut fwd = self.forwarder();
                self.parser.finalize(&mut fwd);
                let content = std::mem::take(&mut self.buf);
                if !self.out.saying.is_empty() {
                    self.out.saying.push('\n');
                }
                self.out.saying.push_str(&content);
                self.dialog
                    .append_message(ChatMessage::Saying { genseq, content })?;
                self.emit(DialogEvent::SayingFinish { dialog_id: id, genseq });
            }
            GenEvent::FuncCall { id: call_id, name, arguments } => {
                self.dialog.append_message(ChatMessage::FuncCall {
                    genseq,
                    id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                })?;
                self.emit(DialogEvent::FuncCallRequested {
                    dialog_id: id,
                    genseq,
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                });
                self.out.func_calls.push(FuncCallRequest {
                    id: call_id,
                    name,
                    arguments,
                });
            }
            GenEvent::Usage(usage) => self.out.usage = Some(usage),
            GenEvent::Done => {}
            GenEvent::Error { error } => return Err(EngineError::Generator(error)),
        }
        Ok(())
    }

    fn finish(mut self) -> Result<GenerationOutput, EngineError> {
        if self.phase != StreamPhase::Idle {
            return Err(StreamViolation {
                event: "end_of_stream",
                phase: self.phase,
            }
            .into());
        }
        self.out.tellask_calls = self.parser.take_calls();
        Ok(self.out)
    }
}

fn batch_events(batch: BatchOutput) -> Vec<GenEvent> {
    let mut events = Vec::new();
    for item in batch.items {
        match item {
            BatchItem::Thinking { content } => {
                events.push(GenEvent::ThinkingStart);
                events.push(GenEvent::ThinkingChunk { chunk: content });
                events.push(GenEvent::ThinkingFinish);
            }
            BatchItem::Saying { content } => {
                events.push(GenEvent::SayingStart);
                events.push(GenEvent::SayingChunk { chunk: content });
                events.push(GenEvent::SayingFinish);
            }
            BatchItem::FuncCall { id, name, arguments } => {
                events.push(GenEvent::FuncCall { id, name, arguments });
            }
        }
    }
    events.extend(batch.usage.map(GenEvent::Usage));
    events.push(GenEvent::Done);
    events
}

/// Health of the context that was just sent.
pub(crate) fn measure_health(usage: Option<&UsageSnapshot>, limits: Option<ContextLimits>) -> ContextHealthSnapshot {
    match (usage, limits) {
        (Some(usage), Some(limits)) => ContextHealthSnapshot::measure(usage, &limits),
        (None, _) => ContextHealthSnapshot::unavailable("generator reported no usage"),
        (_, None) => ContextHealthSnapshot::unavailable("model context length unknown"),
    }
}

impl Engine {
    /// Run one generation, streaming or batch, checking for interruption
    /// at every await.
    pub(crate) async fn generate(
        &self,
        dialog: &Arc<Dialog>,
        run: &RunHandle,
        bracket: GenBracket,
        streaming: bool,
        request: GenRequest,
    ) -> Result<GenerationOutput, EngineError> {
        let mut collector = Collector::new(dialog, bracket.genseq);

        if !streaming {
            let batch = tokio::select! {
                reason = run.interrupted() => return Err(EngineError::Interrupted(reason)),
                batch = self.generator.generate(&request) => batch?,
            };
            run.check()?;
            for event in batch_events(batch) {
                collector.handle(event)?;
            }
            return collector.finish();
        }

        let mut stream = tokio::select! {
            reason = run.interrupted() => return Err(EngineError::Interrupted(reason)),
            opened = self.generator.stream(&request) => opened?,
        };
        let mut events = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                reason = run.interrupted() => return Err(EngineError::Interrupted(reason)),
                next = stream.next() => next,
            };
            let Some(event) = next else { break };
            events += 1;
            if let Err(e) = collector.handle(event) {
                if matches!(e, EngineError::StreamProtocol(_)) {
                    warn!(dialog_id = %dialog.id(), genseq = bracket.genseq, error = %e, "stream protocol violation");
                }
                return Err(e);
            }
        }
        debug!(dialog_id = %dialog.id(), genseq = bracket.genseq, events, "stream finished");
        collector.finish()
    }
}
