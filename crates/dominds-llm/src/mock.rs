use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use dominds_core::errors::GeneratorError;
use dominds_core::generator::{BatchItem, BatchOutput, GenRequest, GenStream, Generator};
use dominds_core::health::UsageSnapshot;
use dominds_core::stream::GenEvent;

type Responder = Arc<dyn Fn(&GenRequest) -> Script + Send + Sync>;

/// One pre-programmed generation.
#[derive(Clone)]
pub enum Script {
    /// Yield these events (batch mode folds them into messages).
    Events(Vec<GenEvent>),
    /// Fail the call itself, before any event.
    Error(GeneratorError),
    /// Wait, then play the inner script.
    Delay(Duration, Box<Script>),
    /// Decide from the request (e.g. answer differently once a teammate
    /// response is in context).
    Respond(Responder),
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Events(events) => f.debug_tuple("Events").field(&events.len()).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            Self::Delay(d, inner) => f.debug_tuple("Delay").field(d).field(inner).finish(),
            Self::Respond(_) => f.write_str("Respond(..)"),
        }
    }
}

impl Script {
    /// A plain saying, streamed as one chunk.
    pub fn saying(text: &str) -> Self {
        Self::saying_with_usage(text, None)
    }

    pub fn saying_with_usage(text: &str, usage: Option<UsageSnapshot>) -> Self {
        let mut events = vec![
            GenEvent::SayingStart,
            GenEvent::SayingChunk {
                chunk: text.to_string(),
            },
            GenEvent::SayingFinish,
        ];
        events.extend(usage.map(GenEvent::Usage));
        events.push(GenEvent::Done);
        Self::Events(events)
    }

    /// A saying streamed in the given pieces, to exercise chunk boundaries.
    pub fn saying_chunks(chunks: &[&str]) -> Self {
        let mut events = vec![GenEvent::SayingStart];
        events.extend(chunks.iter().map(|c| GenEvent::SayingChunk {
            chunk: c.to_string(),
        }));
        events.push(GenEvent::SayingFinish);
        events.push(GenEvent::Done);
        Self::Events(events)
    }

    pub fn thinking_then_saying(thought: &str, text: &str) -> Self {
        Self::Events(vec![
            GenEvent::ThinkingStart,
            GenEvent::ThinkingChunk {
                chunk: thought.to_string(),
            },
            GenEvent::ThinkingFinish,
            GenEvent::SayingStart,
            GenEvent::SayingChunk {
                chunk: text.to_string(),
            },
            GenEvent::SayingFinish,
            GenEvent::Done,
        ])
    }

    /// A single function call and nothing else.
    pub fn func_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self::Events(vec![
            GenEvent::FuncCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
            GenEvent::Done,
        ])
    }

    /// Fails mid-stream after `partial` text has been delivered.
    pub fn stream_error_after(partial: &str, error: GeneratorError) -> Self {
        Self::Events(vec![
            GenEvent::SayingStart,
            GenEvent::SayingChunk {
                chunk: partial.to_string(),
            },
            GenEvent::Error { error },
        ])
    }

    /// Fails before any content.
    pub fn stream_error(error: GeneratorError) -> Self {
        Self::Events(vec![GenEvent::Error { error }])
    }

    pub fn delayed(delay: Duration, inner: Script) -> Self {
        Self::Delay(delay, Box::new(inner))
    }

    pub fn respond<F>(f: F) -> Self
    where
        F: Fn(&GenRequest) -> Script + Send + Sync + 'static,
    {
        Self::Respond(Arc::new(f))
    }
}

/// Generator double that plays scripts in order and records every request.
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Option<Script>,
    requests: Mutex<Vec<GenRequest>>,
    call_count: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Script played once the queue is empty, instead of failing.
    pub fn with_fallback(mut self, fallback: Script) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<GenRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<GenRequest> {
        self.requests.lock().last().cloned()
    }

    fn next_script(&self, request: &GenRequest) -> Result<Script, GeneratorError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());
        let script = self.scripts.lock().pop_front();
        script.or_else(|| self.fallback.clone()).ok_or_else(|| {
            GeneratorError::InvalidRequest(format!("ScriptedGenerator: no script for call {idx}"))
        })
    }
}

/// Unwrap delays and responders down to events. Iterative so nested delays
/// do not need recursive async.
async fn resolve(mut script: Script, request: &GenRequest) -> Result<Vec<GenEvent>, GeneratorError> {
    loop {
        match script {
            Script::Events(events) => return Ok(events),
            Script::Error(e) => return Err(e),
            Script::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                script = *inner;
            }
            Script::Respond(f) => script = f(request),
        }
    }
}

/// Fold a streamed script into batch output.
fn fold_events(events: Vec<GenEvent>) -> Result<BatchOutput, GeneratorError> {
    let mut out = BatchOutput::default();
    let mut buf = String::new();
    for event in events {
        match event {
            GenEvent::ThinkingStart | GenEvent::SayingStart => buf.clear(),
            GenEvent::ThinkingChunk { chunk } | GenEvent::SayingChunk { chunk } => buf.push_str(&chunk),
            GenEvent::ThinkingFinish => out.items.push(BatchItem::Thinking {
                content: std::mem::take(&mut buf),
            }),
            GenEvent::SayingFinish => out.items.push(BatchItem::Saying {
                content: std::mem::take(&mut buf),
            }),
            GenEvent::FuncCall { id, name, arguments } => {
                out.items.push(BatchItem::FuncCall { id, name, arguments })
            }
            GenEvent::Usage(usage) => out.usage = Some(usage),
            GenEvent::Done => {}
            GenEvent::Error { error } => return Err(error),
        }
    }
    Ok(out)
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: &GenRequest) -> Result<GenStream, GeneratorError> {
        let script = self.next_script(request)?;
        let events = resolve(script, request).await?;
        Ok(Box::pin(stream::iter(events)))
    }

    async fn generate(&self, request: &GenRequest) -> Result<BatchOutput, GeneratorError> {
        let script = self.next_script(request)?;
        fold_events(resolve(script, request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dominds_core::ids::DialogId;
    use dominds_core::messages::{ChatMessage, PendingPrompt};
    use futures::StreamExt;

    fn request(text: &str) -> GenRequest {
        GenRequest {
            dialog_id: DialogId::root("r"),
            agent_id: "lead".into(),
            provider: "mock".into(),
            model: "mock-model".into(),
            system_prompt: String::new(),
            tools: Vec::new(),
            messages: vec![ChatMessage::prompting(&PendingPrompt::human(text))],
        }
    }

    async fn collect(s: GenStream) -> Vec<GenEvent> {
        s.collect().await
    }

    #[tokio::test]
    async fn plays_scripts_in_order() {
        let gen = ScriptedGenerator::new(vec![Script::saying("first"), Script::saying("second")]);
        let a = collect(gen.stream(&request("q")).await.unwrap()).await;
        let b = collect(gen.stream(&request("q")).await.unwrap()).await;
        assert!(matches!(&a[1], GenEvent::SayingChunk { chunk } if chunk == "first"));
        assert!(matches!(&b[1], GenEvent::SayingChunk { chunk } if chunk == "second"));
        assert_eq!(gen.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_without_fallback_fails() {
        let gen = ScriptedGenerator::new(vec![]);
        assert!(matches!(
            gen.stream(&request("q")).await,
            Err(GeneratorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn fallback_repeats() {
        let gen = ScriptedGenerator::new(vec![]).with_fallback(Script::saying("idle"));
        for _ in 0..3 {
            let out = gen.generate(&request("q")).await.unwrap();
            assert_eq!(out.items, vec![BatchItem::Saying { content: "idle".into() }]);
        }
    }

    #[tokio::test]
    async fn responder_sees_request() {
        let gen = ScriptedGenerator::new(vec![Script::respond(|req| {
            let text = req.last_user_text().unwrap_or_default().to_uppercase();
            Script::saying(&text)
        })]);
        let out = gen.generate(&request("shout")).await.unwrap();
        assert_eq!(out.items, vec![BatchItem::Saying { content: "SHOUT".into() }]);
        assert_eq!(gen.last_request().unwrap().agent_id, "lead");
    }

    #[tokio::test]
    async fn batch_folds_stream_events() {
        let usage = UsageSnapshot {
            prompt_tokens: 10,
            completion_tokens: 2,
            total_tokens: None,
        };
        let gen = ScriptedGenerator::new(vec![
            Script::Events(vec![
                GenEvent::ThinkingStart,
                GenEvent::ThinkingChunk { chunk: "hm".into() },
                GenEvent::ThinkingFinish,
                GenEvent::SayingStart,
                GenEvent::SayingChunk { chunk: "a".into() },
                GenEvent::SayingChunk { chunk: "b".into() },
                GenEvent::SayingFinish,
                GenEvent::FuncCall {
                    id: "c1".into(),
                    name: "add_reminder".into(),
                    arguments: "{}".into(),
                },
                GenEvent::Usage(usage),
                GenEvent::Done,
            ]),
            Script::stream_error_after("x", GeneratorError::Overloaded),
        ]);
        let out = gen.generate(&request("q")).await.unwrap();
        assert_eq!(out.items.len(), 3);
        assert_eq!(out.items[1], BatchItem::Saying { content: "ab".into() });
        assert_eq!(out.usage, Some(usage));
        assert!(matches!(
            gen.generate(&request("q")).await,
            Err(GeneratorError::Overloaded)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_script_waits() {
        let gen = ScriptedGenerator::new(vec![Script::delayed(
            Duration::from_millis(50),
            Script::Error(GeneratorError::RateLimited { retry_after: None }),
        )]);
        let start = tokio::time::Instant::now();
        let res = gen.stream(&request("q")).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(res, Err(GeneratorError::RateLimited { .. })));
    }
}
