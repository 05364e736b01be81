//! Routes the calls of one generation: tellask-special calls go to the
//! subdialog lifecycle or the human-question queue, ordinary tools run in
//! call order.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use dominds_core::events::DialogEvent;
use dominds_core::messages::ChatMessage;
use dominds_core::subdialog::CallType;
use dominds_core::tellask::{MalformedReason, TellaskCall, TellaskValidation};
use dominds_core::tools::{ToolError, ToolOutput};

use super::stream::FuncCallRequest;
use crate::dialog::Dialog;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::runs::RunHandle;
use crate::subdialog::TellaskRequest;
use crate::team::{
    is_special_call, CallPolicy, ASK_HUMAN, FRESH_BOOTS_REASONING, MENTION_HUMAN, MENTION_SELF,
    MENTION_TELLASKER, TELLASK, TELLASK_BACK, TELLASK_SESSIONLESS,
};
use crate::tools::{validate_args, ToolContext};

const SESSION_DIRECTIVE: &str = "!tellaskSession";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Routed {
    /// At least one function or tellask call came out of the generation.
    pub produced: bool,
    pub violation: bool,
}

/// A special call after its arguments were understood.
#[derive(Debug, PartialEq)]
enum Special {
    Teammate(TellaskRequest),
    Back(TellaskRequest),
    AskHuman {
        call_id: String,
        headline: String,
        body: String,
    },
}

#[derive(Deserialize)]
struct SpecialArgs {
    #[serde(default)]
    target: Option<String>,
    headline: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    session: Option<String>,
}

/// Tracks which call ids got a result, and which are exempt because the
/// call is still pending elsewhere.
struct PairingLedger {
    expected: Vec<String>,
    results: HashMap<String, usize>,
    pending: HashSet<String>,
}

impl PairingLedger {
    fn new(calls: &[FuncCallRequest]) -> Self {
        Self {
            expected: calls.iter().map(|c| c.id.clone()).collect(),
            results: HashMap::new(),
            pending: HashSet::new(),
        }
    }

    fn paired(&mut self, id: &str) {
        *self.results.entry(id.to_string()).or_default() += 1;
    }

    fn pending(&mut self, id: &str) {
        self.pending.insert(id.to_string());
    }

    fn verify(&self) -> Result<(), EngineError> {
        for id in &self.expected {
            let n = self.results.get(id).copied().unwrap_or(0);
            let ok = if self.pending.contains(id) { n == 0 } else { n == 1 };
            if !ok {
                return Err(EngineError::Invariant(format!(
                    "call {id} has {n} paired result(s)"
                )));
            }
        }
        Ok(())
    }
}

/// Slug of a `!tellaskSession <slug>` directive in a headline.
pub(crate) fn session_slug(headline: &str) -> Option<String> {
    let mut words = headline.split_whitespace();
    while let Some(word) = words.next() {
        if word == SESSION_DIRECTIVE {
            return words
                .next()
                .filter(|slug| {
                    slug.chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                })
                .map(str::to_string);
        }
    }
    None
}

fn malformed_hint(reason: MalformedReason) -> &'static str {
    match reason {
        MalformedReason::MissingMentionPrefix => {
            "the first line of a call block must start with `!?@<teammate>`"
        }
        MalformedReason::InvalidMentionId => "the mention is not a valid teammate id",
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

impl Engine {
    pub(crate) async fn route_calls(
        &self,
        dialog: &Arc<Dialog>,
        run: &RunHandle,
        policy: &CallPolicy,
        funcs: Vec<FuncCallRequest>,
        tellasks: Vec<TellaskCall>,
    ) -> Result<Routed, EngineError> {
        let produced = !funcs.is_empty() || !tellasks.is_empty();
        if !produced {
            return Ok(Routed::default());
        }

        if let Some(detail) = self.find_violation(dialog, policy, &funcs, &tellasks) {
            self.report_violation(dialog, &funcs, &detail)?;
            return Ok(Routed {
                produced,
                violation: true,
            });
        }

        let mut ledger = PairingLedger::new(&funcs);
        for call in &funcs {
            if is_special_call(&call.name) {
                match self.parse_special_func(dialog, call) {
                    Ok(special) => {
                        self.dispatch_special(dialog, special).await?;
                        ledger.pending(&call.id);
                    }
                    Err(message) => {
                        self.append_func_result(dialog, call, message, Vec::new(), true)?;
                        ledger.paired(&call.id);
                    }
                }
            } else {
                self.execute_tool(dialog, run, call).await?;
                ledger.paired(&call.id);
                run.check()?;
            }
        }

        for call in tellasks {
            self.route_tellask_text(dialog, call).await?;
        }

        ledger.verify()?;
        if let Some(prompt) = dialog.take_course_request() {
            let course = dialog.start_new_course(prompt)?;
            info!(dialog_id = %dialog.id(), course, "course changed by tool");
        }
        Ok(Routed {
            produced,
            violation: false,
        })
    }

    fn find_violation(
        &self,
        dialog: &Dialog,
        policy: &CallPolicy,
        funcs: &[FuncCallRequest],
        tellasks: &[TellaskCall],
    ) -> Option<String> {
        let agent = dialog.agent_id();
        for call in funcs {
            if is_special_call(&call.name) {
                if !policy.tellask {
                    return Some(format!("@{agent} may not call '{}' here", call.name));
                }
                if call.name == TELLASK_BACK && dialog.is_root() {
                    return Some(format!("'{TELLASK_BACK}' is only available in a subdialog"));
                }
            } else if !policy.allows_tool(&call.name) {
                return Some(format!("tool '{}' is not available to @{agent}", call.name));
            }
        }
        if !tellasks.is_empty() && !policy.tellask {
            return Some(format!("@{agent} may not tellask here"));
        }
        if dialog.is_root()
            && tellasks
                .iter()
                .any(|c| c.first_mention() == Some(MENTION_TELLASKER))
        {
            return Some(format!("@{MENTION_TELLASKER} is only available in a subdialog"));
        }
        None
    }

    fn report_violation(
        &self,
        dialog: &Dialog,
        funcs: &[FuncCallRequest],
        detail: &str,
    ) -> Result<(), EngineError> {
        warn!(dialog_id = %dialog.id(), detail, "policy violation");
        for call in funcs {
            self.append_func_result(
                dialog,
                call,
                "[error] not executed: policy violation".to_string(),
                Vec::new(),
                true,
            )?;
        }
        dialog.append_message(ChatMessage::Environment {
            content: format!("[policy violation] {detail}"),
        })?;
        dialog.emit(DialogEvent::PolicyViolation {
            dialog_id: dialog.id().clone(),
            detail: detail.to_string(),
        });
        Ok(())
    }

    /// Understand a special function call. `Err` is the text handed back
    /// to the model as the call's error result.
    fn parse_special_func(&self, dialog: &Dialog, call: &FuncCallRequest) -> Result<Special, String> {
        let args: SpecialArgs = serde_json::from_str(&call.arguments)
            .map_err(|e| format!("[error] invalid arguments for '{}': {e}", call.name))?;
        let head = |target: &str| format!("@{target} {}", args.headline.trim());
        let teammate = |call_type: CallType, target: &str, session: Option<String>| {
            if !self.team.contains(target) {
                return Err(format!("[error] @{target} is not a teammate"));
            }
            Ok(TellaskRequest {
                call_id: call.id.clone(),
                call_type,
                target_agent_id: target.to_string(),
                tellask_head: head(target),
                body: args.body.clone(),
                session,
            })
        };
        let target = || {
            args.target
                .as_deref()
                .map(|t| t.trim_start_matches('@'))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| format!("[error] '{}' needs a target", call.name))
        };

        match call.name.as_str() {
            TELLASK => {
                let session = args
                    .session
                    .clone()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| format!("[error] '{TELLASK}' needs a session"))?;
                Ok(Special::Teammate(teammate(CallType::Tellask, target()?, Some(session))?))
            }
            TELLASK_SESSIONLESS => Ok(Special::Teammate(teammate(
                CallType::TellaskSessionless,
                target()?,
                None,
            )?)),
            FRESH_BOOTS_REASONING => Ok(Special::Teammate(teammate(
                CallType::FreshBootsReasoning,
                dialog.agent_id(),
                None,
            )?)),
            TELLASK_BACK => Ok(Special::Back(TellaskRequest {
                call_id: call.id.clone(),
                call_type: CallType::TellaskBack,
                target_agent_id: String::new(),
                tellask_head: head(MENTION_TELLASKER),
                body: args.body.clone(),
                session: None,
            })),
            ASK_HUMAN => Ok(Special::AskHuman {
                call_id: call.id.clone(),
                headline: head(MENTION_HUMAN),
                body: args.body.clone(),
            }),
            other => Err(format!("[error] unknown call '{other}'")),
        }
    }

    async fn dispatch_special(&self, dialog: &Arc<Dialog>, special: Special) -> Result<(), EngineError> {
        match special {
            Special::Teammate(req) => self.dispatch_tellask(dialog, req).await.map(|_| ()),
            Special::Back(req) => self.tellask_back(dialog, req).await,
            Special::AskHuman {
                call_id,
                headline,
                body,
            } => self.ask_human(dialog, &call_id, &headline, &body).map(|_| ()),
        }
    }

    async fn route_tellask_text(&self, dialog: &Arc<Dialog>, call: TellaskCall) -> Result<(), EngineError> {
        let mention = match &call.validation {
            TellaskValidation::Valid { first_mention } => first_mention.clone(),
            TellaskValidation::Malformed { reason } => {
                debug!(dialog_id = %dialog.id(), call_id = %call.call_id, ?reason, "malformed tellask");
                return dialog.append_message(ChatMessage::Environment {
                    content: format!(
                        "[tellask error] call {} was not delivered: {}",
                        call.call_id,
                        malformed_hint(*reason)
                    ),
                });
            }
        };
        let tellask_head = call.tellask_head();

        match mention.as_str() {
            MENTION_HUMAN => self
                .ask_human(dialog, &call.call_id, &tellask_head, &call.body)
                .map(|_| ()),
            MENTION_SELF => {
                let req = TellaskRequest {
                    call_id: call.call_id,
                    call_type: CallType::FreshBootsReasoning,
                    target_agent_id: dialog.agent_id().to_string(),
                    tellask_head,
                    body: call.body,
                    session: None,
                };
                self.dispatch_tellask(dialog, req).await.map(|_| ())
            }
            MENTION_TELLASKER => {
                let req = TellaskRequest {
                    call_id: call.call_id,
                    call_type: CallType::TellaskBack,
                    target_agent_id: String::new(),
                    tellask_head,
                    body: call.body,
                    session: None,
                };
                self.tellask_back(dialog, req).await
            }
            agent if self.team.contains(agent) => {
                let session = session_slug(&call.headline);
                let call_type = if session.is_some() {
                    CallType::Tellask
                } else {
                    CallType::TellaskSessionless
                };
                let req = TellaskRequest {
                    call_id: call.call_id,
                    call_type,
                    target_agent_id: agent.to_string(),
                    tellask_head,
                    body: call.body,
                    session,
                };
                self.dispatch_tellask(dialog, req).await.map(|_| ())
            }
            unknown => {
                info!(dialog_id = %dialog.id(), mention = unknown, "tellask to unknown teammate");
                dialog.append_message(ChatMessage::Environment {
                    content: format!(
                        "[tellask error] @{unknown} is not a teammate; call {} was not delivered",
                        call.call_id
                    ),
                })
            }
        }
    }

    async fn execute_tool(
        &self,
        dialog: &Arc<Dialog>,
        run: &RunHandle,
        call: &FuncCallRequest,
    ) -> Result<(), EngineError> {
        match self.invoke_tool(dialog, run, call).await {
            Ok(out) => self.append_func_result(dialog, call, out.content, out.content_items, false),
            Err(ToolError::Cancelled) => {
                self.append_func_result(dialog, call, ToolError::Cancelled.to_result_content(), Vec::new(), true)?;
                Err(EngineError::Interrupted(run.reason()))
            }
            Err(e) => self.append_func_result(dialog, call, e.to_result_content(), Vec::new(), true),
        }
    }

    async fn invoke_tool(
        &self,
        dialog: &Arc<Dialog>,
        run: &RunHandle,
        call: &FuncCallRequest,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        let args: Value = if call.arguments.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(&call.arguments)
                .map_err(|e| ToolError::InvalidArguments(format!("arguments are not JSON: {e}")))?
        };
        validate_args(&tool.parameters_schema(), &args)?;

        let ctx = ToolContext {
            agent_id: dialog.agent_id().to_string(),
            call_id: call.id.clone(),
            cancel: run.token().child_token(),
            work_language: self.config.driver.work_language.clone(),
        };
        let timeout = self.config.tool_timeout();
        let fut = AssertUnwindSafe(tool.call(dialog, &ctx, args)).catch_unwind();
        let result = tokio::select! {
            _ = run.interrupted() => return Err(ToolError::Cancelled),
            r = tokio::time::timeout(timeout, fut) => r,
        };
        match result {
            Ok(Ok(r)) => r,
            Ok(Err(panic)) => {
                error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked during execution");
                Err(ToolError::Panicked)
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                Err(ToolError::Timeout(timeout))
            }
        }
    }

    fn append_func_result(
        &self,
        dialog: &Dialog,
        call: &FuncCallRequest,
        content: String,
        content_items: Vec<dominds_core::tools::ContentItem>,
        is_error: bool,
    ) -> Result<(), EngineError> {
        dialog.append_message(ChatMessage::FuncResult {
            id: call.id.clone(),
            name: call.name.clone(),
            content: content.clone(),
            content_items,
            is_error,
        })?;
        dialog.emit(DialogEvent::FuncCallResult {
            dialog_id: dialog.id().clone(),
            call_id: call.id.clone(),
            name: call.name.clone(),
            content,
            is_error,
        });
        Ok(())
    }
}
