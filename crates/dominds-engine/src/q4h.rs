//! Questions for the human.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use dominds_core::events::DialogEvent;
use dominds_core::ids::QuestionId;
use dominds_core::messages::{PendingPrompt, PromptOrigin};
use dominds_core::subdialog::HumanQuestion;

use crate::dialog::Dialog;
use crate::engine::Engine;
use crate::error::EngineError;

impl Engine {
    /// Record a question for the human. The dialog blocks until it is
    /// answered, and its diligence budget starts over.
    pub(crate) fn ask_human(
        &self,
        dialog: &Dialog,
        call_id: &str,
        headline: &str,
        body: &str,
    ) -> Result<HumanQuestion, EngineError> {
        let question = HumanQuestion {
            id: QuestionId::new(),
            dialog_id: dialog.id().clone(),
            call_id: call_id.to_string(),
            headline: headline.trim().to_string(),
            body: body.trim().to_string(),
            asked_at: Utc::now(),
        };
        self.store().queues.add_question(&question)?;
        dialog.set_diligence_remaining(self.diligence_budget(dialog.agent_id()))?;
        info!(dialog_id = %dialog.id(), question_id = %question.id, "question for human");
        dialog.emit(DialogEvent::Q4hAsked {
            dialog_id: dialog.id().clone(),
            question: question.clone(),
        });
        Ok(question)
    }

    /// Answer a pending question. The answer becomes the asking dialog's
    /// next prompt; the dialog is flagged for a drive once nothing else
    /// blocks it.
    #[instrument(skip(self, answer))]
    pub async fn answer_q4h(&self, question_id: &str, answer: &str) -> Result<Arc<Dialog>, EngineError> {
        let question = self
            .store()
            .queues
            .remove_question(question_id)?
            .ok_or_else(|| EngineError::QuestionNotFound(question_id.to_string()))?;
        let dialog = self.dialog(&question.dialog_id)?;
        dialog.emit(DialogEvent::Q4hAnswered {
            dialog_id: dialog.id().clone(),
            question_id: question.id.clone(),
        });

        let content = format!(
            "Answer to your question `{}`:\n\n{}",
            question.headline,
            answer.trim_end()
        );
        dialog.queue_up_next(PendingPrompt::with_origin(content, PromptOrigin::Q4hAnswer))?;
        if dialog.can_drive()? {
            self.store().dialogs.set_needs_drive(dialog.id(), true)?;
            self.wake_revival();
        }
        Ok(dialog)
    }
}
