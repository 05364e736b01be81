//! Reminder owners: capabilities that keep their reminders current.
//!
//! A reminder carries only the owner's name; the owner is looked up here
//! before each generation (and when a dialog is restored) and may keep,
//! rewrite or drop it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use dominds_core::reminders::Reminder;

use crate::dialog::Dialog;

#[derive(Clone, Debug, PartialEq)]
pub enum ReminderUpdate {
    Keep,
    Update(Reminder),
    Drop,
}

pub trait ReminderOwner: Send + Sync {
    fn name(&self) -> &str;

    fn update(&self, dialog: &Dialog, reminder: &Reminder) -> ReminderUpdate;
}

#[derive(Clone, Default)]
pub struct ReminderOwners {
    owners: HashMap<String, Arc<dyn ReminderOwner>>,
}

impl ReminderOwners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in owners.
    pub fn with_builtins() -> Self {
        let mut owners = Self::new();
        owners.register(Arc::new(PendingTellasksOwner));
        owners
    }

    pub fn register(&mut self, owner: Arc<dyn ReminderOwner>) {
        self.owners.insert(owner.name().to_string(), owner);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ReminderOwner>> {
        self.owners.get(name).cloned()
    }

    /// Names of owners referenced by `reminders` that are not registered.
    pub fn unresolved<'a>(&self, reminders: &'a [Reminder]) -> Vec<&'a str> {
        reminders
            .iter()
            .filter_map(|r| r.owner.as_deref())
            .filter(|name| !self.owners.contains_key(*name))
            .collect()
    }

    /// Let every owner look at its reminders. Publishes a new list only
    /// when something changed. Returns whether it did.
    pub fn refresh(&self, dialog: &Dialog) -> bool {
        let current = dialog.reminders();
        let mut changed = false;
        let mut next = Vec::with_capacity(current.len());
        for reminder in &current {
            let Some(name) = reminder.owner.as_deref() else {
                next.push(reminder.clone());
                continue;
            };
            let Some(owner) = self.owners.get(name) else {
                next.push(reminder.clone());
                continue;
            };
            match owner.update(dialog, reminder) {
                ReminderUpdate::Keep => next.push(reminder.clone()),
                ReminderUpdate::Update(updated) => {
                    changed |= &updated != reminder;
                    next.push(updated);
                }
                ReminderUpdate::Drop => changed = true,
            }
        }
        if changed {
            debug!(dialog_id = %dialog.id(), count = next.len(), "reminders refreshed by owners");
            dialog.replace_reminders(next);
        }
        changed
    }
}

pub const PENDING_TELLASKS: &str = "pending_tellasks";

/// Lists the teammates a dialog is still waiting on. Goes away once
/// nothing is pending.
pub struct PendingTellasksOwner;

impl PendingTellasksOwner {
    /// Add the owned reminder unless the dialog already has one.
    pub fn ensure(dialog: &Dialog) {
        let present = dialog
            .reminders()
            .iter()
            .any(|r| r.owner.as_deref() == Some(PENDING_TELLASKS));
        if !present {
            dialog.add_reminder(
                Reminder::new("Waiting for teammates.").owned_by(PENDING_TELLASKS),
                None,
            );
        }
    }
}

impl ReminderOwner for PendingTellasksOwner {
    fn name(&self) -> &str {
        PENDING_TELLASKS
    }

    fn update(&self, dialog: &Dialog, reminder: &Reminder) -> ReminderUpdate {
        let pending = match dialog.env().store.queues.list_pending(dialog.id()) {
            Ok(pending) => pending,
            Err(e) => {
                warn!(dialog_id = %dialog.id(), error = %e, "cannot list pending tellasks");
                return ReminderUpdate::Keep;
            }
        };
        if pending.is_empty() {
            return ReminderUpdate::Drop;
        }
        let mut content = format!("Waiting for {} teammate response(s):", pending.len());
        for p in &pending {
            content.push_str(&format!("\n- @{}: {}", p.target_agent_id, p.tellask_head.trim()));
        }
        if content == reminder.content {
            ReminderUpdate::Keep
        } else {
            ReminderUpdate::Update(Reminder {
                content,
                ..reminder.clone()
            })
        }
    }
}
