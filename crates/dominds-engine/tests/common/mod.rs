#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dominds_core::events::DialogEvent;
use dominds_core::generator::GenRequest;
use dominds_core::ids::DialogId;
use dominds_engine::DialogOrchestrator;
use dominds_llm::{Script, ScriptedGenerator};
use dominds_settings::{DomindsSettings, TeamSettings, TeammateSettings};
use dominds_store::DialogStore;
use tokio::sync::broadcast;

pub struct Harness {
    pub orch: DialogOrchestrator,
    pub generator: Arc<ScriptedGenerator>,
    pub store: Arc<DialogStore>,
}

/// `lead` answers the human; `pangu` is a plain teammate. Neither gets
/// diligence pushes, so every drive ends on the first quiet generation.
pub fn team() -> TeamSettings {
    let mut lead = TeammateSettings::new("lead");
    lead.tools = vec!["add_reminder".into(), "clear_mind".into()];
    lead.diligence_push_max = Some(0);
    let mut pangu = TeammateSettings::new("pangu");
    pangu.diligence_push_max = Some(0);
    TeamSettings {
        members: vec![lead, pangu],
        default_responder: Some("lead".into()),
    }
}

pub fn settings() -> DomindsSettings {
    let mut settings = DomindsSettings::default();
    settings.team = team();
    settings.driver.retry_base_delay_ms = 1;
    settings.driver.retry_max_delay_ms = 2;
    settings
}

pub fn harness(scripts: Vec<Script>) -> Harness {
    harness_with(settings(), scripts)
}

pub fn harness_with(settings: DomindsSettings, scripts: Vec<Script>) -> Harness {
    let generator = Arc::new(ScriptedGenerator::new(scripts));
    let store = Arc::new(DialogStore::in_memory().unwrap());
    let orch = DialogOrchestrator::builder(settings)
        .store(store.clone())
        .generator(generator.clone())
        .build()
        .unwrap();
    Harness {
        orch,
        generator,
        store,
    }
}

/// The request's messages as JSON text, for substring checks.
pub fn transcript(req: &GenRequest) -> String {
    serde_json::to_string(&req.messages).unwrap()
}

pub fn drain(rx: &mut broadcast::Receiver<DialogEvent>) -> Vec<DialogEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

/// The single subdialog of `root`'s tree.
pub fn only_subdialog(h: &Harness, root: &DialogId) -> DialogId {
    let tree = h.store.dialogs.list_tree(&root.root_id).unwrap();
    assert_eq!(tree.len(), 2, "expected exactly one subdialog");
    tree[1].id.clone()
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached");
}
