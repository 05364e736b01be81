mod common;

use std::sync::Arc;
use std::time::Duration;

use dominds_core::events::{DialogEvent, RunStateMarker};
use dominds_core::health::UsageSnapshot;
use dominds_core::messages::ChatMessage;
use dominds_core::stream::GenEvent;
use dominds_core::run_state::{DialogRunState, DialogStatus, InterruptReason};
use dominds_engine::{DialogOrchestrator, DriveOutcome, Suspension};
use dominds_llm::{Script, ScriptedGenerator};
use dominds_store::DialogStore;
use serde_json::json;

use common::{harness, harness_with, settings, transcript, wait_until};

fn critical_usage() -> Option<UsageSnapshot> {
    Some(UsageSnapshot {
        prompt_tokens: 190_000,
        completion_tokens: 100,
        total_tokens: None,
    })
}

#[tokio::test]
async fn critical_context_suspends_then_counts_down_then_forces_a_new_course() {
    let mut s = settings();
    s.context_health.critical_countdown_generations = 1;
    let h = harness_with(
        s,
        vec![
            Script::saying_with_usage("big", critical_usage()),
            Script::saying_with_usage("still big", critical_usage()),
            Script::saying("fresh start"),
        ],
    );
    let root = h.orch.create_root_dialog("lead", None).unwrap();

    assert_eq!(h.orch.submit_prompt(&root, "one").await.unwrap(), DriveOutcome::Completed);

    // A human prompt on a critical context waits for an explicit go-ahead.
    assert_eq!(h.orch.submit_prompt(&root, "two").await.unwrap(), DriveOutcome::Suspended);
    assert_eq!(h.generator.call_count(), 1);
    let dialog = h.orch.dialog(&root).unwrap();
    assert_eq!(dialog.suspension(), Suspension::Suspended);
    assert_eq!(dialog.up_next().unwrap().content, "two");
    assert!(dialog
        .messages()
        .iter()
        .any(|m| matches!(m, ChatMessage::UiOnlyMarkdown { .. })));

    assert_eq!(h.orch.resume_dialog(&root).await.unwrap(), DriveOutcome::Completed);
    let countdown = transcript(&h.generator.last_request().unwrap());
    assert!(countdown.contains("critically large"));
    assert!(countdown.contains("two"));
    assert_eq!(h.orch.engine().health().countdown(&root), Some(0));

    assert_eq!(h.orch.submit_prompt(&root, "three").await.unwrap(), DriveOutcome::Completed);
    assert_eq!(dialog.current_course(), 2);
    assert_eq!(h.store.dialogs.latest(&root).unwrap().current_course, 2);
    let fresh = transcript(&h.generator.last_request().unwrap());
    assert!(fresh.contains("The previous course was closed"));
    assert!(fresh.contains("three"));
    assert!(!fresh.contains("still big"));
}

#[tokio::test]
async fn interrupt_stops_the_run_and_resume_continues() {
    let h = harness(vec![
        Script::delayed(Duration::from_secs(30), Script::saying("too slow")),
        Script::saying("back on track"),
    ]);
    let root = h.orch.create_root_dialog("lead", None).unwrap();
    let mut rx = h.orch.subscribe();

    let (outcome, stopped) = tokio::join!(h.orch.submit_prompt(&root, "go"), async {
        wait_until(|| h.orch.engine().runs().is_active(&root)).await;
        h.orch.interrupt(&root, InterruptReason::UserStop).unwrap()
    });
    assert!(stopped);
    assert_eq!(
        outcome.unwrap(),
        DriveOutcome::Interrupted(InterruptReason::UserStop)
    );
    assert_eq!(
        h.orch.run_state(&root).unwrap(),
        DialogRunState::interrupted(InterruptReason::UserStop)
    );
    // Once the run is gone a late stop request records nothing.
    assert!(!h.orch.interrupt(&root, InterruptReason::UserStop).unwrap());
    assert_eq!(
        h.orch.run_state(&root).unwrap(),
        DialogRunState::interrupted(InterruptReason::UserStop)
    );

    let outcome = h.orch.resume_dialog(&root).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed);
    assert_eq!(h.orch.run_state(&root).unwrap(), DialogRunState::IdleWaitingUser);

    let events = common::drain(&mut rx);
    let markers: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            DialogEvent::RunStateMarker { marker, .. } => Some(marker.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        markers,
        vec![
            RunStateMarker::Interrupted {
                reason: InterruptReason::UserStop
            },
            RunStateMarker::Resumed,
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        DialogEvent::RunState {
            state: DialogRunState::ProceedingStopRequested { .. },
            ..
        }
    )));
}

#[tokio::test]
async fn emergency_stop_reaches_every_active_run() {
    let h = harness(vec![Script::delayed(Duration::from_secs(30), Script::saying("never"))]);
    let root = h.orch.create_root_dialog("lead", None).unwrap();

    let (outcome, stopped) = tokio::join!(h.orch.submit_prompt(&root, "go"), async {
        wait_until(|| h.orch.engine().runs().is_active(&root)).await;
        h.orch.emergency_stop().unwrap()
    });
    assert_eq!(stopped, vec![root.clone()]);
    assert_eq!(
        outcome.unwrap(),
        DriveOutcome::Interrupted(InterruptReason::EmergencyStop)
    );
    assert_eq!(h.orch.engine().runs().active_count(), 0);
}

#[tokio::test]
async fn tool_calls_run_and_the_dialog_continues() {
    let h = harness(vec![
        Script::func_call("r-1", "add_reminder", json!({"content": "ship on friday"})),
        Script::saying("noted"),
    ]);
    let root = h.orch.create_root_dialog("lead", None).unwrap();

    assert_eq!(h.orch.submit_prompt(&root, "remember").await.unwrap(), DriveOutcome::Completed);
    assert_eq!(h.generator.call_count(), 2);

    let dialog = h.orch.dialog(&root).unwrap();
    let reminders = dialog.reminders();
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].content, "ship on friday");
    let (_, stored) = h.store.reminders.load(&root).unwrap();
    assert_eq!(stored.len(), 1);

    let second = &h.generator.requests()[1];
    assert!(second.messages.iter().any(|m| matches!(
        m,
        ChatMessage::FuncResult { id, is_error: false, .. } if id == "r-1"
    )));
}

#[tokio::test]
async fn clear_mind_pairs_every_call_before_the_new_course() {
    let h = harness(vec![
        Script::Events(vec![
            GenEvent::FuncCall {
                id: "c1".into(),
                name: "clear_mind".into(),
                arguments: json!({"reminder": "parser half done"}).to_string(),
            },
            GenEvent::FuncCall {
                id: "c2".into(),
                name: "add_reminder".into(),
                arguments: json!({"content": "tests next"}).to_string(),
            },
            GenEvent::Done,
        ]),
        Script::saying("picking it back up"),
    ]);
    let root = h.orch.create_root_dialog("lead", None).unwrap();

    assert_eq!(h.orch.submit_prompt(&root, "work").await.unwrap(), DriveOutcome::Completed);
    let dialog = h.orch.dialog(&root).unwrap();
    assert_eq!(dialog.current_course(), 2);
    let reminders: Vec<_> = dialog.reminders().into_iter().map(|r| r.content).collect();
    assert_eq!(reminders, vec!["parser half done", "tests next"]);

    let first: Vec<_> = h
        .store
        .courses
        .messages(&root, 1)
        .unwrap()
        .iter()
        .map(|m| m.message_type())
        .collect();
    assert_eq!(
        first,
        vec!["prompting", "func_call", "func_call", "func_result", "func_result"]
    );
    let second: Vec<_> = h
        .store
        .courses
        .messages(&root, 2)
        .unwrap()
        .iter()
        .map(|m| m.message_type())
        .collect();
    assert_eq!(second, vec!["prompting", "saying"]);

    let request = h.generator.last_request().unwrap();
    assert!(!request
        .messages
        .iter()
        .any(|m| matches!(m, ChatMessage::FuncResult { .. } | ChatMessage::FuncCall { .. })));
    assert!(transcript(&request).contains("cleared your mind"));
}

#[tokio::test]
async fn tool_outside_the_policy_is_not_executed() {
    let h = harness(vec![
        Script::saying("!?@pangu note this\n"),
        Script::func_call("r-1", "add_reminder", json!({"content": "sneaky"})),
    ]);
    let root = h.orch.create_root_dialog("lead", None).unwrap();
    h.orch.submit_prompt(&root, "go").await.unwrap();
    let sub = common::only_subdialog(&h, &root);

    h.orch.drain_revivals(1).await.unwrap();
    let pangu = h.orch.dialog(&sub).unwrap();
    assert!(pangu.reminders().is_empty());
    assert!(pangu.messages().iter().any(|m| matches!(
        m,
        ChatMessage::FuncResult { id, is_error: true, .. } if id == "r-1"
    )));
}

#[tokio::test]
async fn finished_tree_is_not_driven() {
    let h = harness(Vec::new());
    let root = h.orch.create_root_dialog("lead", None).unwrap();
    h.orch
        .set_tree_status(&root.root_id, DialogStatus::Completed)
        .unwrap();

    assert_eq!(h.orch.submit_prompt(&root, "hello").await.unwrap(), DriveOutcome::Skipped);
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn background_revival_completes_the_round_trip() {
    let mut s = settings();
    s.revival.sweep_interval_ms = 10;
    let h = harness_with(
        s,
        vec![
            Script::saying("!?@pangu compute 1+1\n"),
            Script::saying("2"),
            Script::saying("it is 2"),
        ],
    );
    let root = h.orch.create_root_dialog("lead", None).unwrap();
    let revival = h.orch.spawn_revival();

    h.orch.submit_prompt(&root, "go").await.unwrap();
    wait_until(|| h.generator.call_count() == 3).await;
    wait_until(|| h.orch.run_state(&root).unwrap() == DialogRunState::IdleWaitingUser).await;
    revival.shutdown().await;

    assert!(transcript(&h.generator.last_request().unwrap()).contains("@pangu responded"));
}

#[tokio::test]
async fn restart_marks_running_dialogs_interrupted_and_reloads_them() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dialogs.db");

    let root = {
        let store = Arc::new(DialogStore::open(&path).unwrap());
        let orch = DialogOrchestrator::builder(settings())
            .store(store.clone())
            .generator(Arc::new(ScriptedGenerator::new(vec![Script::saying("hi")])))
            .build()
            .unwrap();
        let root = orch
            .create_root_dialog("lead", Some("write the report".into()))
            .unwrap();
        orch.submit_prompt(&root, "start").await.unwrap();
        // Simulate a crash in the middle of the next drive.
        store
            .dialogs
            .set_run_state(&root, &DialogRunState::Proceeding)
            .unwrap();
        root
    };

    let generator = Arc::new(ScriptedGenerator::new(vec![Script::saying("resumed")]));
    let orch = DialogOrchestrator::builder(settings())
        .store(Arc::new(DialogStore::open(&path).unwrap()))
        .generator(generator.clone())
        .build()
        .unwrap();
    let report = orch.recover_after_restart().unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(
        orch.run_state(&root).unwrap(),
        DialogRunState::interrupted(InterruptReason::ServerRestart)
    );

    let dialog = orch.dialog(&root).unwrap();
    assert_eq!(dialog.task_doc(), Some("write the report"));
    assert!(dialog.messages().iter().any(|m| matches!(
        m,
        ChatMessage::Saying { content, .. } if content == "hi"
    )));

    assert_eq!(orch.resume_dialog(&root).await.unwrap(), DriveOutcome::Completed);
    let request = transcript(&generator.last_request().unwrap());
    assert!(request.contains("write the report"));
    assert!(request.contains("start"));
}
