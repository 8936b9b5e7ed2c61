//! Turns, tool calls, barge-in and voice hot-swap against a live session.

use crate::helpers::{
    FakeMic, GatedTools, call, collect_until, model_audio, settle, spawn_session,
    spawn_session_with, test_config, wait_status,
};
use livevoice::channel::ToolOutcome;
use livevoice::channel::messages::InboundEvent;
use livevoice::session::ToolStatus;
use livevoice::{RuntimeEvent, SessionState};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn every_tool_call_gets_exactly_one_result() {
    let tools = Arc::new(GatedTools::default());
    let ok = tools.gate("count_lines");
    let fail = tools.gate("write_file");
    let mut s = spawn_session_with(test_config(), tools.clone(), FakeMic::default(), None);
    s.voice.start_and_wait().await.unwrap();
    let mut remote = s.next_remote().await;

    remote.send(InboundEvent::ToolCallRequest {
        calls: vec![
            call("1", "count_lines"),
            call("2", "write_file"),
            call("3", "no_such_tool"),
        ],
    });
    ok.send(Ok(json!({ "lines": 3 }))).unwrap();
    fail.send(Err("disk full".into())).unwrap();

    let mut results = HashMap::new();
    while results.len() < 3 {
        let (id, outcome) = remote.next_tool_result().await;
        assert!(results.insert(id.clone(), outcome).is_none(), "duplicate result for {id}");
    }

    assert_eq!(results["1"], ToolOutcome::Result(json!({ "lines": 3 })));
    assert!(matches!(&results["2"], ToolOutcome::Error(m) if m.contains("disk full")));
    assert!(matches!(&results["3"], ToolOutcome::Error(m) if m.contains("not registered")));
}

#[tokio::test]
async fn turn_commits_only_after_out_of_order_tools_finish() {
    let tools = Arc::new(GatedTools::default());
    let first = tools.gate("read_file");
    let second = tools.gate("list_dir");
    let mut s = spawn_session_with(test_config(), tools.clone(), FakeMic::default(), None);
    let mut events = s.voice.subscribe_events();
    s.voice.start_and_wait().await.unwrap();
    let mut remote = s.next_remote().await;

    remote.send(InboundEvent::ToolCallRequest {
        calls: vec![call("1", "read_file"), call("2", "list_dir")],
    });
    remote.send(InboundEvent::TurnComplete);
    wait_status(&s.voice, |st| st.turn_in_progress).await;

    second.send(Ok(json!(["a.rs", "b.rs"]))).unwrap();
    let (id, _) = remote.next_tool_result().await;
    assert_eq!(id, "2");
    assert!(s.history.is_empty(), "turn must wait for the first tool");

    first.send(Ok(json!("fn main() {}"))).unwrap();
    let (id, _) = remote.next_tool_result().await;
    assert_eq!(id, "1");

    let seen = collect_until(&mut events, |e| {
        matches!(e, RuntimeEvent::TurnCommitted { .. })
    })
    .await;
    let result_ids: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::ToolResult { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(result_ids, ["2", "1"]);

    let turns = s.history.turns();
    assert_eq!(turns.len(), 1);
    assert!(!turns[0].interrupted);
    assert!(
        turns[0]
            .tool_invocations
            .iter()
            .all(|t| t.status == ToolStatus::Success)
    );
}

#[tokio::test]
async fn interrupt_flushes_playback_synchronously() {
    let mut s = spawn_session(test_config());
    s.voice.start_and_wait().await.unwrap();
    let remote = s.next_remote().await;

    remote.send(model_audio(200));
    remote.send(model_audio(200));
    wait_status(&s.voice, |st| st.speaking).await;
    let scheduled = s.speaker.wait_scheduled(2).await;
    assert_eq!(scheduled[1].scheduled_start, Duration::from_millis(200));

    s.clock.set_ms(30);
    assert_eq!(s.voice.interrupt(), 2);
    assert!(s.speaker.stops() >= 1);

    // The next buffer starts from "now", not after the flushed ones.
    remote.send(model_audio(100));
    let scheduled = s.speaker.wait_scheduled(3).await;
    assert_eq!(scheduled[2].scheduled_start, Duration::from_millis(30));
}

#[tokio::test]
async fn user_interrupt_reports_that_speaking_stopped() {
    let mut s = spawn_session(test_config());
    let mut events = s.voice.subscribe_events();
    s.voice.start_and_wait().await.unwrap();
    let remote = s.next_remote().await;

    remote.send(model_audio(200));
    wait_status(&s.voice, |st| st.speaking).await;
    assert_eq!(s.voice.interrupt(), 1);

    let seen = collect_until(&mut events, |e| {
        matches!(e, RuntimeEvent::AssistantSpeaking { active: false })
    })
    .await;
    assert!(
        seen.iter()
            .any(|e| matches!(e, RuntimeEvent::AssistantSpeaking { active: true }))
    );
    wait_status(&s.voice, |st| !st.speaking).await;

    // The next reply starts speaking again without a second "stopped".
    remote.send(model_audio(100));
    let seen = collect_until(&mut events, |e| {
        matches!(e, RuntimeEvent::AssistantSpeaking { active: true })
    })
    .await;
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, RuntimeEvent::AssistantSpeaking { active: false }))
    );
}

#[tokio::test]
async fn remote_barge_in_commits_an_interrupted_turn() {
    let mut s = spawn_session(test_config());
    let mut events = s.voice.subscribe_events();
    s.voice.start_and_wait().await.unwrap();
    let remote = s.next_remote().await;

    remote.send(InboundEvent::PartialOutputTranscript {
        text: "Let me expl".into(),
    });
    remote.send(model_audio(500));
    wait_status(&s.voice, |st| st.speaking).await;

    remote.send(InboundEvent::Interrupted);
    collect_until(&mut events, |e| {
        matches!(e, RuntimeEvent::TurnCommitted { interrupted: true, .. })
    })
    .await;

    let status = wait_status(&s.voice, |st| !st.speaking).await;
    assert_eq!(status.state, SessionState::Live);
    assert_eq!(s.history.turns()[0].output_transcript, "Let me expl");
}

#[tokio::test]
async fn voice_change_waits_for_the_turn_and_keeps_the_microphone() {
    let mut s = spawn_session(test_config());
    s.voice.start_and_wait().await.unwrap();
    let first = s.next_remote().await;

    first.send(InboundEvent::PartialInputTranscript {
        text: "use a different voice".into(),
    });
    wait_status(&s.voice, |st| st.turn_in_progress).await;

    s.voice.set_voice_profile("nova");
    settle().await;
    assert_eq!(s.connector.attempts(), 1, "swap must wait for the turn");
    assert_eq!(s.voice.status().voice_profile, "default");
    assert!(!first.is_closed());

    first.send(InboundEvent::TurnComplete);
    let second = s.next_remote().await;
    assert_eq!(second.params.voice_profile, "nova");
    assert!(first.is_closed());

    let status = wait_status(&s.voice, |st| {
        st.state == SessionState::Live && st.voice_profile == "nova"
    })
    .await;
    assert!(status.connection_id.is_some());
    assert_eq!(s.mic.opens(), 1);
    assert_eq!(s.mic.closes(), 0);
    assert_eq!(s.history.len(), 1);
}

#[tokio::test]
async fn voice_change_while_idle_applies_to_next_start() {
    let mut s = spawn_session(test_config());
    s.voice.set_voice_profile("aria");
    wait_status(&s.voice, |st| st.voice_profile == "aria").await;

    s.voice.start_and_wait().await.unwrap();
    let remote = s.next_remote().await;
    assert_eq!(remote.params.voice_profile, "aria");
    assert_eq!(s.connector.attempts(), 1);
}
