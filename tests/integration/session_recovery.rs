//! Reconnects, retry exhaustion, protocol failures and pause/resume.
//!
//! These run on a paused clock so backoff and pause timers elapse instantly.

use crate::helpers::{settle, spawn_session, test_config, wait_status};
use livevoice::channel::messages::{InboundEvent, OutboundMessage};
use livevoice::error::ConnectError;
use livevoice::{SessionState, StartError};

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_retries_then_recovers_on_manual_start() {
    let mut s = spawn_session(test_config());
    s.connector
        .fail_next(3, ConnectError::Handshake("connection refused".into()));

    let err = s.voice.start_and_wait().await.unwrap_err();
    assert!(
        matches!(err, StartError::ConnectFailed { attempts: 3, .. }),
        "{err:?}"
    );
    assert_eq!(s.connector.attempts(), 3);
    wait_status(&s.voice, |st| st.state == SessionState::Idle).await;
    s.mic.wait_closes(1).await;
    assert!(s.errors().iter().any(|e| e.contains("after 3 attempts")));

    // The counter is only cleared by a successful connect.
    s.voice.start_and_wait().await.expect("manual start");
    let remote = s.next_remote().await;
    assert_eq!(remote.params.attempt, 3);

    // A later drop starts a fresh retry cycle.
    drop(remote);
    let again = s.next_remote().await;
    assert_eq!(again.params.attempt, 1);
    wait_status(&s.voice, |st| st.state == SessionState::Live).await;
}

#[tokio::test(start_paused = true)]
async fn frames_captured_while_reconnecting_are_replayed() {
    let mut s = spawn_session(test_config());
    s.voice.start_and_wait().await.unwrap();
    let first = s.next_remote().await;

    drop(first);
    wait_status(&s.voice, |st| st.state == SessionState::Reconnecting).await;
    s.mic.feed(&[0.2; 8]);

    let mut second = s.next_remote().await;
    for expected in 0..2 {
        match second.next_message().await {
            OutboundMessage::AudioFrame { sequence, .. } => assert_eq!(sequence, expected),
            other => panic!("expected buffered audio, got {other:?}"),
        }
    }
    assert_eq!(s.mic.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_buffer_drops_oldest_frames() {
    let mut config = test_config();
    config.reconnect_buffer_frames = 2;
    let mut s = spawn_session(config);
    s.voice.start_and_wait().await.unwrap();
    drop(s.next_remote().await);

    wait_status(&s.voice, |st| st.state == SessionState::Reconnecting).await;
    s.mic.feed(&[0.2; 16]);

    let mut second = s.next_remote().await;
    let mut sequences = Vec::new();
    for _ in 0..2 {
        if let OutboundMessage::AudioFrame { sequence, .. } = second.next_message().await {
            sequences.push(sequence);
        }
    }
    assert_eq!(sequences, [2, 3]);
}

#[tokio::test(start_paused = true)]
async fn consecutive_malformed_events_force_a_reconnect() {
    let mut config = test_config();
    config.protocol_error_threshold = 3;
    let mut s = spawn_session(config);
    s.voice.start_and_wait().await.unwrap();
    let first = s.next_remote().await;

    first.send_raw("{not json");
    first.send_raw(r#"{"type":"mystery"}"#);
    // A valid event resets the count.
    first.send(InboundEvent::PartialInputTranscript { text: "hi".into() });
    first.send_raw(r#"{"type":"audio_chunk","data":""}"#);
    first.send_raw("garbage");
    settle().await;
    assert_eq!(s.connector.attempts(), 1);
    assert!(!first.is_closed());

    first.send_raw("still garbage");
    let _second = s.next_remote().await;
    assert!(first.is_closed());
    assert_eq!(s.connector.attempts(), 2);

    // The partial turn was committed when its channel went away.
    let turns = s.history.turns();
    assert_eq!(turns.len(), 1);
    assert!(turns[0].interrupted);
}

#[tokio::test(start_paused = true)]
async fn remote_fatal_error_reconnects() {
    let mut s = spawn_session(test_config());
    s.voice.start_and_wait().await.unwrap();
    let first = s.next_remote().await;

    first.send(InboundEvent::FatalError {
        message: "session expired".into(),
    });
    let second = s.next_remote().await;
    assert!(first.is_closed());
    assert_eq!(second.params.attempt, 1);
    wait_status(&s.voice, |st| st.state == SessionState::Live).await;
    assert_eq!(s.mic.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn pause_disconnects_then_resumes_with_mic_restored() {
    let mut s = spawn_session(test_config());
    s.voice.start_and_wait().await.unwrap();
    let first = s.next_remote().await;

    s.voice.pause(2);
    let status = wait_status(&s.voice, |st| st.state == SessionState::Paused).await;
    assert!(!status.muted, "pause is not a user mute");
    assert!(first.is_closed());

    // Nothing is framed while paused.
    s.mic.feed(&[0.3; 8]);

    let mut second = s.next_remote().await;
    wait_status(&s.voice, |st| st.state == SessionState::Live).await;
    s.mic.feed(&[0.3; 4]);
    match second.next_message().await {
        OutboundMessage::AudioFrame { sequence, .. } => assert_eq!(sequence, 0),
        other => panic!("expected audio frame, got {other:?}"),
    }
    assert_eq!(s.mic.opens(), 1);
    assert_eq!(s.mic.closes(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_cancels_the_retry() {
    let mut s = spawn_session(test_config());
    s.connector
        .fail_next(1, ConnectError::Timeout(std::time::Duration::from_secs(10)));
    let voice = s.voice.clone();
    let start = tokio::spawn(async move { voice.start_and_wait().await });

    // First attempt fails and the session waits out its backoff.
    wait_status(&s.voice, |st| st.state == SessionState::Connecting).await;
    while s.connector.attempts() < 1 {
        tokio::task::yield_now().await;
    }
    s.voice.stop(true);

    assert_eq!(start.await.unwrap(), Err(StartError::Aborted));
    wait_status(&s.voice, |st| st.state == SessionState::Idle).await;
    settle().await;
    assert_eq!(s.connector.attempts(), 1);
    assert!(s.remotes.try_recv().is_err());
}
