// Result demultiplexing: matching, duplicates, gaps, isolation, disconnects

mod common;

use anyhow::Result;
use common::*;
use rbm_stream::transport::ResultMessage;
use rbm_stream::{LoopbackOptions, SessionEvent, SessionState, StreamError, StreamSettings};
use std::time::Duration;

fn silent_backend() -> LoopbackOptions {
    LoopbackOptions {
        respond: false,
        ..LoopbackOptions::default()
    }
}

fn reply(session_id: &str, sequence: u64) -> ResultMessage {
    ResultMessage {
        session_id: session_id.to_string(),
        sequence,
        values: vec![0.1, 0.7, 0.2],
    }
}

#[tokio::test]
async fn test_result_for_unsent_sequence_is_unmatched() -> Result<()> {
    let (manager, transport) = manager_with(silent_backend(), settings());
    let handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    for _ in 0..=30 {
        manager.push(&id, &pcm8_frame(15))?;
    }
    wait_until(|| transport.received(&id).len() == 31).await;

    assert!(transport.inject_result(&id, reply(&id, 50)));
    wait_until(|| manager.stats(&id).map(|s| s.results_unmatched == 1).unwrap_or(false)).await;

    let stats = manager.stats(&id)?;
    assert_eq!(stats.state, SessionState::Active);
    assert_eq!(stats.results_delivered, 0);
    assert_eq!(stats.outstanding, 31);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_result_delivered_once() -> Result<()> {
    let (manager, transport) = manager_with(silent_backend(), settings());
    let mut handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    manager.push(&id, &pcm8_frame(15))?;
    wait_until(|| transport.received(&id) == vec![0]).await;

    transport.inject_result(&id, reply(&id, 0));
    transport.inject_result(&id, reply(&id, 0));
    wait_until(|| manager.stats(&id).map(|s| s.results_duplicate == 1).unwrap_or(false)).await;

    manager.close_session(&id).await?;
    let events = drain_events(&mut handle.events).await;
    assert_eq!(result_sequences(&events), vec![0]);

    let SessionEvent::Result(result) = &events[1] else {
        panic!("expected a result event, got {:?}", events[1]);
    };
    assert_eq!(result.argmax(), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_gap_reported_as_missing_without_blocking_later_results() -> Result<()> {
    let settings = StreamSettings {
        gap_timeout: Duration::from_millis(50),
        ..settings()
    };
    let (manager, transport) = manager_with(silent_backend(), settings);
    let mut handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    manager.push(&id, &pcm8_frame(15))?;
    manager.push(&id, &pcm8_frame(15))?;
    wait_until(|| transport.received(&id).len() == 2).await;

    transport.inject_result(&id, reply(&id, 1));

    assert!(matches!(
        next_event(&mut handle.events).await,
        SessionEvent::Active { .. }
    ));
    match next_event(&mut handle.events).await {
        SessionEvent::Result(result) => assert_eq!(result.sequence, 1),
        other => panic!("expected result 1, got {other:?}"),
    }
    match next_event(&mut handle.events).await {
        SessionEvent::MissingResult(missing) => {
            assert_eq!(missing.sequence, 0);
            assert!(missing.overtaken);
        }
        other => panic!("expected missing result, got {other:?}"),
    }

    // A straggler still lands after being reported missing.
    transport.inject_result(&id, reply(&id, 0));
    match next_event(&mut handle.events).await {
        SessionEvent::Result(result) => assert_eq!(result.sequence, 0),
        other => panic!("expected result 0, got {other:?}"),
    }
    assert_eq!(manager.stats(&id)?.results_missing, 1);
    Ok(())
}

#[tokio::test]
async fn test_close_abandons_unanswered_results_after_grace() -> Result<()> {
    let settings = StreamSettings {
        result_grace: Duration::from_millis(100),
        ..settings()
    };
    let (manager, transport) = manager_with(silent_backend(), settings);
    let handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    for _ in 0..3 {
        manager.push(&id, &pcm8_frame(15))?;
    }
    wait_until(|| transport.received(&id).len() == 3).await;
    transport.inject_result(&id, reply(&id, 0));

    let report = manager.close_session(&id).await?;
    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.frames_sent, 3);
    assert_eq!(report.results_delivered, 1);
    assert_eq!(report.results_abandoned, 2);
    Ok(())
}

#[tokio::test]
async fn test_sessions_are_isolated() -> Result<()> {
    let (manager, transport) = manager();
    let mut first = manager.start_session(session_config()).await?;
    let mut second = manager.start_session(session_config()).await?;
    assert_ne!(first.session_id, second.session_id);

    for _ in 0..3 {
        manager.push(&first.session_id, &pcm8_frame(10))?;
    }
    for _ in 0..5 {
        manager.push(&second.session_id, &pcm8_frame(90))?;
    }

    // A result addressed to the first session arriving on the second's stream.
    wait_until(|| transport.received(&second.session_id).len() == 5).await;
    transport.inject_result(&second.session_id, reply(&first.session_id, 0));

    manager.close_session(&first.session_id).await?;
    manager.close_session(&second.session_id).await?;

    assert_eq!(transport.received(&first.session_id), vec![0, 1, 2]);
    assert_eq!(transport.received(&second.session_id), vec![0, 1, 2, 3, 4]);

    let first_events = drain_events(&mut first.events).await;
    let second_events = drain_events(&mut second.events).await;
    assert_eq!(result_sequences(&first_events), vec![0, 1, 2]);
    assert_eq!(result_sequences(&second_events), vec![0, 1, 2, 3, 4]);
    assert!(second_events.iter().all(|event| match event {
        SessionEvent::Result(result) => result.session_id == second.session_id,
        _ => true,
    }));
    assert_eq!(manager.stats(&second.session_id)?.results_unmatched, 1);
    Ok(())
}

#[tokio::test]
async fn test_undecodable_results_are_skipped() -> Result<()> {
    let (manager, transport) = manager_with(silent_backend(), settings());
    let handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    assert!(transport.inject_garbage(&id));
    manager.push(&id, &pcm8_frame(15))?;
    wait_until(|| transport.received(&id).len() == 1).await;
    transport.inject_result(&id, reply(&id, 0));

    wait_until(|| manager.stats(&id).map(|s| s.results_delivered == 1).unwrap_or(false)).await;
    assert_eq!(manager.state(&id), Some(SessionState::Active));
    Ok(())
}

#[tokio::test]
async fn test_backend_disconnect_fails_session() -> Result<()> {
    let (manager, transport) = manager();
    let mut handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    manager.push(&id, &pcm8_frame(15))?;
    wait_until(|| transport.received(&id).len() == 1).await;
    transport.disconnect(&id);

    let events = drain_events(&mut handle.events).await;
    match events.last() {
        Some(SessionEvent::Failed { cause, .. }) => {
            assert_eq!(cause, &StreamError::BackendDisconnected(id.clone()))
        }
        other => panic!("expected Failed event, got {other:?}"),
    }
    assert_eq!(manager.state(&id), Some(SessionState::Failed));
    assert!(manager.close_session(&id).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_failed_event_reaches_consumer_that_stopped_reading() -> Result<()> {
    let settings = StreamSettings {
        event_capacity: 4,
        result_grace: Duration::from_millis(100),
        ..settings()
    };
    let (manager, transport) = manager_with(LoopbackOptions::default(), settings);
    let mut handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    for _ in 0..6 {
        manager.push(&id, &pcm8_frame(15))?;
    }
    // Active plus results 0..=2 fill the queue; result 3 is matched but stuck.
    wait_until(|| manager.stats(&id).map(|s| s.results_delivered == 4).unwrap_or(false)).await;

    transport.fail_next_sends(3);
    manager.push(&id, &pcm8_frame(15))?;
    wait_until(|| manager.state(&id) == Some(SessionState::Failed)).await;

    let events = drain_events(&mut handle.events).await;
    assert!(matches!(events[0], SessionEvent::Active { .. }));
    assert_eq!(result_sequences(&events), vec![0, 1, 2]);
    match events.last() {
        Some(SessionEvent::Failed { cause, .. }) => assert!(matches!(
            cause,
            StreamError::TransmissionFailed { sequence: 6, .. }
        )),
        other => panic!("expected Failed last, got {other:?}"),
    }

    let stats = manager.stats(&id)?;
    assert_eq!(stats.results_delivered, 4);
    assert_eq!(stats.events_undelivered, 1);
    Ok(())
}

#[tokio::test]
async fn test_close_reports_results_cut_off_from_stalled_consumer() -> Result<()> {
    let settings = StreamSettings {
        event_capacity: 2,
        result_grace: Duration::from_millis(100),
        ..settings()
    };
    let (manager, transport) = manager_with(LoopbackOptions::default(), settings);
    let mut handle = manager.start_session(session_config()).await?;
    let id = handle.session_id.clone();

    for _ in 0..5 {
        manager.push(&id, &pcm8_frame(15))?;
    }
    wait_until(|| transport.received(&id).len() == 5).await;
    wait_until(|| manager.stats(&id).map(|s| s.results_delivered == 2).unwrap_or(false)).await;

    let report = manager.close_session(&id).await?;
    assert_eq!(report.state, SessionState::Closed);
    assert_eq!(report.results_delivered, 2);
    assert_eq!(report.events_undelivered, 1);
    assert_eq!(report.results_abandoned, 3);

    let events = drain_events(&mut handle.events).await;
    assert_eq!(events.len(), 3);
    assert_eq!(result_sequences(&events), vec![0]);
    match events.last() {
        Some(SessionEvent::Closed(closed)) => assert_eq!(closed.events_undelivered, 1),
        other => panic!("expected Closed last, got {other:?}"),
    }
    Ok(())
}
