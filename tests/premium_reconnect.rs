//! Premium backend transport tests against a local WebSocket server:
//! session configuration on connect, frame contract, and the
//! reconnection policy (backoff, attempt cap, intentional suppression).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use wisp::audio::AudioFrame;
use wisp::backend::BackendEvent;
use wisp::backend::premium::{PremiumBackend, PremiumConfig};
use wisp::clock::ManualClock;
use wisp::cost::{CostLedger, SharedLedger};

fn test_config(port: u16) -> PremiumConfig {
    PremiumConfig {
        api_url: format!("ws://127.0.0.1:{port}"),
        model: String::new(),
        api_key: "test-key".into(),
        voice: "alloy".into(),
        instructions: "Keep it short.".into(),
        temperature: 0.8,
        tools: Vec::new(),
        input_sample_rate: 16_000,
    }
}

fn test_ledger() -> SharedLedger {
    Arc::new(Mutex::new(CostLedger::new(1.0, 30.0)))
}

async fn next_event(rx: &mut broadcast::Receiver<BackendEvent>) -> BackendEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for backend event")
        .expect("event stream closed")
}

/// Wait for a specific event kind, skipping unrelated ones.
async fn wait_for<F>(rx: &mut broadcast::Receiver<BackendEvent>, mut pred: F) -> BackendEvent
where
    F: FnMut(&BackendEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn session_configuration_sent_on_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["voice"], "alloy");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");

        ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        // Hold the connection open until the client goes away.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let backend = PremiumBackend::connect(
        test_config(port),
        Arc::new(ManualClock::default()),
        test_ledger(),
    )
    .await
    .unwrap();
    let mut rx = backend.subscribe();

    let event = next_event(&mut rx).await;
    assert!(matches!(event, BackendEvent::SessionReady));

    drop(backend);
    let _ = server.await;
}

#[tokio::test]
async fn audio_append_and_commit_frame_contract() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let mut types = Vec::new();
        let mut first_audio = None;
        for _ in 0..4 {
            let frame = ws.next().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
            let kind = value["type"].as_str().unwrap().to_owned();
            if kind == "input_audio_buffer.append" && first_audio.is_none() {
                first_audio = value["audio"].as_str().map(str::to_owned);
            }
            types.push(kind);
        }
        assert_eq!(
            types,
            vec![
                "session.update",
                "input_audio_buffer.append",
                "input_audio_buffer.commit",
                "response.create",
            ]
        );
        // Four bytes of PCM, base64 "AAECAw==".
        assert_eq!(first_audio.as_deref(), Some("AAECAw=="));

        // Respond with one audio delta and a completed response.
        ws.send(Message::Text(
            r#"{"type":"response.audio.delta","delta":"UENNUENN"}"#.into(),
        ))
        .await
        .unwrap();
        ws.send(Message::Text(r#"{"type":"response.done"}"#.into()))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let ledger = test_ledger();
    let mut backend = PremiumBackend::connect(
        test_config(port),
        Arc::new(ManualClock::default()),
        ledger.clone(),
    )
    .await
    .unwrap();
    let mut rx = backend.subscribe();

    let frame = AudioFrame::new(Bytes::from(vec![0u8, 1, 2, 3]), 16_000, 1, chrono::Utc::now());
    backend.append_audio(frame).await.unwrap();
    backend.commit_audio().await.unwrap();

    let chunk = wait_for(&mut rx, |e| matches!(e, BackendEvent::AudioChunk(_))).await;
    match chunk {
        BackendEvent::AudioChunk(pcm) => assert_eq!(&pcm[..], b"PCMPCM"),
        other => panic!("expected audio chunk, got {other:?}"),
    }

    let done = wait_for(&mut rx, |e| matches!(e, BackendEvent::ResponseDone)).await;
    assert!(matches!(done, BackendEvent::ResponseDone));

    // One realtime cost entry covering both audio directions.
    let ledger = ledger.lock().unwrap();
    assert_eq!(ledger.entries().len(), 1);
    assert!(ledger.entries()[0].amount > 0.0);

    drop(backend);
    let _ = server.await;
}

#[tokio::test]
async fn reconnects_after_unsolicited_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // First connection: configure, then drop without warning.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _config = ws.next().await.unwrap().unwrap();
        ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();

        // Second connection: the reconnect. Config must be re-issued.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "session.update");
        ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let backend = PremiumBackend::connect(
        test_config(port),
        Arc::new(ManualClock::default()),
        test_ledger(),
    )
    .await
    .unwrap();
    let mut rx = backend.subscribe();

    assert!(matches!(next_event(&mut rx).await, BackendEvent::SessionReady));

    let disconnected = wait_for(&mut rx, |e| matches!(e, BackendEvent::Disconnected { .. })).await;
    assert!(matches!(disconnected, BackendEvent::Disconnected { .. }));

    match next_event(&mut rx).await {
        BackendEvent::Reconnecting { attempt, delay_ms } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay_ms, 1_000);
        }
        other => panic!("expected reconnecting, got {other:?}"),
    }

    match next_event(&mut rx).await {
        BackendEvent::Reconnected { attempt } => assert_eq!(attempt, 1),
        other => panic!("expected reconnected, got {other:?}"),
    }

    assert!(matches!(next_event(&mut rx).await, BackendEvent::SessionReady));

    drop(backend);
    let _ = server.await;
}

#[tokio::test]
async fn five_failed_attempts_end_in_reconnection_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _config = ws.next().await.unwrap().unwrap();
        ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
        // Listener drops here: every reconnect attempt is refused.
    });

    let backend = PremiumBackend::connect(
        test_config(port),
        Arc::new(ManualClock::default()),
        test_ledger(),
    )
    .await
    .unwrap();
    let mut rx = backend.subscribe();

    assert!(matches!(next_event(&mut rx).await, BackendEvent::SessionReady));
    let _ = server.await;

    wait_for(&mut rx, |e| matches!(e, BackendEvent::Disconnected { .. })).await;

    let mut attempts = Vec::new();
    loop {
        match next_event(&mut rx).await {
            BackendEvent::Reconnecting { attempt, delay_ms } => {
                // Exponential schedule, capped at 30 s.
                let expected = (1_000u64 * 2u64.pow(attempt - 1)).min(30_000);
                assert_eq!(delay_ms, expected);
                attempts.push(attempt);
            }
            BackendEvent::ReconnectionFailed => break,
            other => panic!("unexpected event during reconnect: {other:?}"),
        }
    }
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);

    drop(backend);
}

#[tokio::test]
async fn intentional_disconnect_suppresses_reconnection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _config = ws.next().await.unwrap().unwrap();
        ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut backend = PremiumBackend::connect(
        test_config(port),
        Arc::new(ManualClock::default()),
        test_ledger(),
    )
    .await
    .unwrap();
    let mut rx = backend.subscribe();

    assert!(matches!(next_event(&mut rx).await, BackendEvent::SessionReady));

    backend.disconnect(true).await.unwrap();

    let disconnected = wait_for(&mut rx, |e| matches!(e, BackendEvent::Disconnected { .. })).await;
    match disconnected {
        BackendEvent::Disconnected { reason, .. } => {
            assert_eq!(reason, "intentional disconnect");
        }
        other => panic!("expected disconnect, got {other:?}"),
    }

    // No reconnection activity follows a deliberate close.
    tokio::time::sleep(Duration::from_millis(200)).await;
    loop {
        match rx.try_recv() {
            Ok(BackendEvent::Reconnecting { .. }) => panic!("reconnect after intentional close"),
            Ok(_) => continue,
            Err(_) => break,
        }
    }

    let _ = server.await;
}

#[tokio::test]
async fn reconnect_request_resets_a_parked_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let port = addr.port();

    let first = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _config = ws.next().await.unwrap().unwrap();
        ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
    });

    let backend = PremiumBackend::connect(
        test_config(port),
        Arc::new(ManualClock::default()),
        test_ledger(),
    )
    .await
    .unwrap();
    let mut rx = backend.subscribe();

    assert!(matches!(next_event(&mut rx).await, BackendEvent::SessionReady));
    let _ = first.await;

    // Exhaust the automatic attempts against the now-closed port.
    wait_for(&mut rx, |e| matches!(e, BackendEvent::ReconnectionFailed)).await;

    // Bring the endpoint back and ask for another round.
    let listener = TcpListener::bind(addr).await.unwrap();
    let second = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _config = ws.next().await.unwrap().unwrap();
        ws.send(Message::Text(r#"{"type":"session.created"}"#.into()))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    backend.reconnect().unwrap();

    match wait_for(&mut rx, |e| matches!(e, BackendEvent::Reconnected { .. })).await {
        BackendEvent::Reconnected { attempt } => assert_eq!(attempt, 1),
        other => panic!("expected reconnected, got {other:?}"),
    }
    assert!(matches!(next_event(&mut rx).await, BackendEvent::SessionReady));

    drop(backend);
    let _ = second.await;
}
