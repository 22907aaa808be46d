//! Terminal sessions driven through the relay: operator HTTP calls on one
//! side, the agent's shell on the other.
#![cfg(unix)]

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::*;
use deskrelay::api::AppState;
use deskrelay::identity::Role;
use deskrelay::protocol::{self, AgentToRelay};
use deskrelay::terminal::{
    SessionState, TerminalEvent, TerminalSession, TerminalSettings, FLUSH_INTERVAL, KILLED_EXIT_CODE,
    MAX_BATCH_BYTES,
};
use serde_json::json;
use tokio::sync::broadcast;

struct Fixture {
    state: AppState,
    app: axum::Router,
    agent: TestAgent,
    token: String,
    endpoint: String,
    _staging: tempfile::TempDir,
}

fn fixture(terminal: TerminalSession) -> Fixture {
    let state = test_state();
    let app = test_app(&state);
    let staging = tempfile::tempdir().unwrap();
    let tenant = state.store.create_tenant("Tenant One").unwrap();
    let endpoint = enroll_endpoint(&state, &tenant.id, "machine-term");
    let agent = connect_agent_with_terminal(&state, &endpoint, staging.path(), terminal);
    let tech = create_operator(&state, "tech", Role::Technician);
    assign_tenant(&state, &tech, &tenant.id);
    let token = session_token(&state, &tech);
    Fixture {
        state,
        app,
        agent,
        token,
        endpoint,
        _staging: staging,
    }
}

impl Fixture {
    async fn post(&self, action: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        call(
            &self.app,
            json_request(
                "POST",
                &format!("/api/endpoints/{}/terminal/{action}", self.endpoint),
                Some(&self.token),
                body,
            ),
        )
        .await
    }
}

fn short_idle(idle_timeout: Duration) -> TerminalSession {
    TerminalSession::with_settings(TerminalSettings {
        idle_timeout,
        ..TerminalSettings::default()
    })
}

async fn next_end(events: &mut broadcast::Receiver<TerminalEvent>, within: Duration) -> Option<i32> {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(TerminalEvent::Ended { exit_code }) => return exit_code,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .ok()
}

/// Collect output until `needle` shows up or `within` elapses.
async fn wait_for_output(events: &mut broadcast::Receiver<TerminalEvent>, needle: &str, within: Duration) -> bool {
    let mut seen = String::new();
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(TerminalEvent::Output(text)) => {
                    seen.push_str(&text);
                    if seen.contains(needle) {
                        return;
                    }
                }
                Ok(TerminalEvent::Ended { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_ok()
}

#[tokio::test]
async fn echo_reaches_the_operator_promptly() {
    let f = fixture(TerminalSession::new());
    let mut events = f.agent.link.subscribe_terminal();

    let (status, body) = f.post("start", json!({})).await;
    assert_eq!(status, StatusCode::OK, "start: {body}");
    assert_eq!(body["ok"], true);

    let (status, _) = f.post("input", json!({"data": "echo hi"})).await;
    assert_eq!(status, StatusCode::OK);
    // A couple of flush ticks plus shell startup.
    assert!(wait_for_output(&mut events, "hi\n", FLUSH_INTERVAL * 20).await);

    let (status, _) = f.post("stop", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(f.agent.runtime.terminal().state(), SessionState::Idle);
}

#[tokio::test]
async fn second_start_is_refused_while_running() {
    let f = fixture(TerminalSession::new());

    assert_eq!(f.post("start", json!({})).await.0, StatusCode::OK);
    let (status, body) = f.post("start", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "agent_refused");

    f.post("stop", json!({})).await;
}

#[tokio::test]
async fn input_without_a_session_is_refused() {
    let f = fixture(TerminalSession::new());
    let (status, body) = f.post("input", json!({"data": "whoami"})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "agent_refused");
}

#[tokio::test]
async fn concurrent_stops_end_the_session_once() {
    let f = fixture(TerminalSession::new());
    let mut events = f.agent.link.subscribe_terminal();
    assert_eq!(f.post("start", json!({})).await.0, StatusCode::OK);

    let (a, b, c) = tokio::join!(
        f.post("stop", json!({})),
        f.post("stop", json!({})),
        f.post("stop", json!({})),
    );
    assert_eq!(a.0, StatusCode::OK);
    assert_eq!(b.0, StatusCode::OK);
    assert_eq!(c.0, StatusCode::OK);

    // Give stragglers a chance to show up before counting.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut ended = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TerminalEvent::Ended { .. }) {
            ended += 1;
        }
    }
    assert_eq!(ended, 1);
    assert_eq!(f.agent.runtime.terminal().state(), SessionState::Idle);
}

#[tokio::test]
async fn idle_session_is_torn_down() {
    let f = fixture(short_idle(Duration::from_millis(300)));
    let mut events = f.agent.link.subscribe_terminal();
    assert_eq!(f.post("start", json!({})).await.0, StatusCode::OK);

    let exit_code = next_end(&mut events, Duration::from_secs(5)).await;
    assert_eq!(exit_code, Some(KILLED_EXIT_CODE), "idle session should end");

    // The endpoint can host a new session afterwards.
    assert_eq!(f.post("start", json!({})).await.0, StatusCode::OK);
    f.post("stop", json!({})).await;
}

#[tokio::test]
async fn large_output_is_split_into_frames_the_wire_accepts() {
    const BYTES: usize = 2_000_000;
    let f = fixture(TerminalSession::new());
    let mut events = f.agent.link.subscribe_terminal();
    assert_eq!(f.post("start", json!({})).await.0, StatusCode::OK);

    // One enormous line, then a marker.
    let command = format!("head -c {BYTES} /dev/zero | tr '\\000' a; echo; echo DONE");
    assert_eq!(f.post("input", json!({"data": command})).await.0, StatusCode::OK);

    let (batches, largest, seen) = tokio::time::timeout(Duration::from_secs(30), async {
        let (mut batches, mut largest, mut seen) = (0usize, 0usize, String::new());
        while !seen.ends_with("DONE\n") {
            match events.recv().await {
                Ok(TerminalEvent::Output(data)) => {
                    batches += 1;
                    largest = largest.max(data.len());
                    let frame = AgentToRelay::TerminalOutput { data: data.clone() };
                    assert!(protocol::encode(&frame).is_ok(), "batch of {} bytes rejected", data.len());
                    seen.push_str(&data);
                }
                Ok(TerminalEvent::Ended { .. }) => panic!("session ended early"),
                Err(e) => panic!("terminal events: {e}"),
            }
        }
        (batches, largest, seen)
    })
    .await
    .expect("all output should arrive");

    assert!(largest <= MAX_BATCH_BYTES, "largest batch {largest}");
    assert!(batches > BYTES / MAX_BATCH_BYTES);
    assert_eq!(seen.bytes().filter(|b| *b == b'a').count(), BYTES);
    f.post("stop", json!({})).await;
}

#[tokio::test]
async fn session_that_ends_while_disconnected_is_reported_on_reconnect() {
    let f = fixture(short_idle(Duration::from_millis(300)));
    assert_eq!(f.post("start", json!({})).await.0, StatusCode::OK);

    let runtime = f.agent.runtime.clone();
    let flush_calls = f.agent.flush_calls.clone();
    let Fixture {
        state,
        app,
        agent,
        token,
        endpoint,
        _staging,
    } = f;

    // The link drops; the shell lives on the endpoint and idles out alone.
    drop(agent);
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.terminal().state() != SessionState::Idle {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session should idle out while disconnected");

    let mut agent = attach_runtime(&state, &endpoint, runtime, flush_calls);
    let exit_code = next_end(&mut agent.terminal_events, Duration::from_secs(5)).await;
    assert_eq!(exit_code, Some(KILLED_EXIT_CODE));

    // Reported once, not again.
    assert_eq!(next_end(&mut agent.terminal_events, Duration::from_millis(300)).await, None);

    let (status, _) = call(
        &app,
        json_request("POST", &format!("/api/endpoints/{endpoint}/terminal/start"), Some(&token), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    call(
        &app,
        json_request("POST", &format!("/api/endpoints/{endpoint}/terminal/stop"), Some(&token), json!({})),
    )
    .await;
}
