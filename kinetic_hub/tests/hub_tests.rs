//! Client hub integration tests.
//!
//! Clients are plain outbound queues registered with the hub, so the tests
//! drive request routing and event fan-out without a socket. The hardware
//! behind the hub is a simulated device.

use kinetic_common::config::{DeviceConfig, SafetyConfig, SessionConfig};
use kinetic_hub::hub::{HubEvent, Outbound};
use kinetic_hub::{Authenticator, ClientHub, Recorder, SessionManager, StateStore, SystemMode};
use kinetic_motor::{HardwareCoordinator, LoopSettings, SimulatedLink, StillSource};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

// ─── Harness ────────────────────────────────────────────────────────

struct Harness {
    hub: ClientHub,
    link: SimulatedLink,
    dir: TempDir,
}

async fn harness(api_key: Option<&str>) -> Harness {
    let dir = TempDir::new().unwrap();
    let link = SimulatedLink::new();
    let hardware = HardwareCoordinator::new(
        Box::new(link.clone()),
        &DeviceConfig::default(),
        &SafetyConfig::default(),
    );
    assert!(hardware.initialize().await);

    let sessions = SessionManager::new(
        SessionConfig {
            storage_dir: dir.path().join("sessions"),
            max_concurrent_sessions: 2,
            ..SessionConfig::default()
        },
        hardware,
        Arc::new(StillSource),
        LoopSettings {
            cycle_interval: Duration::from_millis(5),
            retry_delay: Duration::from_millis(5),
            ..LoopSettings::default()
        },
    );
    let state = StateStore::load(&dir.path().join("state")).await;
    let recorder = Recorder::new(dir.path().join("recordings"));
    let hub = ClientHub::new(
        sessions,
        state,
        recorder,
        Authenticator::new(api_key.map(String::from)),
    );
    hub.start().await;
    Harness { hub, link, dir }
}

struct TestClient {
    id: String,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl TestClient {
    /// Connect and consume the initial `system_state`.
    async fn connect(hub: &ClientHub) -> Self {
        let mut client = Self::connect_raw(hub).await;
        let state = client.next().await;
        assert_eq!(state["type"], "system_state");
        client
    }

    async fn connect_raw(hub: &ClientHub) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = hub.connect(tx).await;
        Self { id, rx }
    }

    async fn send(&self, hub: &ClientHub, request: Value) {
        hub.handle_text(&self.id, &request.to_string()).await;
    }

    async fn next(&mut self) -> Value {
        match tokio::time::timeout(Duration::from_secs(1), self.rx.recv()).await {
            Ok(Some(Outbound::Text(text))) => serde_json::from_str(&text).unwrap(),
            Ok(Some(Outbound::Close)) => panic!("client {} was closed", self.id),
            Ok(None) => panic!("outbound queue of {} closed", self.id),
            Err(_) => panic!("no message for {} within 1s", self.id),
        }
    }

    /// Skip messages until one of type `kind` arrives.
    async fn next_of_type(&mut self, kind: &str) -> Value {
        for _ in 0..50 {
            let message = self.next().await;
            if message["type"] == kind {
                return message;
            }
        }
        panic!("no {kind} message for {}", self.id);
    }

    /// Messages that arrive within `wait`.
    async fn collect(&mut self, wait: Duration) -> Vec<Value> {
        let mut messages = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        while let Ok(Some(Outbound::Text(text))) =
            tokio::time::timeout_at(deadline, self.rx.recv()).await
        {
            messages.push(serde_json::from_str(&text).unwrap());
        }
        messages
    }

    async fn error(&mut self) -> String {
        let message = self.next_of_type("error").await;
        message["message"].as_str().unwrap().to_string()
    }
}

async fn create_session(hub: &ClientHub, client: &mut TestClient, mode: &str) -> String {
    client
        .send(hub, json!({"type": "create_session", "session_type": mode}))
        .await;
    let created = client.next_of_type("session_created").await;
    created["session_id"].as_str().unwrap().to_string()
}

// ─── Connection & authentication ────────────────────────────────────

#[tokio::test]
async fn new_connection_receives_the_system_state() {
    let h = harness(None).await;
    let mut client = TestClient::connect_raw(&h.hub).await;

    let state = client.next().await;
    assert_eq!(state["type"], "system_state");
    assert_eq!(state["mode"], "auto");
    assert_eq!(state["emergency_stopped"], false);
    assert_eq!(state["connected_clients"], 1);
    assert_eq!(state["recording_active"], false);
    for key in ["motor_canvas", "motor_pb", "motor_pcd", "motor_pe"] {
        assert_eq!(state["motor_states"][key]["velocity_rpm"], 0.0);
    }
    assert_eq!(state["safety_limits"]["canvas_max_rpm"], 120.0);
    assert_eq!(h.hub.stats().total_connections, 1);
}

#[tokio::test]
async fn without_a_secret_clients_get_demo_mode_with_every_permission() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;

    client.send(&h.hub, json!({"type": "authenticate"})).await;
    let reply = client.next().await;
    assert_eq!(reply["type"], "authenticated");
    assert_eq!(reply["api_access"], false);
    assert_eq!(reply["message"], "Demo mode - No API key configured");
    assert_eq!(client.next().await["type"], "system_state");
    assert_eq!(h.hub.client_info(&client.id).unwrap().client_type, "web_ui");

    create_session(&h.hub, &mut client, "manual").await;
}

#[tokio::test]
async fn secret_gates_session_and_safety_requests() {
    let h = harness(Some("s3cret")).await;
    let mut client = TestClient::connect(&h.hub).await;

    client
        .send(&h.hub, json!({"type": "motor_command", "motor_name": "motor_canvas", "velocity_rpm": 5.0}))
        .await;
    assert_eq!(
        client.error().await,
        "Access denied: motor_command requires full access"
    );

    client
        .send(&h.hub, json!({"type": "authenticate", "api_key": "wrong"}))
        .await;
    let failed = client.next().await;
    assert_eq!(failed["type"], "authentication_failed");
    assert_eq!(failed["message"], "Invalid API key - access denied");

    client
        .send(&h.hub, json!({"type": "authenticate", "client_type": "visitor"}))
        .await;
    let visitor = client.next_of_type("authenticated").await;
    assert_eq!(visitor["message"], "Demo mode - Visitor mode");
    client
        .send(&h.hub, json!({"type": "create_session", "session_type": "manual"}))
        .await;
    assert_eq!(
        client.error().await,
        "Access denied: create_session requires full access"
    );
    client
        .send(&h.hub, json!({"type": "reset_emergency_stop"}))
        .await;
    assert_eq!(
        client.error().await,
        "Access denied: reset_emergency_stop requires full access"
    );

    client
        .send(&h.hub, json!({"type": "authenticate", "api_key": "s3cret"}))
        .await;
    let full = client.next_of_type("authenticated").await;
    assert_eq!(full["api_access"], true);
    assert_eq!(full["message"], "Full access - blockchain API enabled");
    assert!(h.hub.client_info(&client.id).unwrap().authenticated);
    create_session(&h.hub, &mut client, "manual").await;
}

#[tokio::test]
async fn malformed_requests_are_answered_with_errors() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;

    h.hub.handle_text(&client.id, "{not json").await;
    assert!(client.error().await.starts_with("Invalid JSON"));

    client.send(&h.hub, json!({"type": "dance"})).await;
    assert_eq!(client.error().await, "Unknown message type: dance");

    client.send(&h.hub, json!({"velocity_rpm": 3.0})).await;
    assert_eq!(client.error().await, "Unknown message type: None");

    client
        .send(&h.hub, json!({"type": "motor_command", "motor_name": "motor_canvas"}))
        .await;
    assert!(client.error().await.starts_with("Invalid motor_command message"));

    client.send(&h.hub, json!({"type": "ping"})).await;
    assert_eq!(client.next().await["type"], "pong");
}

// ─── Safety ─────────────────────────────────────────────────────────

#[tokio::test]
async fn emergency_stop_reaches_every_client() {
    let h = harness(None).await;
    let mut a = TestClient::connect(&h.hub).await;
    let mut b = TestClient::connect(&h.hub).await;

    a.send(&h.hub, json!({"type": "emergency_stop"})).await;
    for client in [&mut a, &mut b] {
        let stop = client.next_of_type("emergency_stop").await;
        assert_eq!(stop["reason"], "client_request");
    }
    assert!(h.link.device().lock().count("emergency_stop") >= 1);
    assert!(h.hub.hardware().is_emergency_stop_active().await);

    b.send(&h.hub, json!({"type": "reset_emergency_stop"})).await;
    a.next_of_type("emergency_stop_reset").await;
    b.next_of_type("emergency_stop_reset").await;

    b.send(&h.hub, json!({"type": "reset_emergency_stop"})).await;
    assert_eq!(b.error().await, "Emergency stop is not active");
}

#[tokio::test]
async fn overspeed_manual_command_is_vetoed_and_stops_everything() {
    let h = harness(None).await;
    let mut a = TestClient::connect(&h.hub).await;
    let mut b = TestClient::connect(&h.hub).await;

    a.send(
        &h.hub,
        json!({"type": "motor_command", "motor_name": "motor_canvas", "velocity_rpm": 130.0}),
    )
    .await;
    assert!(a.error().await.starts_with("Failed to execute motor command"));

    let alert = b.next_of_type("safety_alert").await;
    assert_eq!(alert["alert"]["kind"], "velocity_exceeded");
    b.next_of_type("emergency_stop").await;
    assert_eq!(h.link.device().lock().count("motor_commands"), 0);

    a.send(&h.hub, json!({"type": "reset_emergency_stop"})).await;
    assert!(a.error().await.starts_with("Cannot reset emergency stop"));

    a.send(
        &h.hub,
        json!({"type": "motor_command", "motor_name": "motor_pb", "velocity_rpm": 10.0}),
    )
    .await;
    assert!(a.error().await.starts_with("Failed to execute motor command"));
    // Refused while latched, without stopping the device again.
    assert_eq!(h.link.device().lock().count("emergency_stop"), 1);
}

#[tokio::test]
async fn alert_resolves_only_once() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;
    client
        .send(
            &h.hub,
            json!({"type": "motor_command", "motor_name": "motor_canvas", "velocity_rpm": 130.0}),
        )
        .await;
    client.error().await;

    client
        .send(&h.hub, json!({"type": "resolve_alert", "index": 0}))
        .await;
    let resolved = client.next_of_type("alert_resolved").await;
    assert_eq!(resolved["index"], 0);

    client
        .send(&h.hub, json!({"type": "resolve_alert", "index": 0}))
        .await;
    assert_eq!(client.error().await, "Alert 0 not found or already resolved");
}

#[tokio::test]
async fn unknown_alert_cannot_be_resolved() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;
    client
        .send(&h.hub, json!({"type": "resolve_alert", "index": 42}))
        .await;
    assert_eq!(
        client.error().await,
        "Alert 42 not found or already resolved"
    );
}

// ─── Manual control ─────────────────────────────────────────────────

#[tokio::test]
async fn manual_command_is_acknowledged_and_broadcast() {
    let h = harness(None).await;
    let mut events = h.hub.subscribe();
    let mut a = TestClient::connect(&h.hub).await;
    let mut b = TestClient::connect(&h.hub).await;

    a.send(
        &h.hub,
        json!({"type": "motor_command", "motor_name": "canvas", "velocity_rpm": 30.0, "direction": "CW"}),
    )
    .await;

    let executed = a.next_of_type("motor_command_executed").await;
    assert_eq!(executed["command"]["motor_name"], "motor_canvas");
    assert_eq!(executed["command"]["velocity_rpm"], 30.0);
    assert_eq!(executed["command"]["source"], "manual");
    assert_eq!(executed["command"]["client_id"], a.id.as_str());

    let update = b.next_of_type("motor_update").await;
    assert_eq!(update["motor_name"], "motor_canvas");
    assert_eq!(update["state"]["velocity_rpm"], 30.0);
    assert_eq!(update["state"]["direction"], "CW");

    assert_eq!(h.link.device().lock().count("motor_commands"), 1);
    assert_eq!(h.hub.stats().total_motor_commands, 1);
    assert_eq!(h.hub.state().motor_snapshots()[kinetic_common::motor::MotorName::Canvas].velocity_rpm, 30.0);
    assert!(h.dir.path().join("state/last_motor_states.json").exists());

    let mut saw_command = false;
    while let Ok(event) = events.try_recv() {
        if let HubEvent::MotorCommand(command) = event {
            assert_eq!(command.client_id, a.id);
            saw_command = true;
        }
    }
    assert!(saw_command);
}

#[tokio::test]
async fn invalid_motor_commands_are_rejected_before_the_device() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;

    client
        .send(&h.hub, json!({"type": "motor_command", "motor_name": "motor_x", "velocity_rpm": 1.0}))
        .await;
    assert_eq!(client.error().await, "Unknown motor: motor_x");

    client
        .send(
            &h.hub,
            json!({"type": "motor_command", "motor_name": "motor_pe", "velocity_rpm": 10.0, "direction": "CCW"}),
        )
        .await;
    assert!(client.error().await.starts_with("Invalid motor command"));
    assert_eq!(h.link.device().lock().count("motor_commands"), 0);
}

#[tokio::test]
async fn last_motor_states_are_sent_per_motor() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;
    client
        .send(&h.hub, json!({"type": "get_last_motor_states"}))
        .await;

    let mut motors = Vec::new();
    for _ in 0..4 {
        let update = client.next_of_type("motor_update").await;
        motors.push(update["motor_name"].as_str().unwrap().to_string());
    }
    motors.sort();
    assert_eq!(motors, ["motor_canvas", "motor_pb", "motor_pcd", "motor_pe"]);
}

// ─── Mode ───────────────────────────────────────────────────────────

#[tokio::test]
async fn mode_change_is_validated_persisted_and_broadcast() {
    let h = harness(None).await;
    let mut a = TestClient::connect(&h.hub).await;
    let mut b = TestClient::connect(&h.hub).await;

    a.send(&h.hub, json!({"type": "mode_change"})).await;
    assert_eq!(a.error().await, "Missing mode parameter");
    a.send(&h.hub, json!({"type": "mode_change", "mode": "turbo"}))
        .await;
    assert!(a.error().await.starts_with("Invalid mode"));

    a.send(&h.hub, json!({"type": "mode_change", "mode": "manual"}))
        .await;
    for client in [&mut a, &mut b] {
        let changed = client.next_of_type("mode_changed").await;
        assert_eq!(changed["new_mode"], "manual");
    }
    assert_eq!(h.hub.state().mode(), SystemMode::Manual);
    let saved = std::fs::read_to_string(h.dir.path().join("state/system_mode.txt")).unwrap();
    assert_eq!(saved.trim(), "manual");
}

// ─── Sessions ───────────────────────────────────────────────────────

#[tokio::test]
async fn session_lifecycle_is_reported_to_members_and_everyone() {
    let h = harness(None).await;
    let mut a = TestClient::connect(&h.hub).await;
    let mut b = TestClient::connect(&h.hub).await;

    let session_id = create_session(&h.hub, &mut a, "manual").await;
    let announced = b.next_of_type("session_created").await;
    assert_eq!(announced["session_id"], session_id.as_str());
    assert_eq!(h.hub.stats().total_sessions, 1);

    a.send(&h.hub, json!({"type": "start_session"})).await;
    assert_eq!(a.error().await, "Missing session_id");

    a.send(&h.hub, json!({"type": "start_session", "session_id": session_id}))
        .await;
    let started = a.next_of_type("session_started").await;
    assert_eq!(started["session_id"], session_id.as_str());
    b.next_of_type("session_started").await;

    a.send(&h.hub, json!({"type": "join_session", "session_id": session_id}))
        .await;
    a.next_of_type("session_joined").await;
    assert_eq!(h.hub.session_members(&session_id), vec![a.id.clone()]);

    b.send(&h.hub, json!({"type": "pause_session", "session_id": session_id}))
        .await;
    let paused = a.next_of_type("session_paused").await;
    assert_eq!(paused["paused_by"], b.id.as_str());
    b.next_of_type("session_paused").await;

    b.send(&h.hub, json!({"type": "resume_session", "session_id": session_id}))
        .await;
    a.next_of_type("session_resumed").await;

    a.send(&h.hub, json!({"type": "stop_session", "session_id": session_id}))
        .await;
    let stopped = a.next_of_type("session_stopped").await;
    assert_eq!(stopped["status"], "completed");
    assert_eq!(stopped["stopped_by"], a.id.as_str());
    let completed = b.next_of_type("session_completed").await;
    assert_eq!(completed["status"], "completed");

    assert!(h.hub.session_members(&session_id).is_empty());
    assert_eq!(h.hub.client_info(&a.id).unwrap().session, None);

    a.send(&h.hub, json!({"type": "get_sessions", "include_completed": true}))
        .await;
    let listed = a.next_of_type("sessions_list").await;
    assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn failed_join_keeps_the_current_membership() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;
    let session_id = create_session(&h.hub, &mut client, "manual").await;

    client
        .send(&h.hub, json!({"type": "join_session", "session_id": session_id}))
        .await;
    client.next_of_type("session_joined").await;

    client
        .send(&h.hub, json!({"type": "join_session", "session_id": "no-such-session"}))
        .await;
    assert_eq!(client.error().await, "Failed to join session");
    assert_eq!(
        h.hub.client_info(&client.id).unwrap().session.as_deref(),
        Some(session_id.as_str())
    );
    assert_eq!(h.hub.session_members(&session_id), vec![client.id.clone()]);
}

#[tokio::test]
async fn joining_notifies_the_other_members_only() {
    let h = harness(None).await;
    let mut a = TestClient::connect(&h.hub).await;
    let mut b = TestClient::connect(&h.hub).await;
    let session_id = create_session(&h.hub, &mut a, "manual").await;

    a.send(&h.hub, json!({"type": "join_session", "session_id": session_id}))
        .await;
    a.next_of_type("session_joined").await;

    b.send(
        &h.hub,
        json!({"type": "authenticate", "client_type": "installation_display"}),
    )
    .await;
    b.send(&h.hub, json!({"type": "join_session", "session_id": session_id}))
        .await;
    b.next_of_type("session_joined").await;

    let joined = a.next_of_type("client_joined").await;
    assert_eq!(joined["client_id"], b.id.as_str());
    assert_eq!(joined["client_type"], "installation_display");

    let late = b.collect(Duration::from_millis(50)).await;
    assert!(late.iter().all(|m| m["type"] != "client_joined"));
}

#[tokio::test]
async fn disconnect_removes_the_client_from_its_session() {
    let h = harness(None).await;
    let mut events = h.hub.subscribe();
    let mut a = TestClient::connect(&h.hub).await;
    let _b = TestClient::connect(&h.hub).await;
    let session_id = create_session(&h.hub, &mut a, "manual").await;
    a.send(&h.hub, json!({"type": "join_session", "session_id": session_id}))
        .await;
    a.next_of_type("session_joined").await;

    h.hub.disconnect(&a.id).await;
    assert_eq!(h.hub.client_count(), 1);
    assert!(h.hub.session_members(&session_id).is_empty());
    let session = h.hub.sessions().get_session(&session_id).await.unwrap();
    assert!(!session.participants.contains(&a.id));

    let mut closed = false;
    while let Ok(outbound) = a.rx.try_recv() {
        closed |= outbound == Outbound::Close;
    }
    assert!(closed);

    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        if let HubEvent::ClientDisconnected { client_id } = event {
            saw_disconnect |= client_id == a.id;
        }
    }
    assert!(saw_disconnect);
}

#[tokio::test]
async fn broken_connection_is_dropped_on_broadcast() {
    let h = harness(None).await;
    let mut a = TestClient::connect(&h.hub).await;
    let b = TestClient::connect(&h.hub).await;
    drop(b);

    a.send(&h.hub, json!({"type": "mode_change", "mode": "manual"}))
        .await;
    a.next_of_type("mode_changed").await;
    assert_eq!(h.hub.client_count(), 1);
    assert_eq!(h.hub.stats().peak_concurrent_clients, 2);
}

// ─── Status & recording ─────────────────────────────────────────────

#[tokio::test]
async fn system_status_reports_health() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;

    client
        .send(&h.hub, json!({"type": "get_system_status"}))
        .await;
    let status = client.next_of_type("system_status").await;
    assert_eq!(status["health"]["status"], "healthy");
    assert_eq!(status["health"]["hardware_connected"], true);
    assert_eq!(status["stats"]["connected_clients"], 1);
    assert_eq!(status["session_manager_stats"]["max_concurrent_sessions"], 2);
    assert_eq!(status["hardware"]["emergency_stop_active"], false);
    assert!(status["control_loop"].is_null());

    client.send(&h.hub, json!({"type": "emergency_stop"})).await;
    client.next_of_type("emergency_stop").await;
    client
        .send(&h.hub, json!({"type": "get_system_status"}))
        .await;
    let status = client.next_of_type("system_status").await;
    assert_eq!(status["health"]["status"], "unhealthy");

    client
        .send(&h.hub, json!({"type": "subscribe_events"}))
        .await;
    let subscribed = client.next_of_type("events_subscribed").await;
    assert_eq!(subscribed["events"], json!(["all"]));
}

#[tokio::test]
async fn recording_captures_manual_commands() {
    let h = harness(None).await;
    let mut client = TestClient::connect(&h.hub).await;

    client
        .send(&h.hub, json!({"type": "start_recording", "session_name": "demo"}))
        .await;
    client.next_of_type("recording_started").await;
    client
        .send(&h.hub, json!({"type": "start_recording", "session_name": "other"}))
        .await;
    assert_eq!(client.error().await, "Recording 'demo' is already active");

    client
        .send(
            &h.hub,
            json!({"type": "motor_command", "motor_name": "motor_pcd", "velocity_rpm": -12.0}),
        )
        .await;
    client.next_of_type("motor_command_executed").await;

    client.send(&h.hub, json!({"type": "stop_recording"})).await;
    let stopped = client.next_of_type("recording_stopped").await;
    assert_eq!(stopped["session_name"], "demo");
    assert_eq!(stopped["commands"], 1);
    assert!(std::path::Path::new(stopped["path"].as_str().unwrap()).exists());

    client.send(&h.hub, json!({"type": "stop_recording"})).await;
    assert_eq!(client.error().await, "No recording is active");
}
