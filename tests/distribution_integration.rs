//! Distribution fan-out over real localhost sockets: session creation,
//! routing, degradation accounting, and session teardown.

use std::collections::HashMap;
use std::time::Duration;

use synopticon_backend::distribution::session::{SessionConfig, SessionManager};
use synopticon_backend::distribution::{
    Destination, DistributorConfig, DistributorState, OverflowMode,
};
use synopticon_backend::models::StreamKind;

fn udp_distributor(name: &str, port: u16) -> DistributorConfig {
    DistributorConfig {
        name: name.to_string(),
        destination: Destination::Udp { host: "127.0.0.1".to_string(), port },
        filter: None,
        queue_capacity: 128,
        overflow: OverflowMode::DropHead,
        degraded_threshold: 5,
    }
}

#[tokio::test]
async fn fan_out_reaches_both_udp_sinks() {
    let sink_a = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_b = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port_a = sink_a.local_addr().unwrap().port();
    let port_b = sink_b.local_addr().unwrap().port();

    let manager = SessionManager::default();
    manager
        .create_session(
            "fanout",
            SessionConfig {
                distributors: vec![udp_distributor("a", port_a), udp_distributor("b", port_b)],
                event_routing: HashMap::from([(
                    StreamKind::Gaze,
                    vec!["a".to_string(), "b".to_string()],
                )]),
            },
        )
        .await
        .unwrap();

    let payload = serde_json::json!({"x": 0.1, "y": 0.2});
    let reached = manager.route_event("fanout", StreamKind::Gaze, payload.clone()).unwrap();
    assert_eq!(reached, 2);

    for sink in [&sink_a, &sink_b] {
        let mut buf = [0u8; 512];
        let n = tokio::time::timeout(Duration::from_secs(2), sink.recv(&mut buf))
            .await
            .expect("datagram within deadline")
            .unwrap();
        let received: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(received, payload);
    }

    manager.end_session("fanout").await.unwrap();
}

#[tokio::test]
async fn per_distributor_ordering_is_preserved() {
    let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = sink.local_addr().unwrap().port();

    let manager = SessionManager::default();
    manager
        .create_session(
            "ordered",
            SessionConfig {
                distributors: vec![udp_distributor("out", port)],
                event_routing: HashMap::from([(StreamKind::Gaze, vec!["out".to_string()])]),
            },
        )
        .await
        .unwrap();

    for i in 0..10 {
        manager
            .route_event("ordered", StreamKind::Gaze, serde_json::json!({"n": i}))
            .unwrap();
    }

    let mut buf = [0u8; 512];
    for expected in 0..10 {
        let n = tokio::time::timeout(Duration::from_secs(2), sink.recv(&mut buf))
            .await
            .expect("datagram within deadline")
            .unwrap();
        let received: serde_json::Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(received["n"], expected, "datagrams must arrive in routed order");
    }

    manager.end_session("ordered").await.unwrap();
}

#[tokio::test]
async fn session_create_failure_is_atomic() {
    // Occupy a TCP port so the websocket distributor cannot bind it.
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap();

    let manager = SessionManager::default();
    let result = manager
        .create_session(
            "broken",
            SessionConfig {
                distributors: vec![
                    udp_distributor("ok", 9),
                    DistributorConfig {
                        name: "ws".to_string(),
                        destination: Destination::Websocket { bind: taken.to_string() },
                        filter: None,
                        queue_capacity: 128,
                        overflow: OverflowMode::DropHead,
                        degraded_threshold: 5,
                    },
                ],
                event_routing: HashMap::new(),
            },
        )
        .await;

    assert!(result.is_err());
    assert!(manager.session_ids().is_empty());
    assert!(manager.get_session_status("broken").is_err());
}

#[tokio::test]
async fn distributor_starts_active_and_reports_stats() {
    let sink = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = sink.local_addr().unwrap().port();

    let manager = SessionManager::default();
    manager
        .create_session(
            "stats",
            SessionConfig {
                distributors: vec![udp_distributor("out", port)],
                event_routing: HashMap::from([(StreamKind::Telemetry, vec!["out".to_string()])]),
            },
        )
        .await
        .unwrap();

    manager
        .route_event("stats", StreamKind::Telemetry, serde_json::json!({"speed": 27.0}))
        .unwrap();

    // Wait for the drain worker to push the datagram out.
    let mut buf = [0u8; 512];
    tokio::time::timeout(Duration::from_secs(2), sink.recv(&mut buf))
        .await
        .expect("datagram within deadline")
        .unwrap();

    let status = manager.get_session_status("stats").unwrap();
    let out = &status.distributors[0];
    assert_eq!(out.state, DistributorState::Active);
    assert_eq!(out.stats.sent, 1);
    assert!(out.stats.bytes > 0);
    assert_eq!(status.events_routed, 1);

    manager.end_session("stats").await.unwrap();
}
