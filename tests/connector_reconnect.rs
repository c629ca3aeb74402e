//! Connector lifecycle against a real local TCP endpoint: connect, frame
//! delivery, severed-transport recovery, and terminal disconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use synopticon_backend::connectors::beamng::{BeamNgConfig, BeamNgConnector, BeamNgTransport};
use synopticon_backend::connectors::{
    ConnectionState, ConnectorConfig, ConnectorEvent, SimulatorConnector,
};

fn vehicle_frame(n: u64) -> String {
    serde_json::json!({
        "position": [n as f64, 0.0, 0.0],
        "velocity": [10.0, 0.0, 0.0],
        "rotation": [0.0, 0.0, 0.0, 1.0],
        "engineRpm": 2500.0,
        "throttleInput": 0.5,
        "brakeInput": 0.0,
        "steeringInput": 0.0,
        "gear": 2,
        "fuel": 0.8,
        "damage": 0.0
    })
    .to_string()
        + "\n"
}

fn test_config(port: u16, auto_reconnect: bool) -> BeamNgConfig {
    BeamNgConfig {
        host: "127.0.0.1".to_string(),
        port,
        transport: BeamNgTransport::Tcp,
        connector: ConnectorConfig {
            auto_reconnect,
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_millis(400),
            connect_timeout: Duration::from_secs(2),
            fallback_to_mock: false,
            ..Default::default()
        },
    }
}

async fn wait_for_state(
    connector: &Arc<BeamNgConnector>,
    state: ConnectionState,
    deadline: Duration,
) -> bool {
    let until = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < until {
        if connector.get_status().state == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn connects_and_receives_normalized_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        for n in 0..5u64 {
            socket.write_all(vehicle_frame(n).as_bytes()).await.unwrap();
        }
        // Keep the connection up briefly so the client drains everything.
        tokio::time::sleep(Duration::from_millis(300)).await;
    });

    let connector = BeamNgConnector::new(test_config(port, false));
    let mut frames = connector.subscribe();
    Arc::clone(&connector).connect().await.unwrap();

    assert!(wait_for_state(&connector, ConnectionState::Connected, Duration::from_secs(2)).await);

    let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("frame within deadline")
        .expect("frame");
    assert_eq!(frame.simulator, "beamng");
    assert_eq!(frame.controls.gear, 2);
    assert!((frame.performance.speed - 10.0).abs() < 1e-9);

    connector.disconnect().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn severed_transport_walks_the_reconnect_state_machine() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // First session: accept then drop immediately to sever the transport.
    // Second session: accept and hold, so the connector can recover.
    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(socket);
        let (_held, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let connector = BeamNgConnector::new(test_config(port, true));
    let mut events = connector.subscribe_to_events();
    Arc::clone(&connector).connect().await.unwrap();

    assert!(wait_for_state(&connector, ConnectionState::Connected, Duration::from_secs(2)).await);

    // Collect the state walk after the sever: connected → reconnecting →
    // connecting → connected, within 500 ms of the drop.
    let mut walk: Vec<(ConnectionState, ConnectionState)> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
            Ok(Ok(ConnectorEvent::ConnectionChange { old_state, new_state })) => {
                walk.push((old_state, new_state));
                if new_state == ConnectionState::Connected
                    && walk.iter().any(|(o, n)| {
                        *o == ConnectionState::Connected && *n == ConnectionState::Reconnecting
                    })
                {
                    break;
                }
            }
            Ok(Ok(_)) | Ok(Err(_)) => continue,
            Err(_) => {
                if connector.get_status().state == ConnectionState::Connected
                    && walk.iter().any(|(o, n)| {
                        *o == ConnectionState::Connected && *n == ConnectionState::Reconnecting
                    })
                {
                    break;
                }
            }
        }
    }

    assert!(
        walk.contains(&(ConnectionState::Connected, ConnectionState::Reconnecting)),
        "expected connected→reconnecting, saw {walk:?}"
    );
    assert!(
        walk.contains(&(ConnectionState::Reconnecting, ConnectionState::Connecting)),
        "expected reconnecting→connecting, saw {walk:?}"
    );
    assert!(
        walk.contains(&(ConnectionState::Connecting, ConnectionState::Connected)),
        "expected connecting→connected, saw {walk:?}"
    );
    assert!(connector.get_status().stats.reconnects >= 1);

    connector.disconnect().await.unwrap();
    server.abort();
}

#[tokio::test]
async fn no_auto_reconnect_terminates_on_loss() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(socket);
    });

    let connector = BeamNgConnector::new(test_config(port, false));
    Arc::clone(&connector).connect().await.unwrap();

    assert!(wait_for_state(&connector, ConnectionState::Connected, Duration::from_secs(2)).await);
    assert!(
        wait_for_state(&connector, ConnectionState::Disconnected, Duration::from_secs(2)).await,
        "connector should terminate when auto_reconnect is off"
    );
    server.await.unwrap();
}

#[tokio::test]
async fn queued_commands_drain_on_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        use tokio::io::AsyncBufReadExt;
        let (socket, _) = listener.accept().await.unwrap();
        let mut lines = tokio::io::BufReader::new(socket).lines();
        // The queued command arrives as one JSON line.
        tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .expect("line within deadline")
            .unwrap()
            .unwrap()
    });

    let connector = BeamNgConnector::new(test_config(port, false));
    connector.queue_command(synopticon_backend::models::Command::new(
        "vehicle",
        "set-throttle",
        serde_json::json!({"value": 0.7}),
    ));
    assert_eq!(connector.get_status().queued_commands, 1);

    Arc::clone(&connector).connect().await.unwrap();
    let line = server.await.unwrap();
    let command: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(command["action"], "set-throttle");
    assert_eq!(command["parameters"]["value"], 0.7);

    connector.disconnect().await.unwrap();
}
