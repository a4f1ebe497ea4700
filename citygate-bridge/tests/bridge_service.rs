use std::time::Duration;

use citygate_core::{ClientRequest, DeviceKind, DeviceStatus, DeviceUpdate, Envelope};
use citygate_rpc::{
    ActuatorTarget, CancellationToken, Client, ClientError, WireErrorCode, read_envelope,
    write_envelope,
};
use tokio::net::{TcpListener, TcpStream};

/// A relay that answers every command with `status` and records the command
/// name it was sent.
async fn fake_relay(status: DeviceStatus) -> (u16, tokio::task::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let Envelope::ClientRequest(ClientRequest::SendDeviceCommand { command, .. }) =
            read_envelope(&mut stream).await.unwrap()
        else {
            panic!("expected a command");
        };
        let reply = Envelope::DeviceUpdate(DeviceUpdate::status_only(
            command.device_id,
            DeviceKind::Relay,
            status,
        ));
        write_envelope(&mut stream, &reply).await.unwrap();
        command.command_type.to_string()
    });
    (port, handle)
}

async fn start_bridge(device_timeout: Duration) -> (Client, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = citygate_bridge::server(listener, device_timeout);
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move { server.serve(token).await });

    let stream = TcpStream::connect(addr).await.unwrap();
    (Client::new(stream).with_timeout(Duration::from_secs(3)), cancel)
}

fn target(port: u16) -> ActuatorTarget {
    ActuatorTarget {
        device_id: "relay_1".into(),
        host: "127.0.0.1".into(),
        port,
    }
}

#[tokio::test]
async fn turn_on_is_forwarded_and_status_returned() {
    let (port, relay) = fake_relay(DeviceStatus::On).await;
    let (client, cancel) = start_bridge(Duration::from_secs(2)).await;

    let reply = client.turn_on(target(port)).await.unwrap();

    assert_eq!(reply.status, DeviceStatus::On);
    assert_eq!(reply.device_id.as_str(), "relay_1");
    assert_eq!(relay.await.unwrap(), "TURN_ON");
    cancel.cancel();
}

#[tokio::test]
async fn query_state_sends_get_status() {
    let (port, relay) = fake_relay(DeviceStatus::Off).await;
    let (client, cancel) = start_bridge(Duration::from_secs(2)).await;

    let reply = client.query_state(target(port)).await.unwrap();

    assert_eq!(reply.status, DeviceStatus::Off);
    assert_eq!(relay.await.unwrap(), "GET_STATUS");
    cancel.cancel();
}

#[tokio::test]
async fn unreachable_device_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let (client, cancel) = start_bridge(Duration::from_secs(2)).await;

    let err = client.turn_off(target(port)).await.unwrap_err();

    match err {
        ClientError::ErrorResponse(wire) => assert_eq!(wire.code, WireErrorCode::DeviceUnreachable),
        other => panic!("unexpected error: {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test]
async fn silent_device_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    let (client, cancel) = start_bridge(Duration::from_millis(200)).await;

    let err = client.turn_on(target(port)).await.unwrap_err();

    match err {
        ClientError::ErrorResponse(wire) => assert_eq!(wire.code, WireErrorCode::DeviceTimeout),
        other => panic!("unexpected error: {other:?}"),
    }
    cancel.cancel();
}
