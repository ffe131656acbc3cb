use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc;
use genuine_transport::config::{DefaultParameterProvider, Parameter, ParameterValue};
use genuine_transport::error::TransportError;
use genuine_transport::events::GenuineEventKind;
use genuine_transport::manager::connection_manager::ConnectionManager;
use genuine_transport::manager::context::TransportContext;
use genuine_transport::manager::service::ServerServiceEntry;
use genuine_transport::manager::transport::Transport;
use genuine_transport::message::{IncomingMessage, Message, MessageMode};
use genuine_transport::security::parameters::{SecuritySessionAttributes, SecuritySessionParameters};
use genuine_transport::security::provider::Aes256GcmProvider;
use genuine_transport::udp::udp_config::UdpConfig;
use genuine_transport::udp::udp_connection_manager::UdpConnectionManager;

struct Echo;
impl ServerServiceEntry for Echo {
    fn handle(&self, message: &IncomingMessage) -> Option<Bytes> {
        let mut reply = b"echo: ".to_vec();
        reply.extend_from_slice(&message.payload);
        Some(reply.into())
    }
}

struct Recorder(mpsc::UnboundedSender<IncomingMessage>);
impl ServerServiceEntry for Recorder {
    fn handle(&self, message: &IncomingMessage) -> Option<Bytes> {
        self.0.send(message.clone()).ok();
        None
    }
}

fn params() -> DefaultParameterProvider {
    DefaultParameterProvider::new()
        .with(Parameter::UdpMtu, ParameterValue::Usize(1000))
        .with(Parameter::InvocationTimeout, ParameterValue::Duration(Duration::from_secs(5)))
}

async fn udp_node(params: DefaultParameterProvider) -> (Arc<ConnectionManager>, String) {
    params.validate().unwrap();
    let ctx = TransportContext::new(Arc::new(params), Default::default());
    let transport = UdpConnectionManager::new(ctx.clone(), UdpConfig::new("127.0.0.1:0".parse().unwrap())).unwrap();
    let manager = ConnectionManager::new(ctx, transport.clone(), None);
    manager.start_listening().await.unwrap();
    (manager, transport.local_uri())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_reply() {
    let (client, client_uri) = udp_node(params()).await;
    let (server, server_uri) = udp_node(params()).await;
    server.register_service("echo", Arc::new(Echo));

    let to = client.ctx().hosts.get_or_create(&server_uri);
    let reply = client.send_request(Message::new(to, "echo", Bytes::from_static(b"hello"))).await.unwrap();

    assert_eq!(reply.payload.as_ref(), b"echo: hello");
    assert_eq!(reply.sender.uri(), server_uri);
    assert!(server.ctx().hosts.get(&client_uri).is_some());
    assert_eq!(client.traffic().messages_sent, 1);
    assert_eq!(client.traffic().messages_received, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_encrypted_multi_chunk_request() {
    const KEY: [u8; 32] = [42; 32];
    let (client, _) = udp_node(params()).await;
    let (server, server_uri) = udp_node(params()).await;
    for node in [&client, &server] {
        node.register_security_provider("/aes", Arc::new(Aes256GcmProvider::new(&KEY).unwrap()));
    }
    server.register_service("echo", Arc::new(Echo));

    // random content does not compress, so it travels in about 20 datagrams
    let payload = (0..20_000).map(|_| rand::random::<u8>()).collect::<Vec<_>>();
    let msg = Message::new(client.ctx().hosts.get_or_create(&server_uri), "echo", payload.clone())
        .with_security_session_parameters(Arc::new(SecuritySessionParameters::new("/aes", SecuritySessionAttributes::ENABLE_COMPRESSION, None)));
    let reply = client.send_request(msg).await.unwrap();

    assert_eq!(&reply.payload[..6], b"echo: ");
    assert_eq!(&reply.payload[6..], payload.as_slice());
    assert_eq!(reply.session_name, "/aes");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_way() {
    let (client, _) = udp_node(params()).await;
    let (server, server_uri) = udp_node(params()).await;
    let (send, mut recv) = mpsc::unbounded_channel();
    server.register_service("sink", Arc::new(Recorder(send)));

    let msg = Message::new(client.ctx().hosts.get_or_create(&server_uri), "sink", Bytes::from_static(b"fire and forget"))
        .with_mode(MessageMode::OneWay);
    client.send(msg).await.unwrap();

    let received = recv.recv().await.unwrap();
    assert_eq!(received.payload.as_ref(), b"fire and forget");
    assert_eq!(received.mode, MessageMode::OneWay);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_service_times_out() {
    let short_timeout = || params().with(Parameter::InvocationTimeout, ParameterValue::Duration(Duration::from_millis(500)));
    let (client, _) = udp_node(short_timeout()).await;
    let (server, server_uri) = udp_node(short_timeout()).await;
    let mut events = server.ctx().events.subscribe();

    let to = client.ctx().hosts.get_or_create(&server_uri);
    let result = client.send_request(Message::new(to, "nobody", Bytes::new())).await;
    assert!(matches!(result, Err(TransportError::ServerDidNotReply { .. })));

    let event = events.recv().await.unwrap();
    assert_eq!(event.kind, GenuineEventKind::UnknownService);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disposed_manager_rejects_sends() {
    let (client, _) = udp_node(params()).await;
    let (_server, server_uri) = udp_node(params()).await;

    assert!(client.dispose(TransportError::ConnectionShutDown("test".to_string())).await);
    let to = client.ctx().hosts.get_or_create(&server_uri);
    assert!(matches!(client.send(Message::new(to, "echo", Bytes::new())).await, Err(TransportError::Disposed { .. })));
}
