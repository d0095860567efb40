mod common;

use common::{init_tracing, subscriber_config};
use mqtt_loadtest::mqtt::{ConnectOptions, RumqttFactory, RumqttTransport, Transport};
use mqtt_loadtest::{
    Aggregate, ConnectError, ConnectionRegistry, LoadTestError, SamplerConfig, SubscriberSession,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const SUBACK_GRANTED_QOS0: u8 = 0x00;
const SUBACK_FAILURE: u8 = 0x80;

/// Behaviour of the scripted broker
#[derive(Clone, Copy)]
struct Script {
    suback_code: u8,
    /// Close the first connection right after its first SUBACK
    drop_first_after_suback: bool,
    /// Payload pushed on `load/test` after every granted SUBACK
    greeting: Option<&'static str>,
}

/// Minimal MQTT 3.1.1 peer speaking just enough of the protocol for rumqttc
struct ScriptedBroker {
    uri: String,
    connections: Arc<AtomicUsize>,
    subscribes: Arc<AtomicUsize>,
}

impl ScriptedBroker {
    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("tcp://{}", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let subscribes = Arc::new(AtomicUsize::new(0));

        let (accepted, subscribed) = (connections.clone(), subscribes.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let first = accepted.fetch_add(1, Ordering::SeqCst) == 0;
                tokio::spawn(serve(
                    stream,
                    script,
                    first && script.drop_first_after_suback,
                    subscribed.clone(),
                ));
            }
        });

        Self {
            uri,
            connections,
            subscribes,
        }
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn publish_packet(topic: &str, payload: &str) -> Vec<u8> {
    let mut packet = vec![0x30, (2 + topic.len() + payload.len()) as u8];
    packet.extend((topic.len() as u16).to_be_bytes());
    packet.extend(topic.as_bytes());
    packet.extend(payload.as_bytes());
    packet
}

async fn serve(mut stream: TcpStream, script: Script, drop_after_suback: bool, subscribes: Arc<AtomicUsize>) {
    while let Ok((header, body)) = read_packet(&mut stream).await {
        let reply = match header >> 4 {
            // CONNECT
            1 => vec![0x20, 0x02, 0x00, 0x00],
            // SUBSCRIBE
            8 => {
                subscribes.fetch_add(1, Ordering::SeqCst);
                let mut reply = vec![0x90, 0x03, body[0], body[1], script.suback_code];
                if let Some(greeting) = script.greeting {
                    if script.suback_code != SUBACK_FAILURE && !drop_after_suback {
                        reply.extend(publish_packet("load/test", greeting));
                    }
                }
                reply
            }
            // PINGREQ
            12 => vec![0xd0, 0x00],
            // DISCONNECT
            14 => return,
            _ => continue,
        };
        if stream.write_all(&reply).await.is_err() {
            return;
        }
        if header >> 4 == 8 && drop_after_suback {
            return;
        }
    }
}

fn registry() -> Arc<ConnectionRegistry> {
    init_tracing();
    Arc::new(ConnectionRegistry::new(Arc::new(RumqttFactory)))
}

#[tokio::test]
async fn rejected_subscription_fails_the_sample_at_once() {
    let broker = ScriptedBroker::start(Script {
        suback_code: SUBACK_FAILURE,
        drop_first_after_suback: false,
        greeting: None,
    })
    .await;
    let config = SamplerConfig {
        host: broker.uri.clone(),
        connection_timeout_ms: 1_000,
        ..subscriber_config("rumqtt-rejected", Aggregate::Limited(1), 5_000)
    };
    let mut session = SubscriberSession::new(config, registry(), CancellationToken::new()).unwrap();

    let started = Instant::now();
    let result = session.sample().await;

    assert!(!result.is_success());
    assert!(
        result.response_message().starts_with("Failed to subscribe to load/test"),
        "{}",
        result
    );
    assert!(result.response_message().contains("rejected by broker"));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(broker.subscribes(), 1);
    session.close().await;
}

#[tokio::test]
async fn granted_subscription_receives_messages() {
    let broker = ScriptedBroker::start(Script {
        suback_code: SUBACK_GRANTED_QOS0,
        drop_first_after_suback: false,
        greeting: Some("hello"),
    })
    .await;
    let config = SamplerConfig {
        host: broker.uri.clone(),
        connection_timeout_ms: 1_000,
        ..subscriber_config("rumqtt-granted", Aggregate::Limited(1), 5_000)
    };
    let mut session = SubscriberSession::new(config, registry(), CancellationToken::new()).unwrap();

    let result = session.sample().await;

    assert!(result.is_success(), "{}", result);
    assert_eq!(result.response_data(), "hello\n");
    session.close().await;
}

#[tokio::test]
async fn clean_session_subscription_survives_a_dropped_connection() {
    let broker = ScriptedBroker::start(Script {
        suback_code: SUBACK_GRANTED_QOS0,
        drop_first_after_suback: true,
        greeting: Some("after-reconnect"),
    })
    .await;
    let config = SamplerConfig {
        host: broker.uri.clone(),
        clean_session: true,
        connection_timeout_ms: 1_000,
        ..subscriber_config("rumqtt-reconnect", Aggregate::Limited(1), 5_000)
    };
    let mut session = SubscriberSession::new(config, registry(), CancellationToken::new()).unwrap();

    let result = session.sample().await;

    assert!(result.is_success(), "{}", result);
    assert_eq!(result.response_data(), "after-reconnect\n");
    assert_eq!(broker.connections(), 2);
    assert_eq!(broker.subscribes(), 2);
    session.close().await;
}

#[tokio::test]
async fn silent_broker_is_a_connect_timeout() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let uri = format!("tcp://{}", listener.local_addr().unwrap());
    let holder = tokio::spawn(async move {
        // accept and never answer the CONNECT
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let options = ConnectOptions {
        client_id: "rumqtt-silent".to_string(),
        broker_uri: uri,
        keep_alive: Duration::from_secs(5),
        clean_session: true,
        credentials: None,
        channel_capacity: 10,
        ack_timeout: Duration::from_millis(500),
    };
    let transport = RumqttTransport::new(&options).unwrap();

    let result = transport.connect(Duration::from_millis(1_500)).await;
    assert_eq!(result, Err(ConnectError::Timeout(1_500)));
    transport.force_disconnect().await;
    holder.abort();
}

#[tokio::test]
async fn unusable_client_id_is_rejected_before_connecting() {
    let config = SamplerConfig {
        client_id: String::new(),
        random_suffix: true,
        suffix_length: 0,
        ..subscriber_config("", Aggregate::Limited(1), 1_000)
    };
    let created = SubscriberSession::new(config, registry(), CancellationToken::new());
    assert!(matches!(created, Err(LoadTestError::Config(_))));

    let transport = RumqttTransport::new(&ConnectOptions {
        client_id: String::new(),
        broker_uri: "tcp://127.0.0.1:1883".to_string(),
        keep_alive: Duration::from_secs(5),
        clean_session: false,
        credentials: None,
        channel_capacity: 10,
        ack_timeout: Duration::from_millis(100),
    });
    assert!(matches!(transport, Err(LoadTestError::Config(_))));
}
