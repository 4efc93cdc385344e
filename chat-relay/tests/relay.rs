use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use chat_relay::{
    config::{RelayConfig, RoutingPolicy},
    message::Delivery,
    registry::Registry,
    relay::Relay,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestRelay {
    addr: SocketAddr,
    registry: Arc<Registry>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let relay = Relay::new(listener, config);
        let addr = relay.local_addr()?;
        let registry = relay.registry();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            server,
        })
    }

    async fn directed() -> Result<Self> {
        Self::start(RelayConfig::default()).await
    }

    async fn connect(&self) -> Result<Ws> {
        let (ws, _) = connect_async(format!("ws://{}/", self.addr)).await?;
        Ok(ws)
    }

    /// Connects and logs in, confirming the login with a message to itself.
    async fn join(&self, user_id: &str) -> Result<Ws> {
        let mut ws = self.connect().await?;
        login(&mut ws, user_id).await?;
        send_message(&mut ws, user_id, user_id, "probe").await?;
        let probe = expect_delivery(&mut ws).await?;
        assert_eq!(probe, delivery(user_id, "probe"));
        Ok(ws)
    }

    async fn wait_until_gone(&self, user_id: &str) -> Result<()> {
        timeout(WAIT, async {
            while self.registry.contains(user_id).await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("{user_id} was never removed from the registry"))
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        if timeout(WAIT, self.server).await.is_err() {
            eprintln!("relay did not shut down in time");
        }
    }
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) -> Result<()> {
    ws.send(Message::Text(value.to_string())).await?;
    Ok(())
}

async fn login(ws: &mut Ws, user_id: &str) -> Result<()> {
    send_json(ws, json!({"type": "login", "userId": user_id})).await
}

async fn send_message(ws: &mut Ws, from: &str, to: &str, text: &str) -> Result<()> {
    send_json(
        ws,
        json!({"type": "message", "from": from, "to": to, "message": text}),
    )
    .await
}

fn delivery(from: &str, message: &str) -> Delivery {
    Delivery {
        from: from.to_string(),
        message: message.to_string(),
    }
}

async fn expect_delivery(ws: &mut Ws) -> Result<Delivery> {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .map_err(|_| anyhow!("timed out waiting for a delivery"))?;
        match frame {
            Some(Ok(Message::Text(text))) => return Ok(serde_json::from_str(&text)?),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => return Err(anyhow!("expected a delivery, got {other:?}")),
        }
    }
}

async fn expect_silence(ws: &mut Ws) {
    if let Ok(frame) = timeout(QUIET, ws.next()).await {
        panic!("expected no frame, got {frame:?}");
    }
}

#[tokio::test]
async fn directed_message_reaches_only_the_recipient() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;
    let mut b = relay.join("u2").await?;
    let mut c = relay.join("u3").await?;

    send_message(&mut a, "u1", "u2", "hi").await?;

    assert_eq!(expect_delivery(&mut b).await?, delivery("u1", "hi"));
    expect_silence(&mut a).await;
    expect_silence(&mut c).await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;
    let mut b = relay.join("u2").await?;
    let mut c = relay.join("u3").await?;

    send_message(&mut a, "u1", "all", "yo").await?;

    assert_eq!(expect_delivery(&mut b).await?, delivery("u1", "yo"));
    assert_eq!(expect_delivery(&mut c).await?, delivery("u1", "yo"));
    expect_silence(&mut a).await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn message_without_recipient_is_broadcast() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;
    let mut b = relay.join("u2").await?;

    send_json(&mut a, json!({"type": "message", "from": "u1", "message": "yo"})).await?;

    assert_eq!(expect_delivery(&mut b).await?, delivery("u1", "yo"));
    expect_silence(&mut a).await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn lone_broadcaster_hears_nothing() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;

    send_message(&mut a, "u1", "all", "anyone?").await?;
    expect_silence(&mut a).await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_recipient_is_dropped_silently() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;

    send_message(&mut a, "u1", "u9", "hello?").await?;
    expect_silence(&mut a).await;

    // The sender's connection is still usable afterwards.
    let mut b = relay.join("u2").await?;
    send_message(&mut a, "u1", "u2", "still here").await?;
    assert_eq!(expect_delivery(&mut b).await?, delivery("u1", "still here"));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_removes_identity_until_it_logs_in_again() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;
    let mut b = relay.join("u2").await?;

    a.close(None).await?;
    drop(a);
    relay.wait_until_gone("u1").await?;

    send_message(&mut b, "u2", "u1", "ping").await?;
    expect_silence(&mut b).await;

    let mut d = relay.join("u1").await?;
    send_message(&mut b, "u2", "u1", "ping").await?;
    assert_eq!(expect_delivery(&mut d).await?, delivery("u2", "ping"));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn abrupt_disconnect_still_cleans_up() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let a = relay.join("u1").await?;

    // Dropping the stream without a close handshake resets the socket.
    drop(a);
    relay.wait_until_gone("u1").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn last_login_wins() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;
    let mut b = relay.join("u1").await?;
    let mut c = relay.join("u2").await?;

    send_message(&mut c, "u2", "u1", "who is there").await?;
    assert_eq!(expect_delivery(&mut b).await?, delivery("u2", "who is there"));
    expect_silence(&mut a).await;

    // The evicted connection closing must not unregister the new owner.
    a.close(None).await?;
    drop(a);
    sleep(QUIET).await;

    send_message(&mut c, "u2", "u1", "still you?").await?;
    assert_eq!(expect_delivery(&mut b).await?, delivery("u2", "still you?"));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_frames_leave_the_connection_open() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;
    let mut b = relay.join("u2").await?;

    a.send(Message::Text("not json".into())).await?;
    a.send(Message::Binary(vec![0xff, 0x00, 0x13])).await?;
    send_json(&mut a, json!({"type": "message", "from": "u1"})).await?;
    send_json(&mut a, json!({"type": "logout", "userId": "u1"})).await?;

    send_message(&mut b, "u2", "u1", "you ok?").await?;
    assert_eq!(expect_delivery(&mut a).await?, delivery("u2", "you ok?"));

    send_message(&mut a, "u1", "u2", "fine").await?;
    assert_eq!(expect_delivery(&mut b).await?, delivery("u1", "fine"));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn binary_json_frames_are_accepted() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut a = relay.join("u1").await?;
    let mut b = relay.join("u2").await?;

    let frame = json!({"type": "message", "from": "u1", "to": "u2", "message": "bytes"});
    a.send(Message::Binary(frame.to_string().into_bytes())).await?;
    assert_eq!(expect_delivery(&mut b).await?, delivery("u1", "bytes"));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn unregistered_connection_can_still_send() -> Result<()> {
    let relay = TestRelay::directed().await?;
    let mut b = relay.join("u2").await?;
    let mut anonymous = relay.connect().await?;

    send_message(&mut anonymous, "ghost", "u2", "boo").await?;
    assert_eq!(expect_delivery(&mut b).await?, delivery("ghost", "boo"));

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn fan_out_policy_ignores_the_recipient() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        policy: RoutingPolicy::FanOut,
        ..RelayConfig::default()
    })
    .await?;

    let mut a = relay.connect().await?;
    let mut b = relay.connect().await?;
    let mut c = relay.connect().await?;
    login(&mut a, "u1").await?;
    login(&mut b, "u2").await?;
    login(&mut c, "u3").await?;
    timeout(WAIT, async {
        while relay.registry.len().await < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    send_message(&mut a, "u1", "u2", "everyone").await?;

    assert_eq!(expect_delivery(&mut b).await?, delivery("u1", "everyone"));
    assert_eq!(expect_delivery(&mut c).await?, delivery("u1", "everyone"));
    expect_silence(&mut a).await;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn idle_connections_are_closed() -> Result<()> {
    let relay = TestRelay::start(RelayConfig {
        idle_timeout: Some(Duration::from_millis(200)),
        ..RelayConfig::default()
    })
    .await?;
    let mut a = relay.join("u1").await?;

    let ended = timeout(WAIT, async {
        loop {
            match a.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "idle connection was never closed");
    relay.wait_until_gone("u1").await?;

    relay.stop().await;
    Ok(())
}
