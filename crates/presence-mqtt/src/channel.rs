//! Publish channel: one owned MQTT session with explicit connection state.
//!
//! A background task drives the MQTT event loop (handshake, keepalive,
//! reconnects) and posts state transitions onto a single-slot watch signal.
//! `connect()` waits on that signal with a timeout; `publish()` only reads it.

use crate::params::ConnectionParams;
use presence_core::actuator::{PAYLOAD_ABSENT, PAYLOAD_PRESENT};
use crate::Publisher;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet, QoS,
};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Outbound requests buffered between `publish()` and the event loop.
const REQUEST_CAPACITY: usize = 64;
/// Pause before the event loop retries after a failed or dropped connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// How long `close()` lets the event loop flush the DISCONNECT packet.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("topic must not be empty")]
    EmptyTopic,
    #[error("invalid client id {0:?}: must be non-empty and not start with a space")]
    InvalidClientId(String),
    #[error("keepalive must be zero or at least one second, got {0:?}")]
    InvalidKeepalive(Duration),
    #[error("failed to read CA certificate {path}: {source}")]
    CaCert { path: String, source: std::io::Error },
    #[error("connection not acknowledged within {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect() already called on this channel")]
    AlreadyStarted,
    #[error("not connected to the broker")]
    NotConnected,
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("payload must be \"1\" or \"0\", got {0:?}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state shared between the channel and its event loop task.
#[derive(Debug)]
pub struct ConnectionSignal {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "mqtt connection state");
        }
    }

    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Broker answered our CONNECT.
    pub fn on_connect(&self, code: ConnectReturnCode) {
        if code == ConnectReturnCode::Success {
            tracing::info!("mqtt connected");
            self.set(ConnectionState::Connected);
        } else {
            tracing::warn!(?code, "mqtt connection refused");
            self.set(ConnectionState::Disconnected);
        }
    }

    /// Session ended. `cause` is `None` for a disconnect we asked for.
    pub fn on_disconnect(&self, cause: Option<&str>) {
        match cause {
            Some(cause) => tracing::warn!(cause, "mqtt disconnected unexpectedly"),
            None => tracing::info!("mqtt disconnected"),
        }
        self.set(ConnectionState::Disconnected);
    }
}

/// An explicitly owned MQTT publishing session on one topic.
pub struct PublishChannel {
    params: ConnectionParams,
    topic: String,
    ca_cert: Option<Vec<u8>>,
    signal: Arc<ConnectionSignal>,
    client: OnceLock<AsyncClient>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PublishChannel {
    /// Validate settings and read the CA bundle. Does not touch the network.
    pub fn new(params: ConnectionParams, topic: impl Into<String>) -> Result<Self, ChannelError> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ChannelError::EmptyTopic);
        }
        if params.client_id.is_empty() || params.client_id.starts_with(' ') {
            return Err(ChannelError::InvalidClientId(params.client_id));
        }
        if !params.keepalive.is_zero() && params.keepalive < Duration::from_secs(1) {
            return Err(ChannelError::InvalidKeepalive(params.keepalive));
        }

        let ca_cert = match (&params.ca_cert, params.use_tls) {
            (Some(path), true) => Some(std::fs::read(path).map_err(|source| ChannelError::CaCert {
                path: path.display().to_string(),
                source,
            })?),
            _ => None,
        };

        Ok(Self {
            params,
            topic,
            ca_cert,
            signal: Arc::new(ConnectionSignal::new()),
            client: OnceLock::new(),
            task: Mutex::new(None),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        self.signal.get()
    }

    /// Open the session and wait for the broker's acknowledgement.
    ///
    /// Fails with [`ChannelError::ConnectTimeout`] if no CONNACK arrives
    /// within `connect_timeout`; the background task is stopped and the
    /// state is back to `Disconnected`. Callable once per channel.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        if self.client.get().is_some() {
            return Err(ChannelError::AlreadyStarted);
        }
        let (client, eventloop) = AsyncClient::new(self.params.mqtt_options(self.ca_cert.as_deref()), REQUEST_CAPACITY);
        if self.client.set(client).is_err() {
            return Err(ChannelError::AlreadyStarted);
        }

        tracing::info!(
            host = %self.params.host,
            port = self.params.port,
            tls = self.params.use_tls,
            client_id = %self.params.client_id,
            "connecting to mqtt broker"
        );

        let mut state_rx = self.signal.subscribe();
        self.signal.set(ConnectionState::Connecting);
        let handle = tokio::spawn(run_event_loop(eventloop, Arc::clone(&self.signal)));
        *self.task.lock().await = Some(handle);

        let timeout = self.params.connect_timeout;
        let acknowledged = matches!(
            tokio::time::timeout(timeout, state_rx.wait_for(|s| *s == ConnectionState::Connected)).await,
            Ok(Ok(_))
        );

        if acknowledged {
            return Ok(());
        }

        let task = self.task.lock().await.take();
        if let Some(handle) = task {
            handle.abort();
            // A CONNACK already being handled must not land after the reset below.
            let _ = handle.await;
        }
        self.signal.set(ConnectionState::Disconnected);
        Err(ChannelError::ConnectTimeout(timeout))
    }

    /// Submit one presence payload (`"1"` or `"0"`). Never reconnects or
    /// queues while disconnected.
    pub fn publish(&self, payload: &str, qos: QoS, retain: bool) -> Result<(), ChannelError> {
        if payload != PAYLOAD_PRESENT && payload != PAYLOAD_ABSENT {
            return Err(ChannelError::InvalidPayload(payload.to_string()));
        }
        if self.signal.get() != ConnectionState::Connected {
            return Err(ChannelError::NotConnected);
        }
        let client = self.client.get().ok_or(ChannelError::NotConnected)?;
        client
            .try_publish(self.topic.as_str(), qos, retain, payload.as_bytes().to_vec())
            .map_err(|e| ChannelError::Rejected(e.to_string()))
    }

    /// Disconnect and stop the event loop. No-op if no session is running.
    pub async fn close(&self) {
        let Some(mut handle) = self.task.lock().await.take() else {
            return;
        };

        let mut finished = false;
        if self.signal.get() == ConnectionState::Connected {
            if let Some(client) = self.client.get() {
                if let Err(e) = client.try_disconnect() {
                    tracing::warn!(error = %e, "mqtt disconnect request failed");
                }
            }
            finished = tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_ok();
            if !finished {
                tracing::debug!("mqtt event loop did not stop in time; aborting");
            }
        }

        if !finished {
            handle.abort();
            let _ = handle.await;
        }
        self.signal.set(ConnectionState::Disconnected);
    }
}

impl Publisher for PublishChannel {
    fn publish(&self, payload: &str, qos: QoS, retain: bool) -> Result<(), ChannelError> {
        PublishChannel::publish(self, payload, qos, retain)
    }
}

impl Drop for PublishChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Drive the MQTT session until our own DISCONNECT goes out.
///
/// Errors are reported as disconnects; the next `poll()` reconnects.
async fn run_event_loop(mut eventloop: EventLoop, signal: Arc<ConnectionSignal>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => signal.on_connect(ack.code),
            Ok(Event::Incoming(Packet::Disconnect)) => signal.on_disconnect(Some("broker sent DISCONNECT")),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                signal.on_disconnect(None);
                break;
            }
            Ok(event) => tracing::trace!(?event, "mqtt event"),
            Err(ConnectionError::ConnectionRefused(code)) => {
                signal.on_connect(code);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            Err(e) => {
                signal.on_disconnect(Some(e.to_string().as_str()));
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// CONNACK, session not present, return code 0.
    const CONNACK_OK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    fn params(port: u16, timeout: Duration) -> ConnectionParams {
        let mut p = ConnectionParams::new("127.0.0.1", port);
        p.client_id = "presence-test".into();
        p.connect_timeout = timeout;
        p
    }

    /// Accepts one connection and optionally acknowledges CONNECT, then
    /// swallows everything the client sends.
    async fn fake_broker(ack: bool) -> u16 {
        fake_broker_after(ack.then_some(Duration::ZERO)).await
    }

    /// Like [`fake_broker`], but the CONNACK (if any) is sent after `ack_delay`.
    async fn fake_broker_after(ack_delay: Option<Duration>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let mut buf = [0u8; 1024];
            if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                return;
            }
            if let Some(delay) = ack_delay {
                tokio::time::sleep(delay).await;
                let _ = socket.write_all(&CONNACK_OK).await;
            }
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });
        port
    }

    #[test]
    fn test_new_rejects_empty_topic() {
        let err = PublishChannel::new(params(1883, DEFAULT_TIMEOUT), "").err().unwrap();
        assert!(matches!(err, ChannelError::EmptyTopic));
    }

    #[test]
    fn test_new_rejects_bad_client_id() {
        let mut p = params(1883, DEFAULT_TIMEOUT);
        p.client_id = " spaced".into();
        assert!(matches!(PublishChannel::new(p, "t"), Err(ChannelError::InvalidClientId(_))));
    }

    #[test]
    fn test_new_missing_ca_cert() {
        let mut p = params(8883, DEFAULT_TIMEOUT);
        p.use_tls = true;
        p.ca_cert = Some("/nonexistent/ca.pem".into());
        assert!(matches!(PublishChannel::new(p, "t"), Err(ChannelError::CaCert { .. })));
    }

    #[test]
    fn test_publish_before_connect_fails() {
        let channel = PublishChannel::new(params(1883, DEFAULT_TIMEOUT), "presence").unwrap();
        assert!(matches!(channel.publish("1", QoS::AtLeastOnce, false), Err(ChannelError::NotConnected)));
        assert!(channel.client.get().is_none(), "no client, so nothing was written");
    }

    #[tokio::test]
    async fn test_close_without_connect_is_noop() {
        let channel = PublishChannel::new(params(1883, DEFAULT_TIMEOUT), "presence").unwrap();
        channel.close().await;
        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(matches!(channel.publish("0", QoS::AtLeastOnce, false), Err(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_connack() {
        let port = fake_broker(false).await;
        let channel = PublishChannel::new(params(port, Duration::from_millis(300)), "presence").unwrap();

        let started = std::time::Instant::now();
        let err = channel.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(matches!(channel.publish("1", QoS::AtLeastOnce, false), Err(ChannelError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_publish_close() {
        let port = fake_broker(true).await;
        let channel = PublishChannel::new(params(port, Duration::from_secs(5)), "presence").unwrap();

        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ConnectionState::Connected);
        channel.publish("1", QoS::AtMostOnce, false).unwrap();

        assert!(matches!(channel.connect().await, Err(ChannelError::AlreadyStarted)));

        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(matches!(channel.publish("0", QoS::AtMostOnce, false), Err(ChannelError::NotConnected)));

        // Idempotent.
        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_publish_only_presence_payloads() {
        let port = fake_broker(true).await;
        let channel = PublishChannel::new(params(port, DEFAULT_TIMEOUT), "presence").unwrap();
        channel.connect().await.unwrap();

        for payload in ["toggle", "10", "", " 1", "on"] {
            assert!(
                matches!(channel.publish(payload, QoS::AtMostOnce, false), Err(ChannelError::InvalidPayload(_))),
                "{payload:?} was accepted"
            );
        }
        channel.publish("1", QoS::AtMostOnce, false).unwrap();
        channel.publish("0", QoS::AtMostOnce, false).unwrap();
        channel.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_connack_after_timeout_is_ignored() {
        let port = fake_broker_after(Some(Duration::from_millis(400))).await;
        let channel = PublishChannel::new(params(port, Duration::from_millis(150)), "presence").unwrap();

        assert!(matches!(channel.connect().await, Err(ChannelError::ConnectTimeout(_))));
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(matches!(channel.publish("1", QoS::AtLeastOnce, false), Err(ChannelError::NotConnected)));
    }

    #[test]
    fn test_publish_rejected_when_session_gone() {
        let channel = PublishChannel::new(params(1883, DEFAULT_TIMEOUT), "presence").unwrap();
        let (client, eventloop) = AsyncClient::new(channel.params.mqtt_options(None), 1);
        drop(eventloop);
        assert!(channel.client.set(client).is_ok());
        channel.signal.set(ConnectionState::Connected);

        let err = channel.publish("1", QoS::AtLeastOnce, false).unwrap_err();
        assert!(matches!(err, ChannelError::Rejected(_)));
    }

    #[test]
    fn test_on_connect_transitions() {
        let signal = ConnectionSignal::new();
        signal.on_connect(ConnectReturnCode::Success);
        assert_eq!(signal.get(), ConnectionState::Connected);
        signal.on_connect(ConnectReturnCode::NotAuthorized);
        assert_eq!(signal.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_on_disconnect_always_clears() {
        let signal = ConnectionSignal::new();
        signal.on_connect(ConnectReturnCode::Success);
        signal.on_disconnect(Some("connection reset"));
        assert_eq!(signal.get(), ConnectionState::Disconnected);
        signal.on_connect(ConnectReturnCode::Success);
        signal.on_disconnect(None);
        assert_eq!(signal.get(), ConnectionState::Disconnected);
    }
}
