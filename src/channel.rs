//! Duplex channel abstraction under the transport handler.
//!
//! The handler only sees [`Channel`]: open the connection, write encoded
//! packets, read decoded packets, close. [`TlsChannel`] is the production
//! implementation over TCP + TLS with the MQTT CONNECT handshake folded into
//! `open`; tests substitute a scripted channel through [`ChannelFactory`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::*;
use mqtt::Encodable;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_native_tls::{TlsConnector, TlsStream};

use crate::settings::TransportSettings;
use crate::IoTHubError;

/// Credentials presented in the MQTT CONNECT packet.
#[derive(Clone)]
pub struct ConnectAuth {
    /// MQTT client identifier
    pub client_id: String,
    /// CONNECT user name
    pub user_name: String,
    /// CONNECT password (SAS token)
    pub password: String,
}

impl std::fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAuth")
            .field("client_id", &self.client_id)
            .field("user_name", &self.user_name)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single duplex connection carrying MQTT packets.
///
/// Implementations own the framing codec: callers hand over decoded packets
/// and receive decoded packets back. Writes and reads after `close` fail with
/// a closed-channel fault instead of blocking.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Establish the connection, or fail with a network-category fault
    async fn open(&self) -> crate::Result<()>;

    /// Encode and send one packet, resolving once flushed
    async fn write_and_flush(&self, packet: VariablePacket) -> crate::Result<()>;

    /// Await the next decoded inbound packet
    async fn read_packet(&self) -> crate::Result<VariablePacket>;

    /// Tear down the connection; safe to call repeatedly
    async fn close(&self) -> crate::Result<()>;

    /// Whether `open` completed and `close` has not been called
    fn is_open(&self) -> bool;
}

/// Creates the channel for a connection attempt. Substituted in tests so the
/// handler state machine runs against a scripted channel instead of a socket.
pub type ChannelFactory =
    Arc<dyn Fn(&TransportSettings, ConnectAuth) -> Arc<dyn Channel> + Send + Sync>;

/// The production factory: TLS over TCP to the hub's MQTT endpoint.
pub fn tls_channel_factory() -> ChannelFactory {
    Arc::new(|settings, auth| Arc::new(TlsChannel::new(settings.clone(), auth)))
}

type Socket = TlsStream<TcpStream>;

/// TLS channel speaking MQTT to the IoT hub.
#[derive(Debug)]
pub struct TlsChannel {
    settings: TransportSettings,
    auth: ConnectAuth,
    write_half: Mutex<Option<WriteHalf<Socket>>>,
    read_half: Mutex<Option<ReadHalf<Socket>>>,
    open: AtomicBool,
}

impl TlsChannel {
    /// Channel for the given connection; no I/O happens until `open`
    pub fn new(settings: TransportSettings, auth: ConnectAuth) -> Self {
        Self {
            settings,
            auth,
            write_half: Mutex::new(None),
            read_half: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    async fn tcp_connect(&self) -> crate::Result<Socket> {
        let socket =
            TcpStream::connect((self.settings.hostname.as_str(), self.settings.port)).await?;

        trace!("Connected to tcp socket {:?}", socket);

        let cx = TlsConnector::from(
            native_tls::TlsConnector::builder()
                .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
                .build()?,
        );

        let socket = cx.connect(&self.settings.hostname, socket).await?;

        trace!("Connected tls context {:?}", socket);

        Ok(socket)
    }

    async fn mqtt_connect(&self) -> crate::Result<Socket> {
        let mut socket = self.tcp_connect().await?;

        let mut conn = ConnectPacket::new(&self.auth.client_id);
        conn.set_client_identifier(&self.auth.client_id);
        conn.set_clean_session(self.settings.clean_session);
        conn.set_keep_alive(self.settings.keep_alive);
        conn.set_user_name(Some(self.auth.user_name.clone()));
        conn.set_password(Some(self.auth.password.clone()));

        let mut buf = Vec::new();
        conn.encode(&mut buf)
            .map_err(|e| IoTHubError::Protocol(e.to_string()))?;
        socket.write_all(&buf[..]).await?;

        let packet = VariablePacket::parse(&mut socket).await;

        trace!("PACKET {:?}", packet);
        match packet {
            Ok(VariablePacket::ConnackPacket(connack)) => {
                if connack.connect_return_code() != ConnectReturnCode::ConnectionAccepted {
                    Err(IoTHubError::Communication(format!(
                        "failed to connect to server, return code {:?}",
                        connack.connect_return_code()
                    )))
                } else {
                    Ok(())
                }
            }
            Ok(pck) => Err(IoTHubError::Protocol(format!(
                "unexpected packet received after connect {:?}",
                pck
            ))),
            Err(err) => Err(IoTHubError::Protocol(format!(
                "error decoding connack packet {:?}",
                err
            ))),
        }?;

        Ok(socket)
    }
}

#[async_trait]
impl Channel for TlsChannel {
    async fn open(&self) -> crate::Result<()> {
        let socket = self.mqtt_connect().await?;
        let (read_half, write_half) = tokio::io::split(socket);
        *self.read_half.lock().await = Some(read_half);
        *self.write_half.lock().await = Some(write_half);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write_and_flush(&self, packet: VariablePacket) -> crate::Result<()> {
        let mut buf = Vec::new();
        packet
            .encode(&mut buf)
            .map_err(|e| IoTHubError::Protocol(e.to_string()))?;

        let mut guard = self.write_half.lock().await;
        let socket = guard
            .as_mut()
            .ok_or_else(|| IoTHubError::TransportClosed("channel is closed".to_string()))?;
        socket.write_all(&buf[..]).await?;
        socket.flush().await?;
        Ok(())
    }

    async fn read_packet(&self) -> crate::Result<VariablePacket> {
        let mut guard = self.read_half.lock().await;
        let socket = guard
            .as_mut()
            .ok_or_else(|| IoTHubError::TransportClosed("channel is closed".to_string()))?;
        VariablePacket::parse(socket)
            .await
            .map_err(|e| IoTHubError::Protocol(format!("error decoding packet {:?}", e)))
    }

    async fn close(&self) -> crate::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut socket) = self.write_half.lock().await.take() {
            // Socket may already be gone; close stays idempotent either way
            let _ = socket.shutdown().await;
        }
        self.read_half.lock().await.take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mqtt::packet::suback::SubscribeReturnCode;
    use mqtt::TopicName;
    use tokio::sync::mpsc;

    /// Scripted channel: records written packets, echoes broker acks for
    /// subscribe/unsubscribe frames, and lets tests inject inbound traffic
    /// or read errors.
    pub(crate) struct FakeChannel {
        fail_open: bool,
        open: AtomicBool,
        writes: std::sync::Mutex<Vec<VariablePacket>>,
        inject_tx: mpsc::UnboundedSender<crate::Result<VariablePacket>>,
        inbound: Mutex<mpsc::UnboundedReceiver<crate::Result<VariablePacket>>>,
    }

    impl FakeChannel {
        pub(crate) fn new() -> Arc<Self> {
            Self::build(false)
        }

        pub(crate) fn failing_open() -> Arc<Self> {
            Self::build(true)
        }

        fn build(fail_open: bool) -> Arc<Self> {
            let (inject_tx, inbound) = mpsc::unbounded_channel();
            Arc::new(Self {
                fail_open,
                open: AtomicBool::new(false),
                writes: std::sync::Mutex::new(Vec::new()),
                inject_tx,
                inbound: Mutex::new(inbound),
            })
        }

        pub(crate) fn written(&self) -> std::sync::MutexGuard<'_, Vec<VariablePacket>> {
            self.writes.lock().unwrap()
        }

        pub(crate) fn inject(&self, item: crate::Result<VariablePacket>) {
            let _ = self.inject_tx.send(item);
        }

        pub(crate) fn inject_twin_response(&self, status: i32, request_id: &str, body: Vec<u8>) {
            let topic =
                TopicName::new(format!("$iothub/twin/res/{}/?$rid={}", status, request_id))
                    .unwrap();
            self.inject(Ok(VariablePacket::PublishPacket(PublishPacket::new(
                topic,
                QoSWithPacketIdentifier::Level0,
                body,
            ))));
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        async fn open(&self) -> crate::Result<()> {
            if self.fail_open {
                return Err(IoTHubError::Communication("connection refused".to_string()));
            }
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn write_and_flush(&self, packet: VariablePacket) -> crate::Result<()> {
            if !self.is_open() {
                return Err(IoTHubError::TransportClosed("channel is closed".to_string()));
            }
            match &packet {
                VariablePacket::SubscribePacket(subscribe) => {
                    let ack = SubackPacket::new(
                        subscribe.packet_identifier(),
                        vec![SubscribeReturnCode::MaximumQoSLevel0],
                    );
                    self.inject(Ok(VariablePacket::SubackPacket(ack)));
                }
                VariablePacket::UnsubscribePacket(unsubscribe) => {
                    let ack = UnsubackPacket::new(unsubscribe.packet_identifier());
                    self.inject(Ok(VariablePacket::UnsubackPacket(ack)));
                }
                _ => {}
            }
            self.writes.lock().unwrap().push(packet);
            Ok(())
        }

        async fn read_packet(&self) -> crate::Result<VariablePacket> {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(item) => item,
                None => Err(IoTHubError::TransportClosed("channel is closed".to_string())),
            }
        }

        async fn close(&self) -> crate::Result<()> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }
}
