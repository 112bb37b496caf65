//! UDP broadcast discovery transport.
//!
//! Sends the decoder's probe to the configured target on every interval and
//! hands each reply to the decoder. Uses SO_REUSEADDR/SO_REUSEPORT so it can
//! share the port with other listeners.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::listener::{DiscoveryEvents, DiscoverySource};
use crate::config::DiscoveryConfig;
use crate::error::{ConfigError, DiscoveryError};

/// Receive buffer size; discovery replies are far smaller
const RECV_BUFFER_SIZE: usize = 2048;

/// Pause after a receive error before reading again
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// A decoded discovery reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub id: Option<String>,
}

/// Device-specific discovery payloads.
///
/// The datagram formats belong to the device library; the transport only
/// moves bytes.
pub trait ReplyDecoder: Send + Sync + 'static {
    /// Datagram broadcast on every probe interval; empty means listen only.
    fn probe(&self) -> Vec<u8>;

    /// Decode a reply received from `source`.
    fn decode(&self, payload: &[u8], source: IpAddr) -> Option<DiscoveredDevice>;
}

/// Create a broadcast-capable UDP socket with address reuse.
pub fn create_broadcast_socket(port: u16) -> Result<std::net::UdpSocket, std::io::Error> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    socket.set_broadcast(true)?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;

    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

struct Running {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Discovery source probing over UDP broadcast.
pub struct UdpDiscovery {
    target: SocketAddr,
    bind_port: u16,
    interval: Duration,
    decoder: Arc<dyn ReplyDecoder>,
    running: Mutex<Option<Running>>,
}

impl UdpDiscovery {
    pub fn new(
        target: SocketAddr,
        bind_port: u16,
        interval: Duration,
        decoder: Arc<dyn ReplyDecoder>,
    ) -> Self {
        Self {
            target,
            bind_port,
            interval: interval.max(Duration::from_millis(1)),
            decoder,
            running: Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &DiscoveryConfig,
        decoder: Arc<dyn ReplyDecoder>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.target_addr()?,
            config.bind_port,
            config.probe_interval(),
            decoder,
        ))
    }
}

#[async_trait]
impl DiscoverySource for UdpDiscovery {
    async fn discover(&self, events: DiscoveryEvents) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let std_socket = create_broadcast_socket(self.bind_port).map_err(DiscoveryError::Bind)?;
        let socket = UdpSocket::from_std(std_socket).map_err(DiscoveryError::Bind)?;
        info!(target_addr = %self.target, "PH803W discovery started");

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(probe_loop(
            socket,
            self.target,
            self.interval,
            Arc::clone(&self.decoder),
            events,
            stop_rx,
        ));

        *running = Some(Running { stop, task });
        Ok(())
    }

    async fn stop(&self) -> Result<(), DiscoveryError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let _ = running.stop.send(true);
        let _ = running.task.await;
        debug!("PH803W discovery stopped");
        Ok(())
    }
}

async fn probe_loop(
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    decoder: Arc<dyn ReplyDecoder>,
    events: DiscoveryEvents,
    mut stop: watch::Receiver<bool>,
) {
    let probe = decoder.probe();
    let mut ticker = tokio::time::interval(interval);
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick(), if !probe.is_empty() => {
                if let Err(e) = socket.send_to(&probe, target).await {
                    events.error(format!("probe to {} failed: {}", target, e));
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, addr)) => match decoder.decode(&buf[..len], addr.ip()) {
                    Some(device) => events.device(device.ip, device.id),
                    None => debug!(from = %addr, len, "ignoring undecodable discovery reply"),
                },
                Err(e) => {
                    events.error(format!("receive error: {}", e));
                    if !back_off(&mut stop).await {
                        break;
                    }
                }
            },
        }

        if !events.is_open() {
            break;
        }
    }
}

/// Wait out [`RECEIVE_ERROR_BACKOFF`]; false when stopped meanwhile.
async fn back_off(stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stop.changed() => false,
        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Message;
    use crate::types::{Candidate, CandidateOrigin};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Replies look like `PH803W <id>`; an empty id means none was sent.
    struct TextDecoder;

    impl ReplyDecoder for TextDecoder {
        fn probe(&self) -> Vec<u8> {
            b"PH803W?".to_vec()
        }

        fn decode(&self, payload: &[u8], source: IpAddr) -> Option<DiscoveredDevice> {
            let text = std::str::from_utf8(payload).ok()?;
            let id = text.strip_prefix("PH803W ")?.trim();
            Some(DiscoveredDevice {
                ip: source.to_string(),
                id: (!id.is_empty()).then(|| id.to_string()),
            })
        }
    }

    async fn next_message(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no discovery message")
            .expect("channel closed")
    }

    #[test]
    fn test_text_decoder_rejects_foreign_payloads() {
        let source: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(TextDecoder.decode(b"hello", source), None);
        assert_eq!(
            TextDecoder.decode(b"PH803W ", source),
            Some(DiscoveredDevice {
                ip: "10.0.0.1".to_string(),
                id: None
            })
        );
    }

    #[tokio::test]
    async fn test_broadcast_reply_becomes_candidate() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = device.local_addr().unwrap();

        let discovery = UdpDiscovery::new(
            target,
            0,
            Duration::from_millis(50),
            Arc::new(TextDecoder),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        discovery.discover(DiscoveryEvents::new(tx)).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(5), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"PH803W?");

        device.send_to(b"PH803W CFqpJTSymCE9PLlp1DpbhY", from).await.unwrap();

        match next_message(&mut rx).await {
            Message::Candidate(Candidate { id, ip, origin }) => {
                assert_eq!(id.as_deref(), Some("CFqpJTSymCE9PLlp1DpbhY"));
                assert_eq!(ip, "127.0.0.1");
                assert_eq!(origin, CandidateOrigin::Discovery);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        device.send_to(b"PH803W ", from).await.unwrap();
        match next_message(&mut rx).await {
            Message::Candidate(candidate) => assert_eq!(candidate.id, None),
            other => panic!("unexpected message: {:?}", other),
        }

        discovery.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_back_off_waits_before_next_receive() {
        let (_stop, mut stop_rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        assert!(back_off(&mut stop_rx).await);
        assert!(started.elapsed() >= RECEIVE_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_back_off_ends_early_on_stop() {
        let (stop, mut stop_rx) = watch::channel(false);
        stop.send(true).unwrap();

        let started = tokio::time::Instant::now();
        assert!(!back_off(&mut stop_rx).await);
        assert!(started.elapsed() < RECEIVE_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let discovery = UdpDiscovery::new(
            "127.0.0.1:9".parse().unwrap(),
            0,
            Duration::from_secs(60),
            Arc::new(TextDecoder),
        );
        let (tx, _rx) = mpsc::unbounded_channel();

        discovery.discover(DiscoveryEvents::new(tx.clone())).await.unwrap();
        let err = discovery.discover(DiscoveryEvents::new(tx)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::AlreadyRunning));

        discovery.stop().await.unwrap();
        // Stopping twice is harmless
        discovery.stop().await.unwrap();
    }
}
