use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::core::{DiscoveryConfig, Error, ProtocolVersion, Result};
use crate::crypto;
use crate::protocol::{Message, TuyaCodec};
use super::dispatch::{self, Route};
use super::DeviceInfoSubscriber;

/// Subscriber key matching every device
const WILDCARD: &str = "*";

/// Receive buffer size; broadcasts are a few hundred bytes
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Address and protocol version of a device as announced by its broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip: String,
    pub version: ProtocolVersion,
}

/// Token returned by [`DeviceRegistry::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    key: String,
    id: u64,
}

type Subscribers = Vec<(u64, Arc<dyn DeviceInfoSubscriber>)>;

/// Devices seen on the network, keyed by device id
pub struct DeviceRegistry {
    devices: DashMap<String, DeviceInfo>,
    subscribers: DashMap<String, Subscribers>,
    next_subscription: AtomicU64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            devices: DashMap::new(),
            subscribers: DashMap::new(),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Last known info of a device
    pub fn get(&self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    /// All known devices
    pub fn devices(&self) -> Vec<(String, DeviceInfo)> {
        self.devices
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Records `info` for a device and notifies subscribers if it changed.
    ///
    /// Returns whether the entry changed. Compare and update happen under the
    /// entry lock; subscribers are called after it has been released.
    pub fn update(&self, device_id: &str, info: DeviceInfo) -> bool {
        let changed = match self.devices.entry(device_id.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get() == &info {
                    false
                } else {
                    entry.insert(info.clone());
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(info.clone());
                true
            }
        };

        if changed {
            info!("{}: Discovered at {} (protocol {})", device_id, info.ip, info.version);
            self.notify(device_id, &info);
        } else {
            trace!("{}: Broadcast unchanged", device_id);
        }
        changed
    }

    /// Registers a subscriber for one device, or for all devices with `None`.
    ///
    /// Known devices matching the subscription are reported immediately.
    pub fn subscribe(
        &self,
        device_id: Option<&str>,
        subscriber: Arc<dyn DeviceInfoSubscriber>,
    ) -> SubscriptionId {
        let key = device_id.unwrap_or(WILDCARD).to_string();
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(key.clone())
            .or_default()
            .push((id, subscriber.clone()));

        match device_id {
            Some(device_id) => {
                if let Some(info) = self.get(device_id) {
                    subscriber.on_device_info_changed(device_id, &info);
                }
            }
            None => {
                for (device_id, info) in self.devices() {
                    subscriber.on_device_info_changed(&device_id, &info);
                }
            }
        }

        SubscriptionId { key, id }
    }

    /// Removes a subscriber. Returns whether it was registered.
    pub fn unsubscribe(&self, subscription: &SubscriptionId) -> bool {
        let Some(mut subscribers) = self.subscribers.get_mut(&subscription.key) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription.id);
        let removed = subscribers.len() != before;
        let empty = subscribers.is_empty();
        drop(subscribers);

        if empty {
            self.subscribers.remove_if(&subscription.key, |_, list| list.is_empty());
        }
        removed
    }

    fn notify(&self, device_id: &str, info: &DeviceInfo) {
        let mut targets: Vec<Arc<dyn DeviceInfoSubscriber>> = Vec::new();
        for key in [device_id, WILDCARD] {
            if let Some(list) = self.subscribers.get(key) {
                targets.extend(list.iter().map(|(_, subscriber)| subscriber.clone()));
            }
        }
        for subscriber in targets {
            subscriber.on_device_info_changed(device_id, info);
        }
    }

    /// Applies a decoded message. Returns whether the registry changed.
    pub fn handle_message(&self, message: Message) -> bool {
        let Route::Discovery(broadcast) = dispatch::route(message) else {
            return false;
        };

        match broadcast.version.parse::<ProtocolVersion>() {
            Ok(version) => self.update(
                &broadcast.gw_id,
                DeviceInfo {
                    ip: broadcast.ip,
                    version,
                },
            ),
            Err(_) => {
                debug!(
                    "{}: Ignoring broadcast with unsupported version '{}'",
                    broadcast.gw_id, broadcast.version
                );
                false
            }
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Listens for device broadcasts on the plaintext and encrypted ports
pub struct DiscoveryListener {
    registry: Arc<DeviceRegistry>,
    plain: UdpSocket,
    encrypted: UdpSocket,
}

impl DiscoveryListener {
    /// Binds both broadcast sockets. Must be called from within a tokio runtime.
    pub async fn bind(config: &DiscoveryConfig, registry: Arc<DeviceRegistry>) -> Result<Self> {
        let plain = create_broadcast_socket(config.bind_addr, config.port)?;
        let encrypted = create_broadcast_socket(config.bind_addr, config.encrypted_port)?;
        Ok(DiscoveryListener {
            registry,
            plain: UdpSocket::from_std(plain.into())?,
            encrypted: UdpSocket::from_std(encrypted.into())?,
        })
    }

    /// Registry updated by this listener
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Local addresses of the plaintext and the encrypted socket
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((self.plain.local_addr()?, self.encrypted.local_addr()?))
    }

    /// Receives broadcasts until the task is cancelled
    pub async fn run(self) -> Result<()> {
        let (plain_addr, encrypted_addr) = self.local_addrs()?;
        info!("Listening for device broadcasts on {} and {}", plain_addr, encrypted_addr);

        let mut plain_codec = discovery_codec();
        let mut encrypted_codec = discovery_codec();
        let mut plain_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut encrypted_buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                received = self.plain.recv_from(&mut plain_buf) => match received {
                    Ok((size, source)) => {
                        handle_datagram(&self.registry, &mut plain_codec, &plain_buf[..size], source);
                    }
                    Err(e) => warn!("Failed to receive broadcast: {}", e),
                },

                received = self.encrypted.recv_from(&mut encrypted_buf) => match received {
                    Ok((size, source)) => {
                        handle_datagram(&self.registry, &mut encrypted_codec, &encrypted_buf[..size], source);
                    }
                    Err(e) => warn!("Failed to receive broadcast: {}", e),
                },
            }
        }
    }
}

/// Broadcasts are framed like protocol 3.1 and encrypted with a fixed key
fn discovery_codec() -> TuyaCodec {
    TuyaCodec::new("udp", crypto::discovery_key(), ProtocolVersion::V3_1)
}

/// Decodes every frame in a datagram. Returns the number of registry changes.
fn handle_datagram(
    registry: &DeviceRegistry,
    codec: &mut TuyaCodec,
    data: &[u8],
    source: SocketAddr,
) -> usize {
    trace!("Received {} byte broadcast from {}", data.len(), source);
    let mut buf = BytesMut::from(data);
    let mut changes = 0;
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(message)) => {
                if registry.handle_message(message) {
                    changes += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Discarding broadcast from {}: {}", source, e);
                break;
            }
        }
    }
    changes
}

/// Creates a UDP socket suitable for receiving broadcasts
fn create_broadcast_socket(bind_addr: Ipv4Addr, port: u16) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::network(format!("Failed to create socket: {}", e)))?;

    // other Tuya integrations on the same host listen on these ports too
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::network(e.to_string()))?;

    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::network(e.to_string()))?;

    socket
        .set_broadcast(true)
        .map_err(|e| Error::network(e.to_string()))?;

    let addr = SocketAddrV4::new(bind_addr, port);
    socket
        .bind(&addr.into())
        .map_err(|e| Error::network(format!("Failed to bind to port {}: {}", port, e)))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| Error::network(e.to_string()))?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::BufMut;

    use crate::protocol::{PREFIX, SUFFIX};

    #[derive(Default)]
    struct RecordingSubscriber {
        seen: Mutex<Vec<(String, DeviceInfo)>>,
    }

    impl RecordingSubscriber {
        fn seen(&self) -> Vec<(String, DeviceInfo)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl DeviceInfoSubscriber for RecordingSubscriber {
        fn on_device_info_changed(&self, device_id: &str, info: &DeviceInfo) {
            self.seen.lock().unwrap().push((device_id.to_string(), info.clone()));
        }
    }

    fn info(ip: &str, version: ProtocolVersion) -> DeviceInfo {
        DeviceInfo { ip: ip.to_string(), version }
    }

    /// Broadcast frame with return code, as sent by devices
    fn broadcast_frame(code: u32, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32(PREFIX);
        buf.put_u32(0);
        buf.put_u32(code);
        buf.put_u32((body.len() + 12) as u32);
        buf.put_u32(0);
        buf.extend_from_slice(body);
        let crc = crypto::crc32(&buf);
        buf.put_u32(crc);
        buf.put_u32(SUFFIX);
        buf.to_vec()
    }

    fn source() -> SocketAddr {
        "192.168.1.50:6666".parse().unwrap()
    }

    #[test]
    fn test_update_is_idempotent() {
        let registry = DeviceRegistry::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        registry.subscribe(None, subscriber.clone());

        assert!(registry.update("bf01", info("10.0.0.1", ProtocolVersion::V3_3)));
        assert!(!registry.update("bf01", info("10.0.0.1", ProtocolVersion::V3_3)));
        assert_eq!(subscriber.seen().len(), 1);

        // changed address
        assert!(registry.update("bf01", info("10.0.0.2", ProtocolVersion::V3_3)));
        // changed version
        assert!(registry.update("bf01", info("10.0.0.2", ProtocolVersion::V3_4)));
        assert_eq!(subscriber.seen().len(), 3);
        assert_eq!(registry.get("bf01"), Some(info("10.0.0.2", ProtocolVersion::V3_4)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_per_device_subscription() {
        let registry = DeviceRegistry::new();
        let subscriber = Arc::new(RecordingSubscriber::default());
        let subscription = registry.subscribe(Some("bf02"), subscriber.clone());

        registry.update("bf01", info("10.0.0.1", ProtocolVersion::V3_3));
        registry.update("bf02", info("10.0.0.2", ProtocolVersion::V3_1));
        assert_eq!(subscriber.seen(), vec![("bf02".to_string(), info("10.0.0.2", ProtocolVersion::V3_1))]);

        assert!(registry.unsubscribe(&subscription));
        assert!(!registry.unsubscribe(&subscription));
        registry.update("bf02", info("10.0.0.3", ProtocolVersion::V3_1));
        assert_eq!(subscriber.seen().len(), 1);
    }

    #[test]
    fn test_subscribe_replays_known_info() {
        let registry = DeviceRegistry::new();
        registry.update("bf01", info("10.0.0.1", ProtocolVersion::V3_3));
        registry.update("bf02", info("10.0.0.2", ProtocolVersion::V3_4));

        let single = Arc::new(RecordingSubscriber::default());
        registry.subscribe(Some("bf02"), single.clone());
        assert_eq!(single.seen(), vec![("bf02".to_string(), info("10.0.0.2", ProtocolVersion::V3_4))]);

        let all = Arc::new(RecordingSubscriber::default());
        registry.subscribe(None, all.clone());
        assert_eq!(all.seen().len(), 2);

        let unknown = Arc::new(RecordingSubscriber::default());
        registry.subscribe(Some("bf99"), unknown.clone());
        assert!(unknown.seen().is_empty());
    }

    #[test]
    fn test_concurrent_updates_notify_once() {
        let registry = Arc::new(DeviceRegistry::new());
        let subscriber = Arc::new(RecordingSubscriber::default());
        registry.subscribe(Some("bf01"), subscriber.clone());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.update("bf01", info("10.0.0.1", ProtocolVersion::V3_3)))
            })
            .collect();
        let changed = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|changed| *changed)
            .count();
        assert_eq!(changed, 1);
        assert_eq!(subscriber.seen().len(), 1);
    }

    #[test]
    fn test_plaintext_broadcast() {
        let registry = DeviceRegistry::new();
        let mut codec = discovery_codec();
        let frame = broadcast_frame(
            0x00,
            br#"{"ip":"192.168.1.50","gwId":"bf50","active":2,"ability":0,"mode":0,"encrypt":true,"productKey":"key123","version":"3.3"}"#,
        );

        assert_eq!(handle_datagram(&registry, &mut codec, &frame, source()), 1);
        assert_eq!(registry.get("bf50"), Some(info("192.168.1.50", ProtocolVersion::V3_3)));
        // repeated broadcast changes nothing
        assert_eq!(handle_datagram(&registry, &mut codec, &frame, source()), 0);
    }

    #[test]
    fn test_encrypted_broadcast() {
        let registry = DeviceRegistry::new();
        let mut codec = discovery_codec();
        let encrypted = crypto::encrypt_aes_ecb(
            br#"{"ip":"192.168.1.51","gwId":"bf51","version":"3.4"}"#,
            &crypto::discovery_key(),
            true,
        )
        .unwrap();

        let frame = broadcast_frame(0x13, &encrypted);
        assert_eq!(handle_datagram(&registry, &mut codec, &frame, source()), 1);
        assert_eq!(registry.get("bf51"), Some(info("192.168.1.51", ProtocolVersion::V3_4)));
    }

    #[test]
    fn test_invalid_broadcasts_ignored() {
        let registry = DeviceRegistry::new();
        let mut codec = discovery_codec();

        let unsupported = broadcast_frame(0x00, br#"{"ip":"192.168.1.52","gwId":"bf52","version":"3.5"}"#);
        assert_eq!(handle_datagram(&registry, &mut codec, &unsupported, source()), 0);

        let mut corrupted = broadcast_frame(0x00, br#"{"ip":"192.168.1.53","gwId":"bf53","version":"3.3"}"#);
        corrupted[20] ^= 0x01;
        assert_eq!(handle_datagram(&registry, &mut codec, &corrupted, source()), 0);

        assert_eq!(handle_datagram(&registry, &mut codec, b"garbage", source()), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_listener_receives_broadcast() {
        crate::util::init_test_logging();
        let config = DiscoveryConfig {
            bind_addr: Ipv4Addr::LOCALHOST,
            port: 0,
            encrypted_port: 0,
        };
        let registry = Arc::new(DeviceRegistry::new());
        let listener = DiscoveryListener::bind(&config, registry.clone()).await.unwrap();
        let (_, encrypted_addr) = listener.local_addrs().unwrap();
        let task = tokio::spawn(listener.run());

        let encrypted = crypto::encrypt_aes_ecb(
            br#"{"ip":"127.0.0.1","gwId":"bf60","version":"3.3"}"#,
            &crypto::discovery_key(),
            true,
        )
        .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&broadcast_frame(0x13, &encrypted), encrypted_addr)
            .await
            .unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get("bf60").is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(found.is_ok());
        assert_eq!(registry.get("bf60").unwrap().version, ProtocolVersion::V3_3);

        task.abort();
    }
}
