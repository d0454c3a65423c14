//! The packet forwarding engine.
//!
//! Two pumps meet here. The device pump reads raw IP packets from the TUN
//! device, filters the blacklist, resolves the destination in the peer
//! table, encrypts under that peer's session key and hands the ciphertext to
//! the connection's writer. The tunnel side runs per inbound frame: decrypt,
//! parse, then either relay to another peer of the virtual subnet (server
//! only) or write the plaintext to the TUN device.
//!
//! Per-packet failures are dropped, counted and logged at debug; only
//! transport-level errors propagate.

use crate::auth::{Authenticator, UserCredential};
use crate::channel::{AuthGrant, PacketRouter, PeerHandle};
use crate::crypto::PacketCipher;
use crate::device::TunReader;
use crate::error::VpnResult;
use crate::packet::{self, PacketHeader};
use crate::peers::{PeerRecord, PeerTable};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Per-packet drop and relay counters.
#[derive(Default)]
pub struct Counters {
    /// Frames with no parseable IP header.
    pub parse_drops: AtomicU64,
    /// Frames whose destination is blacklisted.
    pub blacklist_drops: AtomicU64,
    /// Frames with no live peer for the destination.
    pub peer_miss_drops: AtomicU64,
    /// Frames that failed to seal or open.
    pub crypto_drops: AtomicU64,
    /// Frames relayed peer-to-peer on the server.
    pub relayed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The forwarding engine. Shared by the device pump and every tunnel
/// connection; the peer table is the only mutable state and is internally
/// locked.
pub struct Engine {
    peers: PeerTable,
    auth: Authenticator,
    blacklist: HashSet<Ipv4Addr>,
    local_net: Ipv4Net,
    is_server: bool,
    dev_tx: mpsc::Sender<Vec<u8>>,
    counters: Counters,
    /// Client reconnect counter, reset to zero on every successful tunnel
    /// write. Absent on the server.
    reconnects: Option<Arc<AtomicU32>>,
}

impl Engine {
    pub fn new(
        is_server: bool,
        local_net: Ipv4Net,
        blacklist: impl IntoIterator<Item = Ipv4Addr>,
        users: &[UserCredential],
        dev_tx: mpsc::Sender<Vec<u8>>,
        reconnects: Option<Arc<AtomicU32>>,
    ) -> Self {
        Self {
            peers: PeerTable::new(),
            auth: Authenticator::new(users),
            blacklist: blacklist.into_iter().collect(),
            local_net,
            is_server,
            dev_tx,
            counters: Counters::default(),
            reconnects,
        }
    }

    /// The peer table.
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Drop and relay counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The device pump: read packets off the TUN device and forward them
    /// into the tunnel until the device goes away. Read errors are logged
    /// and the pump keeps going; closing the device unblocks it for
    /// shutdown.
    pub async fn device_pump(&self, mut reader: TunReader) {
        let mut buf = vec![0u8; reader.buffer_size()];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    log::error!("TUN read error: {}", e);
                    continue;
                }
            };
            self.handle_device_frame(&buf[..n]).await;
        }
    }

    /// Process one raw packet read from the device.
    pub(crate) async fn handle_device_frame(&self, frame: &[u8]) {
        let Some(header) = packet::parse_header(frame) else {
            Counters::bump(&self.counters.parse_drops);
            log::debug!("dropping unparseable {}-byte frame from device", frame.len());
            return;
        };
        log::trace!(
            "device frame ipv6={} src={} dst={} len={}",
            header.is_ipv6,
            header.src,
            header.dst,
            frame.len()
        );

        if let IpAddr::V4(dst) = header.dst {
            if self.blacklist.contains(&dst) {
                Counters::bump(&self.counters.blacklist_drops);
                log::debug!("blocked packet to blacklisted {}", dst);
                return;
            }
        }

        if let Err(e) = self.forward_to_tunnel(header.dst, frame).await {
            log::debug!("tunnel write for {} failed: {}", header.dst, e);
        }
    }

    /// Resolve the destination, encrypt and queue the frame on the peer's
    /// connection. Missing peers and seal failures are silent drops;
    /// transport errors bubble up.
    async fn forward_to_tunnel(&self, dst: IpAddr, frame: &[u8]) -> VpnResult<()> {
        let record = if self.is_server {
            self.peers.query(dst)
        } else {
            self.peers.query_one()
        };
        let Some(record) = record else {
            Counters::bump(&self.counters.peer_miss_drops);
            log::debug!("no connection for {}", dst);
            return Ok(());
        };

        let sealed = match record.cipher.seal(frame) {
            Ok(sealed) => sealed,
            Err(e) => {
                Counters::bump(&self.counters.crypto_drops);
                log::debug!("encrypt for {} failed: {}", dst, e);
                return Ok(());
            }
        };

        record.conn.send(sealed).await?;
        if let Some(tries) = &self.reconnects {
            tries.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// True when the destination belongs to another peer of the virtual
    /// subnet. Always false on the client, which short-circuits the relay
    /// path.
    fn in_my_network(&self, header: &PacketHeader) -> bool {
        if !self.is_server {
            return false;
        }
        matches!(header.dst, IpAddr::V4(dst) if self.local_net.contains(&dst))
    }
}

impl PacketRouter for Engine {
    async fn authenticate(&self, token: &str, conn: PeerHandle) -> Option<AuthGrant> {
        if !self.is_server {
            log::debug!("rejecting inbound handshake on client role");
            return None;
        }
        let (ip, key) = self.auth.verify(token)?;
        let cipher = Arc::new(PacketCipher::new(&key));
        if !self.peers.update(ip, PeerRecord::new(conn, cipher.clone())) {
            log::debug!("address {} already in use", ip);
            return None;
        }
        Some(AuthGrant { ip, cipher })
    }

    async fn tunnel_to_device(&self, cipher: &PacketCipher, frame: &[u8]) {
        let plaintext = match cipher.open(frame) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                Counters::bump(&self.counters.crypto_drops);
                log::debug!("decrypt failed: {}", e);
                return;
            }
        };

        let Some(header) = packet::parse_header(&plaintext) else {
            Counters::bump(&self.counters.parse_drops);
            log::debug!(
                "dropping unparseable {}-byte frame from tunnel",
                plaintext.len()
            );
            return;
        };

        // Relay: a packet for another peer of the virtual subnet re-enters
        // the tunnel path and never touches the device. The relayed
        // destination resolves to a connection (or drops), so it cannot
        // loop back here.
        if self.in_my_network(&header) {
            Counters::bump(&self.counters.relayed);
            log::trace!("relaying {} -> {}", header.src, header.dst);
            if let Err(e) = self.forward_to_tunnel(header.dst, &plaintext).await {
                log::debug!("relay to {} failed: {}", header.dst, e);
            }
            return;
        }

        if self.dev_tx.send(plaintext).await.is_err() {
            log::error!("device writer closed, dropping inbound frame");
        }
    }

    fn peer_closed(&self, ip: Ipv4Addr) {
        log::info!("peer {} disconnected", ip);
        self.peers.delete(ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;

    const NET: &str = "10.0.0.0/24";

    fn server_engine(
        blacklist: impl IntoIterator<Item = Ipv4Addr>,
        users: &[UserCredential],
    ) -> (Arc<Engine>, mpsc::Receiver<Vec<u8>>) {
        let (dev_tx, dev_rx) = mpsc::channel(16);
        let engine = Engine::new(
            true,
            NET.parse().unwrap(),
            blacklist,
            users,
            dev_tx,
            None,
        );
        (Arc::new(engine), dev_rx)
    }

    fn register(engine: &Engine, ip: Ipv4Addr, key: [u8; 32]) -> mpsc::Receiver<Vec<u8>> {
        let (handle, rx) = PeerHandle::test_pair(16);
        let cipher = Arc::new(PacketCipher::new(&SessionKey::new(key)));
        assert!(engine.peers().update(ip, PeerRecord::new(handle, cipher)));
        rx
    }

    fn ipv4_packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet
    }

    #[tokio::test]
    async fn test_device_frame_reaches_peer_encrypted() {
        let (engine, _dev_rx) = server_engine([], &[]);
        let mut rx = register(&engine, Ipv4Addr::new(10, 0, 0, 2), [9u8; 32]);

        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2]);
        engine.handle_device_frame(&packet).await;

        let sealed = rx.try_recv().expect("peer should receive a frame");
        let cipher = PacketCipher::new(&SessionKey::new([9u8; 32]));
        assert_eq!(cipher.open(&sealed).unwrap(), packet);
    }

    #[tokio::test]
    async fn test_blacklisted_destination_dropped() {
        let blocked = Ipv4Addr::new(8, 8, 8, 8);
        let (engine, _dev_rx) = server_engine([blocked], &[]);
        let mut rx = register(&engine, Ipv4Addr::new(8, 8, 8, 8), [9u8; 32]);

        engine
            .handle_device_frame(&ipv4_packet([10, 0, 0, 1], [8, 8, 8, 8]))
            .await;

        assert!(rx.try_recv().is_err());
        assert_eq!(engine.counters().blacklist_drops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_unknown_destination_dropped() {
        let (engine, _dev_rx) = server_engine([], &[]);
        engine
            .handle_device_frame(&ipv4_packet([10, 0, 0, 1], [10, 0, 0, 9]))
            .await;
        assert_eq!(engine.counters().peer_miss_drops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_server_relays_between_peers() {
        let (engine, mut dev_rx) = server_engine([], &[]);
        let key_a = [1u8; 32];
        let key_b = [2u8; 32];
        let _rx_a = register(&engine, Ipv4Addr::new(10, 0, 0, 2), key_a);
        let mut rx_b = register(&engine, Ipv4Addr::new(10, 0, 0, 3), key_b);

        // A sends a packet destined for B through its own session key.
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 3]);
        let cipher_a = PacketCipher::new(&SessionKey::new(key_a));
        let sealed = cipher_a.seal(&packet).unwrap();

        engine.tunnel_to_device(&cipher_a, &sealed).await;

        // Delivered exactly once to B, re-encrypted under B's key, and the
        // server's device is never written.
        let relayed = rx_b.try_recv().expect("B should receive the relay");
        let cipher_b = PacketCipher::new(&SessionKey::new(key_b));
        assert_eq!(cipher_b.open(&relayed).unwrap(), packet);
        assert!(rx_b.try_recv().is_err());
        assert!(dev_rx.try_recv().is_err());
        assert_eq!(engine.counters().relayed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_out_of_subnet_inbound_goes_to_device() {
        let (engine, mut dev_rx) = server_engine([], &[]);
        let key = [3u8; 32];
        let _rx = register(&engine, Ipv4Addr::new(10, 0, 0, 2), key);

        let packet = ipv4_packet([10, 0, 0, 2], [93, 184, 216, 34]);
        let cipher = PacketCipher::new(&SessionKey::new(key));
        let sealed = cipher.seal(&packet).unwrap();

        engine.tunnel_to_device(&cipher, &sealed).await;
        assert_eq!(dev_rx.try_recv().unwrap(), packet);
    }

    #[tokio::test]
    async fn test_client_never_relays() {
        let (dev_tx, mut dev_rx) = mpsc::channel(16);
        let engine = Arc::new(Engine::new(
            false,
            NET.parse().unwrap(),
            [],
            &[],
            dev_tx,
            None,
        ));
        let key = [4u8; 32];
        let _rx = register(&engine, Ipv4Addr::new(10, 0, 0, 1), key);

        // In-subnet destination still lands on the client's device.
        let packet = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 5]);
        let cipher = PacketCipher::new(&SessionKey::new(key));
        let sealed = cipher.seal(&packet).unwrap();

        engine.tunnel_to_device(&cipher, &sealed).await;
        assert_eq!(dev_rx.try_recv().unwrap(), packet);
        assert_eq!(engine.counters().relayed.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_undecryptable_frame_dropped() {
        let (engine, mut dev_rx) = server_engine([], &[]);
        let cipher = PacketCipher::new(&SessionKey::new([5u8; 32]));

        engine.tunnel_to_device(&cipher, b"garbage-frame").await;

        assert!(dev_rx.try_recv().is_err());
        assert_eq!(engine.counters().crypto_drops.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_successful_write_resets_reconnect_counter() {
        let (dev_tx, _dev_rx) = mpsc::channel(16);
        let tries = Arc::new(AtomicU32::new(7));
        let engine = Arc::new(Engine::new(
            false,
            NET.parse().unwrap(),
            [],
            &[],
            dev_tx,
            Some(tries.clone()),
        ));
        let _rx = register(&engine, Ipv4Addr::new(10, 0, 0, 1), [6u8; 32]);

        engine
            .handle_device_frame(&ipv4_packet([10, 0, 0, 2], [1, 1, 1, 1]))
            .await;
        assert_eq!(tries.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_authenticate_binds_peer_once() {
        use crate::auth::make_token;

        let users = vec![UserCredential {
            name: "u".into(),
            password: "pw".into(),
            ip: Ipv4Addr::new(10, 0, 0, 2),
        }];
        let (engine, _dev_rx) = server_engine([], &users);
        let (token, _key) = make_token("u", "pw").unwrap();

        let (first, _rx1) = PeerHandle::test_pair(4);
        let grant = engine.authenticate(&token, first).await.unwrap();
        assert_eq!(grant.ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(engine.peers().len(), 1);

        // A second connection replaying the same identity is rejected and
        // the original binding survives.
        let (second, _rx2) = PeerHandle::test_pair(4);
        assert!(engine.authenticate(&token, second).await.is_none());
        assert_eq!(engine.peers().len(), 1);

        // Close hook releases the address for reuse.
        engine.peer_closed(grant.ip);
        assert!(engine.peers().is_empty());
    }

    #[tokio::test]
    async fn test_bad_token_leaves_table_untouched() {
        let users = vec![UserCredential {
            name: "u".into(),
            password: "pw".into(),
            ip: Ipv4Addr::new(10, 0, 0, 2),
        }];
        let (engine, _dev_rx) = server_engine([], &users);

        let (handle, _rx) = PeerHandle::test_pair(4);
        assert!(engine.authenticate("u:invalid", handle).await.is_none());
        assert!(engine.peers().is_empty());
    }
}
