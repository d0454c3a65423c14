//! The peer table: virtual address -> live connection + session cipher.
//!
//! ARP-style map populated by authentication and drained by disconnect
//! hooks. The forwarding pumps read it on every packet, so the lock is held
//! only for the duration of a single map operation and never across I/O.

use crate::channel::PeerHandle;
use crate::crypto::PacketCipher;
use crate::error::{VpnError, VpnResult};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Canonicalize a textual virtual address: any `/cidr` suffix is stripped
/// before parsing, so `10.0.0.2/24` and `10.0.0.2` key the same entry.
pub fn virtual_ip(addr: &str) -> VpnResult<Ipv4Addr> {
    let bare = addr.split('/').next().unwrap_or(addr).trim();
    bare.parse()
        .map_err(|_| VpnError::Config(format!("invalid virtual address: {}", addr)))
}

/// One registered peer: its write handle and session cipher.
#[derive(Clone)]
pub struct PeerRecord {
    /// Write handle for the peer's connection.
    pub conn: PeerHandle,
    /// Cipher keyed by the peer's session key.
    pub cipher: Arc<PacketCipher>,
    /// When this record was installed.
    pub updated_at: Instant,
}

impl PeerRecord {
    /// Bind a connection handle to a session cipher.
    pub fn new(conn: PeerHandle, cipher: Arc<PacketCipher>) -> Self {
        Self {
            conn,
            cipher,
            updated_at: Instant::now(),
        }
    }
}

/// Concurrent map from virtual IPv4 address to peer record.
#[derive(Default)]
pub struct PeerTable {
    inner: Mutex<HashMap<Ipv4Addr, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, PeerRecord>> {
        // The lock is never held across a panic site, but recover anyway.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a record for `ip` if none exists. Returns false on conflict,
    /// in which case the table is unchanged and the caller must reject the
    /// new connection.
    pub fn update(&self, ip: Ipv4Addr, record: PeerRecord) -> bool {
        match self.table().entry(ip) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(record);
                true
            }
        }
    }

    /// Look up the peer serving a destination address. IPv6 destinations
    /// never match: the virtual subnet is IPv4.
    pub fn query(&self, ip: IpAddr) -> Option<PeerRecord> {
        let IpAddr::V4(ip) = ip else {
            return None;
        };
        self.table().get(&ip).cloned()
    }

    /// Client-side convenience: the single registered peer (the server).
    pub fn query_one(&self) -> Option<PeerRecord> {
        self.table().values().next().cloned()
    }

    /// Remove the record for `ip`. Idempotent.
    pub fn delete(&self, ip: Ipv4Addr) {
        self.table().remove(&ip);
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;

    fn record() -> (PeerRecord, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let (handle, rx) = PeerHandle::test_pair(4);
        let cipher = Arc::new(PacketCipher::new(&SessionKey::new([1u8; 32])));
        (PeerRecord::new(handle, cipher), rx)
    }

    #[test]
    fn test_virtual_ip_canonicalization() {
        assert_eq!(virtual_ip("10.0.0.2").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(
            virtual_ip("10.0.0.2/24").unwrap(),
            Ipv4Addr::new(10, 0, 0, 2)
        );
        assert!(virtual_ip("not-an-ip").is_err());
        assert!(virtual_ip("010.0.0.2").is_err());
    }

    #[tokio::test]
    async fn test_update_rejects_duplicate_address() {
        let table = PeerTable::new();
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        let (first, _rx1) = record();
        let (second, _rx2) = record();

        assert!(table.update(ip, first));
        assert!(!table.update(ip, second));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_query_misses_after() {
        let table = PeerTable::new();
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        let (rec, _rx) = record();

        assert!(table.update(ip, rec));
        assert!(table.query(IpAddr::V4(ip)).is_some());

        table.delete(ip);
        assert!(table.query(IpAddr::V4(ip)).is_none());
        table.delete(ip); // no-op
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_query_one_returns_the_single_peer() {
        let table = PeerTable::new();
        assert!(table.query_one().is_none());

        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let (rec, _rx) = record();
        table.update(ip, rec);
        assert!(table.query_one().is_some());
    }

    #[tokio::test]
    async fn test_ipv6_destinations_never_match() {
        let table = PeerTable::new();
        let (rec, _rx) = record();
        table.update(Ipv4Addr::new(10, 0, 0, 2), rec);
        assert!(table.query("fd00::2".parse().unwrap()).is_none());
    }
}
