//! # Persistent Address Book
//!
//! Stores gossiped peer addresses in a KV namespace of their own.
//! Addresses learned from gossip arrive with `last_connected` cleared;
//! the dialer stamps it after a completed connection.

use async_trait::async_trait;
use ln_01_header_chain::{KVStoreError, KeyValueStore};
use ln_03_peer_protocol::{AddressBook, PeerAddress, ProtocolError};
use parking_lot::RwLock;
use tracing::debug;

/// Key prefix for address records.
const PREFIX_ADDR: u8 = b'a';

/// KV-backed address book.
pub struct KvAddressBook<K: KeyValueStore> {
    store: RwLock<K>,
}

impl<K: KeyValueStore> KvAddressBook<K> {
    /// Open over `store`.
    pub fn new(store: K) -> Self {
        Self {
            store: RwLock::new(store),
        }
    }

    fn key_for(address: &PeerAddress) -> Vec<u8> {
        let mut key = Vec::with_capacity(4 + address.addr.len());
        key.push(PREFIX_ADDR);
        key.push(address.network);
        key.extend_from_slice(&address.port.to_be_bytes());
        key.extend_from_slice(&address.addr);
        key
    }

    fn encode(address: &PeerAddress) -> Result<Vec<u8>, KVStoreError> {
        bincode::serialize(&(
            address.network,
            &address.addr,
            address.port,
            address.services,
            address.last_connected,
        ))
        .map_err(|e| KVStoreError::Corruption {
            message: e.to_string(),
        })
    }

    fn decode(bytes: &[u8]) -> Result<PeerAddress, KVStoreError> {
        let (network, addr, port, services, last_connected): (u8, Vec<u8>, u16, u64, Option<u32>) =
            bincode::deserialize(bytes).map_err(|e| KVStoreError::Corruption {
                message: e.to_string(),
            })?;
        Ok(PeerAddress {
            network,
            addr,
            port,
            services,
            last_connected,
        })
    }

    /// Stamp a successful connection time for `address`.
    pub fn mark_connected(&self, address: &PeerAddress, when: u32) -> Result<(), KVStoreError> {
        let mut updated = address.clone();
        updated.last_connected = Some(when);
        let mut store = self.store.write();
        store.put(&Self::key_for(&updated), &Self::encode(&updated)?)
    }
}

#[async_trait]
impl<K: KeyValueStore> AddressBook for KvAddressBook<K> {
    async fn known_addresses(&self) -> Result<Vec<PeerAddress>, ProtocolError> {
        let store = self.store.read();
        let rows = store.prefix_scan(&[PREFIX_ADDR]).map_err(to_protocol)?;
        let mut addresses = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            addresses.push(Self::decode(&value).map_err(to_protocol)?);
        }
        Ok(addresses)
    }

    async fn record_addresses(&self, addresses: Vec<PeerAddress>) -> Result<(), ProtocolError> {
        let mut store = self.store.write();
        for mut address in addresses {
            // Gossip is hearsay, never evidence of a completed connection.
            address.last_connected = None;
            store
                .put(&Self::key_for(&address), &Self::encode(&address).map_err(to_protocol)?)
                .map_err(to_protocol)?;
        }
        debug!("Recorded gossiped addresses");
        Ok(())
    }
}

fn to_protocol(err: KVStoreError) -> ProtocolError {
    ProtocolError::Store {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ln_01_header_chain::InMemoryKVStore;

    fn sample() -> PeerAddress {
        PeerAddress {
            network: 1,
            addr: vec![203, 0, 113, 9],
            port: 8734,
            services: 1,
            last_connected: Some(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_record_clears_last_connected() {
        let book = KvAddressBook::new(InMemoryKVStore::new());
        book.record_addresses(vec![sample()]).await.unwrap();

        let known = book.known_addresses().await.unwrap();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].addr, vec![203, 0, 113, 9]);
        assert_eq!(known[0].last_connected, None);
    }

    #[tokio::test]
    async fn test_mark_connected_persists() {
        let book = KvAddressBook::new(InMemoryKVStore::new());
        let mut address = sample();
        address.last_connected = None;
        book.record_addresses(vec![address.clone()]).await.unwrap();

        book.mark_connected(&address, 1_700_000_777).unwrap();
        let known = book.known_addresses().await.unwrap();
        assert_eq!(known[0].last_connected, Some(1_700_000_777));
    }

    #[tokio::test]
    async fn test_duplicate_addresses_overwrite() {
        let book = KvAddressBook::new(InMemoryKVStore::new());
        book.record_addresses(vec![sample(), sample()]).await.unwrap();
        assert_eq!(book.known_addresses().await.unwrap().len(), 1);
    }
}
