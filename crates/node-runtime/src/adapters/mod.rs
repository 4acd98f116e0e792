//! Production adapters implementing the subsystems' driven ports.

pub mod address_book;
pub mod event_sink;
pub mod gateways;
pub mod storage;
pub mod tx_pool;

pub use address_book::KvAddressBook;
pub use event_sink::BusEventSink;
pub use gateways::{FilterStoreClient, HeaderStoreClient, HeaderViewAdapter};
pub use storage::{RocksDbConfig, RocksDbStore};
pub use tx_pool::InMemoryTxPool;
