pub mod checkpoint;
pub mod config;
pub mod dht;
pub mod events;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod ports;
pub mod selection;
pub mod session;
pub mod supervisor;
pub mod tracker;

mod de;

// 20-byte identifier, used for both infohashes and client ids.
pub type ID = [u8; 20];

pub use config::Config;
pub use magnet::MagnetLink;
pub use metainfo::{MetaInfo, TorrentData};
pub use session::{TorrentSession, TorrentStatus};
