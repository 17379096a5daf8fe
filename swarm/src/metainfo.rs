use std::path::PathBuf;

use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use url::Url;

use crate::{magnet::MagnetLink, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("torrent data is not a dictionary")]
    NotADictionary,

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("info dictionary missing from torrent")]
    MissingInfo,

    #[error("metadata hash mismatch: expected {expected}, got {actual}")]
    InfoHashMismatch {
        expected: String,
        actual: String,
    },

}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    pub path: Vec<String>,

    pub length: u64,

    #[serde(default)]
    pub md5sum: Option<String>,

    // BEP 47 file attributes; "p" marks a padding file.
    #[serde(default)]
    pub attr: Option<String>,

}

impl File {

    pub fn is_padding(&self) -> bool {
        self.attr.as_deref().is_some_and(|a| a.contains('p'))
            || self.path.first().is_some_and(|p| p == ".pad")
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // Suggested output name; directory name for multi-file torrents.
    pub name: String,

    // Concatenation of all 20-byte SHA1 piece hashes.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    #[serde(default)]
    pub md5sum: Option<String>,

    // Present for single-file torrents.
    #[serde(default)]
    pub length: Option<u64>,

    // Present for multi-file torrents.
    #[serde(default)]
    pub files: Option<Vec<File>>,

    // If set to 1 the client must not discover peers outside the listed
    // trackers (no DHT, no PEX).
    #[serde(default)]
    pub private: Option<u8>,

}

// One entry of the torrent's flattened byte stream. Offsets are cumulative
// over every file including padding; padding occupies bytes but is never
// downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {

    pub index: usize,

    pub path: PathBuf,

    pub length: u64,

    // Offset from the start of the torrent viewed as a single byte array.
    pub offset: u64,

    pub is_padding: bool,

}

#[derive(Clone)]
pub struct MetaInfo {

    // Already normalized; invalid urls were dropped at decode time.
    pub announce: Option<Url>,

    pub info: Info,

    pub info_hash: ID,

    #[allow(dead_code)]
    pub encoding: Option<String>,

    pub announce_list: Option<Vec<Vec<Url>>>,

    pub creation_date: Option<i64>,

    pub comment: Option<String>,

    pub created_by: Option<String>,

}

// Raw shape as decoded from disk; info_hash is derived, not stored.
#[derive(Deserialize)]
struct RawMetaInfo {

    #[serde(default)]
    #[serde(deserialize_with = "crate::de::announce_deserialize")]
    announce: Option<Url>,

    info: Info,

    #[serde(default)]
    encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    announce_list: Option<Vec<Vec<Url>>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,

    #[serde(default)]
    comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<MetaInfo, MetaInfoError> {

        // Reject lists and scalars up front; a caller handing us a non-dict
        // is a bug worth being loud about.
        if raw.first() != Some(&b'd') {
            tracing::error!("torrent data does not start with a dictionary");
            return Err(MetaInfoError::NotADictionary);
        }

        // The infohash is the SHA1 of the info dict exactly as encoded in
        // the input. The decoder enforces sorted unique keys, so re-encoding
        // the generic value reproduces the original bytes.
        let value: bencode::Value = bencode::decode_bytes(raw)?;
        let info_value = value.get("info").ok_or(MetaInfoError::MissingInfo)?;
        let info_hash = sha1_of(&bencode::encode_to_raw(info_value)?);

        let raw_meta: RawMetaInfo = bencode::decode_bytes(raw)?;
        if raw_meta.info.pieces.len() % 20 != 0 || raw_meta.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        let metainfo = MetaInfo {
            announce: raw_meta.announce,
            info: raw_meta.info,
            info_hash,
            encoding: raw_meta.encoding,
            announce_list: raw_meta.announce_list,
            creation_date: raw_meta.creation_date,
            comment: raw_meta.comment,
            created_by: raw_meta.created_by,
        };
        tracing::debug!("metainfo decoded: {:#?}", metainfo);
        Ok(metainfo)
    }

    // Builds metadata from a bare info dictionary fetched from peers
    // (BEP 9). The bytes must hash to the infohash we asked for.
    pub fn from_info_bytes(info_raw: &[u8], expected: ID) -> Result<MetaInfo, MetaInfoError> {

        if info_raw.first() != Some(&b'd') {
            return Err(MetaInfoError::NotADictionary);
        }

        let value: bencode::Value = bencode::decode_bytes(info_raw)?;
        let info_hash = sha1_of(&bencode::encode_to_raw(&value)?);
        if info_hash != expected {
            return Err(MetaInfoError::InfoHashMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(info_hash),
            });
        }

        let info: Info = bencode::decode_bytes(info_raw)?;
        if info.pieces.len() % 20 != 0 || info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }

        Ok(MetaInfo {
            announce: None,
            info,
            info_hash,
            encoding: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        })
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as length was checked to be a multiple of 20 on decode.
            .map(|c| c.try_into().expect("20-byte chunk"))
            .collect()
    }

    pub fn piece_len(&self) -> u32 { self.info.piece_length }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn is_private(&self) -> bool { self.info.private == Some(1) }

    // Full length of the byte stream, padding included.
    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    // Bytes actually worth downloading.
    pub fn content_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().filter(|f| !f.is_padding()).map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    pub fn info_hash_hex(&self) -> String { hex::encode(self.info_hash) }

    // Announce urls by tier (BEP 12). Every url here was normalized at
    // decode time, so this only arranges what survived.
    pub fn tracker_tiers(&self) -> Vec<Vec<Url>> {

        let mut tiers: Vec<Vec<Url>> = Vec::new();

        if let Some(announce_list) = &self.announce_list {
            for tier in announce_list {
                let mut urls = tier.clone();
                // Tiers are tried in order but trackers within a tier are not.
                urls.shuffle(&mut rand::thread_rng());
                tiers.push(urls);
            }
        }

        if tiers.is_empty() {
            if let Some(announce) = &self.announce {
                tiers.push(vec![announce.clone()]);
            }
        }
        tiers
    }

    // Files of the torrent with cumulative offsets. Padding files are kept
    // in the list (they shift subsequent offsets) but flagged.
    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files
                .iter()
                .enumerate()
                .map(|(index, f)| {
                    let file_info = FileInfo {
                        index,
                        path: f.path.iter().collect(),
                        length: f.length,
                        offset,
                        is_padding: f.is_padding(),
                    };
                    offset += f.length;
                    file_info
                })
                .collect()
        } else {
            vec![FileInfo {
                index: 0,
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0),
                offset: 0,
                is_padding: false,
            }]
        }
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.and_then(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        })
    }
}

fn sha1_of(data: &[u8]) -> ID {
    use sha1::Digest;
    let mut hasher = sha1::Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

// Dont want to print out the pieces blob, so Debug is manual.
impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_ref().map(Url::as_str))
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            // Urls print as plain strings.
            .field("announce_list", &self.announce_list.as_ref().map(|tiers| {
                tiers
                    .iter()
                    .map(|tier| tier.iter().map(Url::as_str).collect())
                    .collect::<Vec<Vec<&str>>>()
            }))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .finish()
    }
}

// What we know about a torrent: full metadata from a .torrent file, or just
// the skeleton a magnet link carries until metadata arrives from peers.
#[derive(Debug, Clone)]
pub enum TorrentData {
    Metadata(MetaInfo),
    Magnet(MagnetLink),
}

impl TorrentData {

    pub fn info_hash(&self) -> ID {
        match self {
            TorrentData::Metadata(m) => m.info_hash(),
            TorrentData::Magnet(m) => m.info_hash,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            TorrentData::Metadata(m) => m.name().to_string(),
            TorrentData::Magnet(m) => m
                .display_name
                .clone()
                .unwrap_or_else(|| m.info_hash_hex()),
        }
    }

    pub fn has_metadata(&self) -> bool {
        matches!(self, TorrentData::Metadata(_))
    }

    pub fn metadata(&self) -> Option<&MetaInfo> {
        match self {
            TorrentData::Metadata(m) => Some(m),
            TorrentData::Magnet(_) => None,
        }
    }

    pub fn total_len(&self) -> u64 {
        match self {
            TorrentData::Metadata(m) => m.total_len(),
            TorrentData::Magnet(_) => 0,
        }
    }

    pub fn is_private(&self) -> bool {
        match self {
            TorrentData::Metadata(m) => m.is_private(),
            TorrentData::Magnet(_) => false,
        }
    }

    pub fn tracker_tiers(&self) -> Vec<Vec<Url>> {
        match self {
            TorrentData::Metadata(m) => m.tracker_tiers(),
            TorrentData::Magnet(m) => {
                if m.trackers.is_empty() {
                    Vec::new()
                } else {
                    vec![m.trackers.clone()]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use bencode::Value;

    fn bytes(v: &[u8]) -> Value { Value::ByteString(v.to_vec()) }

    fn build_torrent(info_extra: impl FnOnce(&mut BTreeMap<Vec<u8>, Value>)) -> Vec<u8> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes(b"test"));
        info.insert(b"piece length".to_vec(), Value::Integer(16384));
        info.insert(b"pieces".to_vec(), bytes(&[0xaa; 40]));
        info.insert(b"length".to_vec(), Value::Integer(20000));
        info_extra(&mut info);

        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), bytes(b"https://tracker.example.com:443/announce"));
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        bencode::encode_to_raw(&Value::Dictionary(root)).unwrap()
    }

    #[test]
    fn from_bytes_single_file() {
        let meta = MetaInfo::from_bytes(&build_torrent(|_| {})).unwrap();
        assert_eq!(meta.num_pieces(), 2);
        assert_eq!(meta.piece_len(), 16384);
        assert_eq!(meta.total_len(), 20000);
        assert!(!meta.is_multi_file());
        assert_eq!(meta.files().len(), 1);
        assert_eq!(meta.tracker_tiers().len(), 1);
    }

    #[test]
    fn rejects_non_dictionary() {
        assert!(matches!(
            MetaInfo::from_bytes(b"li1ee"),
            Err(MetaInfoError::NotADictionary)
        ));
    }

    #[test]
    fn rejects_ragged_piece_hashes() {
        let raw = {
            let mut info = BTreeMap::new();
            info.insert(b"name".to_vec(), bytes(b"x"));
            info.insert(b"piece length".to_vec(), Value::Integer(16384));
            info.insert(b"pieces".to_vec(), bytes(&[0xaa; 21]));
            info.insert(b"length".to_vec(), Value::Integer(1));
            let mut root = BTreeMap::new();
            root.insert(b"info".to_vec(), Value::Dictionary(info));
            bencode::encode_to_raw(&Value::Dictionary(root)).unwrap()
        };
        assert!(matches!(
            MetaInfo::from_bytes(&raw),
            Err(MetaInfoError::InvalidPiecesLength)
        ));
    }

    #[test]
    fn info_hash_is_hash_of_info_dict() {
        let raw = build_torrent(|_| {});
        let meta = MetaInfo::from_bytes(&raw).unwrap();

        let value: Value = bencode::decode_bytes(&raw).unwrap();
        let info_raw = bencode::encode_to_raw(value.get("info").unwrap()).unwrap();
        assert_eq!(meta.info_hash(), sha1_of(&info_raw));

        // And the round trip through from_info_bytes agrees.
        let again = MetaInfo::from_info_bytes(&info_raw, meta.info_hash()).unwrap();
        assert_eq!(again.num_pieces(), meta.num_pieces());
    }

    #[test]
    fn from_info_bytes_rejects_wrong_hash() {
        let raw = build_torrent(|_| {});
        let value: Value = bencode::decode_bytes(&raw).unwrap();
        let info_raw = bencode::encode_to_raw(value.get("info").unwrap()).unwrap();
        assert!(matches!(
            MetaInfo::from_info_bytes(&info_raw, [0; 20]),
            Err(MetaInfoError::InfoHashMismatch { .. })
        ));
    }

    fn multi_file_torrent() -> Vec<u8> {
        let file = |path: &[&str], len: i64, attr: Option<&str>| {
            let mut d = BTreeMap::new();
            d.insert(
                b"path".to_vec(),
                Value::List(path.iter().map(|p| bytes(p.as_bytes())).collect()),
            );
            d.insert(b"length".to_vec(), Value::Integer(len));
            if let Some(a) = attr {
                d.insert(b"attr".to_vec(), bytes(a.as_bytes()));
            }
            Value::Dictionary(d)
        };

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes(b"album"));
        info.insert(b"piece length".to_vec(), Value::Integer(16384));
        info.insert(b"pieces".to_vec(), bytes(&[0xbb; 80]));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![
                file(&["a.bin"], 10_000, None),
                file(&[".pad", "6384"], 6_384, Some("p")),
                file(&["b.bin"], 16_384, None),
                file(&["c.bin"], 32_768, None),
            ]),
        );
        let mut root = BTreeMap::new();
        root.insert(b"info".to_vec(), Value::Dictionary(info));
        bencode::encode_to_raw(&Value::Dictionary(root)).unwrap()
    }

    #[test]
    fn padding_files_are_flagged_and_shift_offsets() {
        let meta = MetaInfo::from_bytes(&multi_file_torrent()).unwrap();
        let files = meta.files();
        assert_eq!(files.len(), 4);
        assert!(!files[0].is_padding);
        assert!(files[1].is_padding);
        assert_eq!(files[2].offset, 16_384);
        assert_eq!(meta.total_len(), 65_536);
        assert_eq!(meta.content_len(), 59_152);
    }

    #[test]
    fn malformed_tracker_urls_dropped_at_decode() {
        let raw = {
            let mut info = BTreeMap::new();
            info.insert(b"name".to_vec(), bytes(b"x"));
            info.insert(b"piece length".to_vec(), Value::Integer(16384));
            info.insert(b"pieces".to_vec(), bytes(&[0xaa; 20]));
            info.insert(b"length".to_vec(), Value::Integer(1));
            let mut root = BTreeMap::new();
            root.insert(b"announce".to_vec(), bytes(b"not-a-url"));
            root.insert(
                b"announce-list".to_vec(),
                Value::List(vec![Value::List(vec![
                    bytes(b"udp:/t.example:1337"),
                    bytes(b"wss://nope.example/announce"),
                ])]),
            );
            root.insert(b"info".to_vec(), Value::Dictionary(info));
            bencode::encode_to_raw(&Value::Dictionary(root)).unwrap()
        };

        let meta = MetaInfo::from_bytes(&raw).unwrap();
        // Rejected on the way in, not lazily at announce time.
        assert!(meta.announce.is_none());
        let tiers = meta.tracker_tiers();
        assert_eq!(tiers.len(), 1);
        assert_eq!(tiers[0].len(), 1);
        assert_eq!(tiers[0][0].as_str(), "udp://t.example:1337");
    }

    #[test]
    fn torrent_data_magnet_skeleton() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:deadbeefdeadbeefdeadbeefdeadbeefdeadbeef&dn=thing",
        )
        .unwrap();
        let data = TorrentData::Magnet(magnet);
        assert!(!data.has_metadata());
        assert_eq!(data.total_len(), 0);
        assert_eq!(data.display_name(), "thing");
        assert!(data.tracker_tiers().is_empty());
    }
}
