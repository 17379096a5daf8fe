use serde::{de, Deserialize};
use url::Url;

use crate::magnet::normalize_tracker_url;

// Deserialiser functions for metainfo tracker fields.
//
// Tracker urls are normalized as they come off the wire, so by the time a
// MetaInfo exists every url in it is canonical and anything malformed has
// already been dropped. The announce fan-out never sees a raw string.

pub fn announce_deserialize<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match normalize_tracker_url(&raw) {
        Ok(url) => Ok(Some(url)),
        Err(e) => {
            tracing::warn!("dropping announce url from metainfo: {}", e);
            Ok(None)
        }
    }
}

pub fn announce_list_deserialize<'de, D>(
    deserializer: D,
) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Vec::<Vec<String>>::deserialize(deserializer)?;

    let mut rejected = 0usize;
    let mut announce_list = Vec::new();
    for tier in raw {
        let urls: Vec<Url> = tier
            .iter()
            .filter_map(|raw_url| match normalize_tracker_url(raw_url) {
                Ok(url) => Some(url),
                Err(e) => {
                    rejected += 1;
                    tracing::debug!("dropping tracker from announce-list: {}", e);
                    None
                }
            })
            .collect();
        // A tier that lost every member carries no information.
        if !urls.is_empty() {
            announce_list.push(urls);
        }
    }

    if rejected > 0 {
        tracing::warn!("dropped {} malformed tracker url(s) from announce-list", rejected);
    }
    if announce_list.is_empty() {
        Ok(None)
    } else {
        Ok(Some(announce_list))
    }
}
