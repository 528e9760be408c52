use crate::info_hash::InfoHash;
use swarm_vfs::{SwarmError, SwarmResult};
use url::Url;

/// Parsed magnet URI. Only the pieces the index and engine need are kept;
/// the raw form is preserved for persistence.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub raw: String,
}

impl MagnetLink {
    /// Parse a magnet URI, accepting both 40-char hex and 32-char base32
    /// btih digests.
    pub fn parse(uri: &str) -> SwarmResult<Self> {
        let url = Url::parse(uri)
            .map_err(|e| SwarmError::InvalidParam(format!("bad magnet uri: {}", e)))?;
        if url.scheme() != "magnet" {
            return Err(SwarmError::InvalidParam(format!(
                "not a magnet uri: {}",
                uri
            )));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "xt" => {
                    let digest = v
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| {
                            SwarmError::InvalidParam(format!("unsupported xt topic: {}", v))
                        })?
                        .to_string();
                    info_hash = Some(decode_btih(&digest)?);
                }
                "dn" => display_name = Some(v.to_string()),
                "tr" => trackers.push(v.to_string()),
                _ => {}
            }
        }

        let info_hash = info_hash
            .ok_or_else(|| SwarmError::InvalidParam("magnet uri has no btih topic".to_string()))?;
        Ok(Self {
            info_hash,
            display_name,
            trackers,
            raw: uri.to_string(),
        })
    }
}

fn decode_btih(digest: &str) -> SwarmResult<InfoHash> {
    match digest.len() {
        40 => InfoHash::from_hex(digest),
        32 => {
            let raw = base32::decode(
                base32::Alphabet::Rfc4648 { padding: false },
                &digest.to_ascii_uppercase(),
            )
            .ok_or_else(|| {
                SwarmError::InvalidParam(format!("bad base32 info hash: {}", digest))
            })?;
            let bytes: [u8; 20] = raw.try_into().map_err(|_| {
                SwarmError::InvalidParam(format!("base32 info hash {} is not 20 bytes", digest))
            })?;
            Ok(InfoHash::new(bytes))
        }
        n => Err(SwarmError::InvalidParam(format!(
            "btih digest has unexpected length {}",
            n
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_parse_hex_magnet() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=bigbuck.mkv&tr=udp%3A%2F%2Ftracker%2Fannounce",
            HEX_HASH
        );
        let m = MagnetLink::parse(&uri).unwrap();
        assert_eq!(m.info_hash.hex(), HEX_HASH);
        assert_eq!(m.display_name.as_deref(), Some("bigbuck.mkv"));
        assert_eq!(m.trackers.len(), 1);
        assert_eq!(m.raw, uri);
    }

    #[test]
    fn test_parse_base32_magnet() {
        let bytes = [0x41u8; 20];
        let digest = base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes);
        let uri = format!("magnet:?xt=urn:btih:{}", digest);
        let m = MagnetLink::parse(&uri).unwrap();
        assert_eq!(m.info_hash, InfoHash::new(bytes));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(MagnetLink::parse("http://example.com").is_err());
        assert!(MagnetLink::parse("magnet:?dn=noxt").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:tooshort").is_err());
    }
}
