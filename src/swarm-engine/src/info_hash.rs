use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use swarm_vfs::{SwarmError, SwarmResult};

/// 20-byte torrent info-hash, hex-encoded wherever it appears in keys or
/// logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> SwarmResult<Self> {
        let raw = hex::decode(s)
            .map_err(|e| SwarmError::InvalidParam(format!("bad info hash {:?}: {}", s, e)))?;
        let bytes: [u8; 20] = raw.try_into().map_err(|_| {
            SwarmError::InvalidParam(format!("info hash {:?} is not 20 bytes", s))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.hex())
    }
}

impl Serialize for InfoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for InfoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        InfoHash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
