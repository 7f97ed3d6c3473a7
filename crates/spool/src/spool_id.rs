use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use uuid::Uuid;

/// The random node id used when minting v1 uuids in this process.
/// A fresh value per process start avoids tying ids to hardware
/// addresses while keeping them unique across a fleet.
static NODE_ID: LazyLock<[u8; 6]> = LazyLock::new(rand::random);

/// Identifies a message within the spool of its host node.
/// The id is a v1 UUID: its embedded timestamp records when the
/// message was created, which the queue layer uses to compute the
/// message age after a restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SpoolId(Uuid);

impl std::fmt::Display for SpoolId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.simple().fmt(fmt)
    }
}

impl From<SpoolId> for String {
    fn from(id: SpoolId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for SpoolId {
    type Error = uuid::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Ok(Self(Uuid::parse_str(&s)?))
    }
}

impl Default for SpoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl SpoolId {
    pub fn new() -> Self {
        Self(Uuid::now_v1(&NODE_ID))
    }

    /// Map the id to its location under `in_dir`: the leading four
    /// timestamp bytes become nested directories so that no single
    /// directory accumulates an unbounded number of entries, and the
    /// remaining bytes form the file name.
    pub fn compute_path(&self, in_dir: &Path) -> PathBuf {
        let b = self.0.as_bytes();
        let name = format!(
            "{:02x}/{:02x}/{:02x}/{:02x}/{}",
            b[0],
            b[1],
            b[2],
            b[3],
            b[4..]
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<String>()
        );
        in_dir.join(name)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_slice(s: &[u8]) -> Option<Self> {
        Some(Self(Uuid::from_slice(s).ok()?))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Some(Self(Uuid::parse_str(s).ok()?))
    }

    /// Inverse of compute_path
    pub fn from_path(mut path: &Path) -> Option<Self> {
        let mut components = vec![];

        for _ in 0..5 {
            components.push(path.file_name()?.to_str()?);
            path = path.parent()?;
        }

        components.reverse();
        Some(Self(Uuid::parse_str(&components.join("")).ok()?))
    }

    pub fn created(&self) -> DateTime<Utc> {
        let (seconds, nanos) = self
            .0
            .get_timestamp()
            .expect("SpoolId is always a v1 uuid")
            .to_unix();
        Utc.timestamp_opt(seconds as i64, nanos)
            .single()
            .expect("uuid timestamp is in range")
    }

    /// Returns time elapsed since the id was created,
    /// given the current timestamp
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_path() {
        let id = SpoolId::new();
        let path = id.compute_path(Path::new("."));
        let id2 = SpoolId::from_path(&path).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn roundtrip_bytes() {
        let id = SpoolId::new();
        let bytes = id.as_bytes();
        let id2 = SpoolId::from_slice(bytes.as_slice()).unwrap();
        assert_eq!(id, id2);
    }

    #[test]
    fn roundtrip_string() {
        let id = SpoolId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(SpoolId::from_str(&s), Some(id));
    }

    #[test]
    fn embedded_timestamp() {
        let id = SpoolId::new();
        let age = id.age(Utc::now());
        assert!(age.num_seconds() < 5, "freshly minted id is young: {age}");
    }
}
