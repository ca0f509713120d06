//! Contains the `ObjectId` type and its generator.

use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use rand::random;

use crate::error::{Error, Result};

const TIMESTAMP_SIZE: usize = 4;
const MACHINE_ID_SIZE: usize = 3;
const PROCESS_ID_SIZE: usize = 2;
const COUNTER_SIZE: usize = 3;

const TIMESTAMP_OFFSET: usize = 0;
const MACHINE_ID_OFFSET: usize = TIMESTAMP_OFFSET + TIMESTAMP_SIZE;
const PROCESS_ID_OFFSET: usize = MACHINE_ID_OFFSET + MACHINE_ID_SIZE;
const COUNTER_OFFSET: usize = PROCESS_ID_OFFSET + PROCESS_ID_SIZE;

/// The per-process monotonic counter occupying the trailing three bytes.
/// Seeded randomly so concurrent processes on one machine diverge even when
/// they start within the same second.
static OID_COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(random::<u32>() & 0xFF_FF_FF));

/// The three machine-identifier bytes, fixed for the process lifetime.
static MACHINE_ID: Lazy<[u8; 3]> = Lazy::new(random);

/// A 12-byte unique identifier:
/// seconds since the epoch (4 bytes, big-endian), a machine identifier
/// (3 bytes), the process id (2 bytes), and a monotonic counter (3 bytes,
/// big-endian).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    bytes: [u8; 12],
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectId {
    /// Generates a new id. Uniqueness within a process costs one atomic
    /// increment and no locks.
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let counter = OID_COUNTER.fetch_add(1, Ordering::SeqCst) & 0xFF_FF_FF;
        let process_id = std::process::id() as u16;

        let mut bytes = [0u8; 12];
        bytes[TIMESTAMP_OFFSET..MACHINE_ID_OFFSET].copy_from_slice(&timestamp.to_be_bytes());
        bytes[MACHINE_ID_OFFSET..PROCESS_ID_OFFSET].copy_from_slice(&*MACHINE_ID);
        bytes[PROCESS_ID_OFFSET..COUNTER_OFFSET].copy_from_slice(&process_id.to_be_bytes());
        bytes[COUNTER_OFFSET..].copy_from_slice(&counter.to_be_bytes()[1..]);

        Self { bytes }
    }

    /// Constructs an id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self { bytes }
    }

    /// The raw 12 bytes.
    pub const fn bytes(&self) -> [u8; 12] {
        self.bytes
    }

    /// The seconds-since-epoch value embedded in the leading four bytes.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }

    /// Renders the id as 24 lowercase hex characters.
    pub fn to_hex(self) -> String {
        hex::encode(self.bytes)
    }

    /// Parses an id from its 24-character hex form.
    pub fn parse_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| Error::invalid_argument(format!("invalid object id: {}", s)))?;
        let bytes: [u8; 12] = bytes
            .try_into()
            .map_err(|_| Error::invalid_argument(format!("invalid object id length: {}", s)))?;
        Ok(Self { bytes })
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectId").field(&self.to_hex()).finish()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::ObjectId;

    #[test]
    fn round_trips_through_hex() {
        let id = ObjectId::new();
        assert_eq!(ObjectId::parse_str(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(ObjectId::parse_str("zz").is_err());
        assert!(ObjectId::parse_str("0123456789abcdef").is_err());
    }

    // Spec scenario S6: ids generated concurrently are distinct and their
    // leading bytes decode to a second count inside the test window.
    #[test]
    fn concurrent_generation_yields_distinct_ids() {
        const PER_THREAD: usize = 250_000;

        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..PER_THREAD).map(|_| ObjectId::new()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::with_capacity(4 * PER_THREAD);
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id.bytes()), "duplicate id generated: {}", id);
            }
        }

        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as u32;
        for id in seen.iter().take(100) {
            let ts = ObjectId::from_bytes(*id).timestamp();
            assert!(ts >= before && ts <= after);
        }
    }
}
