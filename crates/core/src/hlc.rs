use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

/// Returns the current wall-clock time as milliseconds since Unix epoch.
pub fn physical_now() -> Result<u64, CoreError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
}

/// Enqueue timestamp of a draft action: 8 bytes wall_ms (big-endian u64)
/// followed by 4 bytes counter (big-endian u32). Strictly increasing per clock,
/// so drafts authored in the same millisecond still replay in authoring order.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct Hlc {
    wall_ms: u64,
    counter: u32,
}

impl Hlc {
    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.wall_ms.to_be_bytes());
        buf[8..].copy_from_slice(&self.counter.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        let mut wall = [0u8; 8];
        let mut counter = [0u8; 4];
        wall.copy_from_slice(&bytes[..8]);
        counter.copy_from_slice(&bytes[8..]);
        Self {
            wall_ms: u64::from_be_bytes(wall),
            counter: u32::from_be_bytes(counter),
        }
    }

    /// ISO-8601 rendering of the wall component, as used for `LastModifiedDate`.
    pub fn to_rfc3339(&self) -> String {
        DateTime::<Utc>::from_timestamp_millis(self.wall_ms as i64)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde_bytes_compat(deserializer)?;
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::invalid_length(v.len(), &"12 bytes"))?;
        Ok(Hlc::from_bytes(&arr))
    }
}

/// Accepts both a byte string (msgpack) and a sequence of integers (JSON).
fn serde_bytes_compat<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl<'de> serde::de::Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("12 timestamp bytes")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(12);
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(BytesVisitor)
}

/// Hands out strictly increasing draft timestamps.
pub struct DraftClock {
    wall_ms: u64,
    counter: u32,
}

impl DraftClock {
    pub fn new() -> Self {
        Self {
            wall_ms: 0,
            counter: 0,
        }
    }

    /// Generate the next monotonically increasing timestamp.
    pub fn tick(&mut self) -> Result<Hlc, CoreError> {
        let now = physical_now()?;

        let hlc = if now > self.wall_ms {
            Hlc::new(now, 0)
        } else {
            Hlc::new(self.wall_ms, self.counter + 1)
        };

        self.wall_ms = hlc.wall_ms;
        self.counter = hlc.counter;
        Ok(hlc)
    }

    /// Advance past a persisted timestamp so drafts enqueued after a restart
    /// sort after every draft already on disk, even if the wall clock went back.
    pub fn observe(&mut self, seen: &Hlc) {
        let current = Hlc::new(self.wall_ms, self.counter);
        if *seen > current {
            self.wall_ms = seen.wall_ms;
            self.counter = seen.counter;
        }
    }
}

impl Default for DraftClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_monotonicity() {
        let mut clock = DraftClock::new();
        let mut prev = clock.tick().unwrap();
        for _ in 0..100 {
            let next = clock.tick().unwrap();
            assert!(next > prev, "expected {next:?} > {prev:?}");
            prev = next;
        }
    }

    #[test]
    fn observe_future_timestamp_keeps_order() {
        let mut clock = DraftClock::new();
        let future_ms = physical_now().unwrap() + 100_000;
        let persisted = Hlc::new(future_ms, 7);
        clock.observe(&persisted);

        let next = clock.tick().unwrap();
        assert_eq!(next.wall_ms(), future_ms);
        assert_eq!(next.counter(), 8);
        assert!(next > persisted);
    }

    #[test]
    fn observe_past_timestamp_is_ignored() {
        let mut clock = DraftClock::new();
        let first = clock.tick().unwrap();
        clock.observe(&Hlc::new(1, 0));
        assert!(clock.tick().unwrap() > first);
    }

    #[test]
    fn ordering_matches_bytes() {
        let pairs = vec![
            (Hlc::new(100, 0), Hlc::new(200, 0)),
            (Hlc::new(100, 0), Hlc::new(100, 1)),
            (Hlc::new(100, 999), Hlc::new(101, 0)),
        ];

        for (a, b) in &pairs {
            assert_eq!(a.cmp(b), a.to_bytes().cmp(&b.to_bytes()));
            assert!(a < b, "expected {a:?} < {b:?}");
        }
    }

    #[test]
    fn rfc3339_rendering() {
        let hlc = Hlc::new(1_700_000_000_123, 3);
        assert_eq!(hlc.to_rfc3339(), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn json_and_msgpack_roundtrip() {
        let hlc = Hlc::new(1_700_000_000_000, 42);
        let json = serde_json::to_string(&hlc).unwrap();
        assert_eq!(serde_json::from_str::<Hlc>(&json).unwrap(), hlc);
        let packed = rmp_serde::to_vec(&hlc).unwrap();
        assert_eq!(rmp_serde::from_slice::<Hlc>(&packed).unwrap(), hlc);
    }
}
