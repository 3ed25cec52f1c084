// Bike Tracker - Fix History
//
// Circular log of past fixes, persisted slot by slot in NVS.
//
// Each slot holds `lat_N lon_N spd_N time_N src_N`; the cursors `logIndex`
// (next slot to write) and `logCount` (live entries) are written after the
// slot so an interrupted append never exposes a half-written entry.

use serde::Serialize;

use crate::position::PositionFix;
use crate::store::KvStore;

pub const NAMESPACE: &str = "gps-log";
pub const DEFAULT_CAPACITY: usize = 50;

const KEY_INDEX: &str = "logIndex";
const KEY_COUNT: &str = "logCount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum FixSource {
    Phone = 0,
    Modem = 1,
}

impl From<FixSource> for u8 {
    fn from(source: FixSource) -> u8 {
        source as u8
    }
}

impl FixSource {
    fn from_u32(raw: u32) -> Self {
        if raw == 0 {
            FixSource::Phone
        } else {
            FixSource::Modem
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub lat: f32,
    pub lon: f32,
    pub speed: f32,
    #[serde(rename = "time")]
    pub time_ms: u64,
    #[serde(rename = "src")]
    pub source: FixSource,
}

#[derive(Debug, Clone)]
pub struct FixHistory {
    capacity: usize,
    write_index: usize,
    count: usize,
}

impl FixHistory {
    /// Restore the cursors.  Out-of-range values (e.g. after the capacity
    /// shrank) restart the log rather than read garbage slots.
    pub fn load(store: &impl KvStore, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let read = |key| {
            store
                .get_u32(NAMESPACE, key)
                .ok()
                .flatten()
                .map(|v| v as usize)
                .unwrap_or(0)
        };
        let (write_index, count) = (read(KEY_INDEX), read(KEY_COUNT));
        if write_index >= capacity || count > capacity {
            log::warn!("History cursors out of range ({write_index}/{count}), starting over");
            return Self {
                capacity,
                write_index: 0,
                count: 0,
            };
        }
        Self {
            capacity,
            write_index,
            count,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn append(&mut self, store: &mut impl KvStore, entry: HistoryEntry) -> anyhow::Result<()> {
        let slot = self.write_index;
        store.set_f32(NAMESPACE, &format!("lat_{slot}"), entry.lat)?;
        store.set_f32(NAMESPACE, &format!("lon_{slot}"), entry.lon)?;
        store.set_f32(NAMESPACE, &format!("spd_{slot}"), entry.speed)?;
        store.set_u64(NAMESPACE, &format!("time_{slot}"), entry.time_ms)?;
        store.set_u32(NAMESPACE, &format!("src_{slot}"), entry.source as u32)?;

        let write_index = (slot + 1) % self.capacity;
        let count = (self.count + 1).min(self.capacity);
        store.set_u32(NAMESPACE, KEY_INDEX, write_index as u32)?;
        store.set_u32(NAMESPACE, KEY_COUNT, count as u32)?;
        self.write_index = write_index;
        self.count = count;
        Ok(())
    }

    pub fn append_fix(
        &mut self,
        store: &mut impl KvStore,
        fix: &PositionFix,
        source: FixSource,
    ) -> anyhow::Result<()> {
        self.append(
            store,
            HistoryEntry {
                lat: fix.latitude as f32,
                lon: fix.longitude as f32,
                speed: fix.speed_kmh,
                time_ms: fix.fix_ms,
                source,
            },
        )
    }

    /// Entry `index` counted from the oldest live entry.
    pub fn get(&self, store: &impl KvStore, index: usize) -> anyhow::Result<Option<HistoryEntry>> {
        if index >= self.count {
            return Ok(None);
        }
        let slot = (self.write_index + self.capacity - self.count + index) % self.capacity;
        Ok(Some(HistoryEntry {
            lat: store.get_f32(NAMESPACE, &format!("lat_{slot}"))?.unwrap_or(0.0),
            lon: store.get_f32(NAMESPACE, &format!("lon_{slot}"))?.unwrap_or(0.0),
            speed: store.get_f32(NAMESPACE, &format!("spd_{slot}"))?.unwrap_or(0.0),
            time_ms: store.get_u64(NAMESPACE, &format!("time_{slot}"))?.unwrap_or(0),
            source: FixSource::from_u32(store.get_u32(NAMESPACE, &format!("src_{slot}"))?.unwrap_or(1)),
        }))
    }

    /// Entries `[start, start + len)` oldest first, clipped to what exists.
    pub fn range(
        &self,
        store: &impl KvStore,
        start: usize,
        len: usize,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        let end = start.saturating_add(len).min(self.count);
        (start.min(end)..end)
            .filter_map(|i| self.get(store, i).transpose())
            .collect()
    }

    pub fn all(&self, store: &impl KvStore) -> anyhow::Result<Vec<HistoryEntry>> {
        self.range(store, 0, self.count)
    }

    /// The newest `k` entries, oldest first.
    pub fn recent(&self, store: &impl KvStore, k: usize) -> anyhow::Result<Vec<HistoryEntry>> {
        self.range(store, self.count.saturating_sub(k), k)
    }

    /// Forget every entry.  Slot data is left behind but unreachable.
    pub fn clear(&mut self, store: &mut impl KvStore) -> anyhow::Result<()> {
        store.set_u32(NAMESPACE, KEY_INDEX, 0)?;
        store.set_u32(NAMESPACE, KEY_COUNT, 0)?;
        self.write_index = 0;
        self.count = 0;
        Ok(())
    }
}
