// Bike Tracker - Flash Storage
//
// NVS-backed implementation of the core key-value store.  Each operation
// opens its namespace afresh; NVS handles are cheap and this keeps the store
// free of per-namespace bookkeeping.

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use tracker_core::store::{KvStore, MemoryStore};

/// Longest string value read back (phone numbers, GNSS timestamps).
const STR_BUF_LEN: usize = 64;

pub struct NvsKvStore {
    partition: EspDefaultNvsPartition,
}

impl NvsKvStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }

    fn open(&self, namespace: &str) -> anyhow::Result<EspNvs<NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), namespace, true)?)
    }
}

impl KvStore for NvsKvStore {
    fn get_u32(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u32>> {
        Ok(self.open(namespace)?.get_u32(key)?)
    }

    fn set_u32(&mut self, namespace: &str, key: &str, value: u32) -> anyhow::Result<()> {
        self.open(namespace)?.set_u32(key, value)?;
        Ok(())
    }

    fn get_u64(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.open(namespace)?.get_u64(key)?)
    }

    fn set_u64(&mut self, namespace: &str, key: &str, value: u64) -> anyhow::Result<()> {
        self.open(namespace)?.set_u64(key, value)?;
        Ok(())
    }

    fn get_str(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>> {
        let nvs = self.open(namespace)?;
        let mut buffer = [0u8; STR_BUF_LEN];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_owned))
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        self.open(namespace)?.set_str(key, value)?;
        Ok(())
    }
}

/// Flash when the NVS partition came up, RAM otherwise.
pub enum Storage {
    Flash(NvsKvStore),
    Volatile(MemoryStore),
}

impl Storage {
    pub fn open(partition: Option<&EspDefaultNvsPartition>) -> Self {
        match partition {
            Some(partition) => Storage::Flash(NvsKvStore::new(partition.clone())),
            None => {
                log::warn!("No NVS partition; settings and fix log will not survive power loss");
                Storage::Volatile(MemoryStore::new())
            }
        }
    }
}

macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Storage::Flash($store) => $call,
            Storage::Volatile($store) => $call,
        }
    };
}

impl KvStore for Storage {
    fn get_u32(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u32>> {
        delegate!(self, s => s.get_u32(namespace, key))
    }

    fn set_u32(&mut self, namespace: &str, key: &str, value: u32) -> anyhow::Result<()> {
        delegate!(self, s => s.set_u32(namespace, key, value))
    }

    fn get_u64(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>> {
        delegate!(self, s => s.get_u64(namespace, key))
    }

    fn set_u64(&mut self, namespace: &str, key: &str, value: u64) -> anyhow::Result<()> {
        delegate!(self, s => s.set_u64(namespace, key, value))
    }

    fn get_str(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>> {
        delegate!(self, s => s.get_str(namespace, key))
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        delegate!(self, s => s.set_str(namespace, key, value))
    }
}
