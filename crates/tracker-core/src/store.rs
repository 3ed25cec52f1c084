// Bike Tracker - Key-Value Storage
//
// Namespaced key-value persistence, shaped after the ESP-IDF NVS API.
//
// NVS has no float type, so `f32` values travel as their bit pattern and
// booleans as `u32` 0/1.  Keys must stay within NVS's 15 byte limit.

use std::collections::HashMap;

pub trait KvStore {
    fn get_u32(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u32>>;
    fn set_u32(&mut self, namespace: &str, key: &str, value: u32) -> anyhow::Result<()>;

    fn get_u64(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>>;
    fn set_u64(&mut self, namespace: &str, key: &str, value: u64) -> anyhow::Result<()>;

    fn get_str(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>>;
    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()>;

    fn get_bool(&self, namespace: &str, key: &str) -> anyhow::Result<Option<bool>> {
        Ok(self.get_u32(namespace, key)?.map(|v| v != 0))
    }

    fn set_bool(&mut self, namespace: &str, key: &str, value: bool) -> anyhow::Result<()> {
        self.set_u32(namespace, key, value as u32)
    }

    fn get_f32(&self, namespace: &str, key: &str) -> anyhow::Result<Option<f32>> {
        Ok(self.get_u32(namespace, key)?.map(f32::from_bits))
    }

    fn set_f32(&mut self, namespace: &str, key: &str, value: f32) -> anyhow::Result<()> {
        self.set_u32(namespace, key, value.to_bits())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    U32(u32),
    U64(u64),
    Str(String),
}

/// RAM-backed store.  Used when the NVS partition cannot be opened (the
/// device keeps working, it just forgets on power loss) and by tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: HashMap<(String, String), Value>,
    writes: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful set/remove calls, for asserting write churn.
    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn get(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.entries.get(&(namespace.to_owned(), key.to_owned()))
    }

    fn put(&mut self, namespace: &str, key: &str, value: Value) {
        self.writes += 1;
        self.entries
            .insert((namespace.to_owned(), key.to_owned()), value);
    }
}

impl KvStore for MemoryStore {
    fn get_u32(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u32>> {
        match self.get(namespace, key) {
            Some(Value::U32(v)) => Ok(Some(*v)),
            Some(other) => anyhow::bail!("{namespace}/{key} holds {other:?}, not u32"),
            None => Ok(None),
        }
    }

    fn set_u32(&mut self, namespace: &str, key: &str, value: u32) -> anyhow::Result<()> {
        self.put(namespace, key, Value::U32(value));
        Ok(())
    }

    fn get_u64(&self, namespace: &str, key: &str) -> anyhow::Result<Option<u64>> {
        match self.get(namespace, key) {
            Some(Value::U64(v)) => Ok(Some(*v)),
            Some(other) => anyhow::bail!("{namespace}/{key} holds {other:?}, not u64"),
            None => Ok(None),
        }
    }

    fn set_u64(&mut self, namespace: &str, key: &str, value: u64) -> anyhow::Result<()> {
        self.put(namespace, key, Value::U64(value));
        Ok(())
    }

    fn get_str(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>> {
        match self.get(namespace, key) {
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(other) => anyhow::bail!("{namespace}/{key} holds {other:?}, not a string"),
            None => Ok(None),
        }
    }

    fn set_str(&mut self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        self.put(namespace, key, Value::Str(value.to_owned()));
        Ok(())
    }
}
