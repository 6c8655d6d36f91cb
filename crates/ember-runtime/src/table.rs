//! Hash table keyed by interned strings
//!
//! Open addressing with linear probing. Keys are string object handles and
//! compare by identity, which interning makes equivalent to content
//! equality. Buckets are chosen by the string's FNV-1a hash; callers pass
//! the hash alongside the key since the table itself has no view of the
//! heap. Deleted slots leave a tombstone (no key, value `true`) so probe
//! chains stay intact.

use crate::object::ObjRef;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
}

const EMPTY: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Nil,
};

const TOMBSTONE: Entry = Entry {
    key: None,
    hash: 0,
    value: Value::Bool(true),
};

/// Linear-probing hash map from interned string to value
#[derive(Debug, Default)]
pub struct Table {
    /// Live entries plus tombstones; reset to live-only on growth
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update. Returns `true` when the key was not present before.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let capacity = grow_capacity(self.entries.len());
            self.adjust_capacity(capacity);
        }

        let index = find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Look up the value stored under `key`
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[find_entry(&self.entries, key, hash)];
        entry.key.map(|_| entry.value)
    }

    /// Remove `key`, leaving a tombstone. Returns whether it was present.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = find_entry(&self.entries, key, hash);
        if self.entries[index].key.is_none() {
            return false;
        }
        self.entries[index] = TOMBSTONE;
        true
    }

    /// Copy every live entry of `from` into this table
    pub fn add_all(&mut self, from: &Table) {
        for entry in &from.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    /// Content-based lookup used by string interning: match on hash, length,
    /// and bytes, resolving candidate keys through `string_of`.
    pub fn find_string<'h>(
        &self,
        chars: &str,
        hash: u32,
        string_of: impl Fn(ObjRef) -> &'h str,
    ) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None => {
                    // Stop at a truly empty slot, probe past tombstones
                    if matches!(entry.value, Value::Nil) {
                        return None;
                    }
                }
                Some(key) => {
                    if entry.hash == hash {
                        let existing = string_of(key);
                        if existing.len() == chars.len() && existing == chars {
                            return Some(key);
                        }
                    }
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drop every entry whose key fails the liveness test. Collector hook:
    /// run between tracing and sweeping so the intern table never points at
    /// freed strings.
    pub fn remove_unmarked(&mut self, mut is_live: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !is_live(key) {
                    *entry = TOMBSTONE;
                }
            }
        }
    }

    /// Iterate live `(key, value)` pairs
    pub fn entries(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    /// Whether the table holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate owned memory, used for collector accounting
    pub fn byte_size(&self) -> usize {
        self.entries.len() * std::mem::size_of::<Entry>()
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![EMPTY; capacity];
        // Re-insert live entries only; tombstones are dropped here, so the
        // count resets to the live population.
        self.count = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let dest = find_entry(&entries, key, entry.hash);
                entries[dest] = *entry;
                self.count += 1;
            }
        }
        self.entries = entries;
    }
}

/// Probe for `key`. Returns the slot holding it, or the insertion slot: the
/// first tombstone seen, else the first empty slot.
fn find_entry(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
    let capacity = entries.len();
    let mut index = hash as usize % capacity;
    let mut tombstone = None;
    loop {
        let entry = &entries[index];
        match entry.key {
            None => {
                if matches!(entry.value, Value::Nil) {
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            }
            Some(existing) if existing == key => return index,
            Some(_) => {}
        }
        index = (index + 1) % capacity;
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}
