use crate::object::GcRef;
use crate::value::Value;

/// `key = None, value = Bool(true)` marks a tombstone: deletions can't
/// simply clear a slot or probe sequences that walked past it would break.
struct Entry {
    key: Option<GcRef>,
    value: Value,
}

/// Open-addressed hash table keyed by interned-string identity. Probing is
/// linear; growth keeps the load factor (including tombstones) at or below
/// 0.75. Iteration order is bucket order, not insertion order.
pub struct FoxTable {
    entries: Vec<Entry>,
    count: usize,
}

const MAX_LOAD: f64 = 0.75;

impl FoxTable {
    pub fn new() -> Self {
        FoxTable { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn key_hash(key: GcRef) -> u32 {
        match &*key.data() {
            crate::object::ObjData::String(s) => s.hash,
            _ => key.addr() as u32,
        }
    }

    fn find_slot(entries: &[Entry], key: GcRef) -> usize {
        let cap = entries.len();
        let mut index = (Self::key_hash(key) as usize) % cap;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &entries[index] {
                Entry { key: None, value: Value::Null } => {
                    return first_tombstone.unwrap_or(index);
                }
                Entry { key: None, .. } => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                }
                Entry { key: Some(k), .. } if *k == key => return index,
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    fn grow(&mut self, new_cap: usize) {
        let mut new_entries: Vec<Entry> = (0..new_cap)
            .map(|_| Entry { key: None, value: Value::Null })
            .collect();
        let mut new_count = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let idx = Self::find_slot(&new_entries, key);
                new_entries[idx] = Entry { key: Some(key), value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    pub fn set(&mut self, key: GcRef, value: Value) -> bool {
        if self.entries.is_empty() || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD {
            let new_cap = if self.entries.is_empty() { 8 } else { self.capacity() * 2 };
            self.grow(new_cap);
        }
        let idx = Self::find_slot(&self.entries, key);
        let is_new = self.entries[idx].key.is_none();
        let was_tombstone = is_new && matches!(self.entries[idx].value, Value::Bool(true));
        if is_new && !was_tombstone {
            self.count += 1;
        }
        self.entries[idx] = Entry { key: Some(key), value };
        is_new
    }

    pub fn get(&self, key: GcRef) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let idx = Self::find_slot(&self.entries, key);
        self.entries[idx].key.map(|_| self.entries[idx].value.clone())
    }

    pub fn delete(&mut self, key: GcRef) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let idx = Self::find_slot(&self.entries, key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry { key: None, value: Value::Bool(true) };
        true
    }

    pub fn add_all(&mut self, other: &FoxTable) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.value.clone());
            }
        }
    }

    /// Finds an already-interned string by raw bytes without first
    /// allocating a candidate `FoxString` object. Used only by the intern
    /// table, whose keys are always strings.
    pub fn find_string(&self, bytes: &str, hash: u32) -> Option<GcRef> {
        if self.entries.is_empty() {
            return None;
        }
        let cap = self.capacity();
        let mut index = (hash as usize) % cap;
        loop {
            match &self.entries[index] {
                Entry { key: None, value: Value::Null } => return None,
                Entry { key: Some(k), .. } => {
                    if let crate::object::ObjData::String(s) = &*k.data() {
                        if s.hash == hash && s.value == bytes {
                            return Some(*k);
                        }
                    }
                }
                _ => {}
            }
            index = (index + 1) % cap;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcRef, &Value)> {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, &e.value)))
    }

    /// Drops entries whose key is unmarked. Called during GC after tracing
    /// finishes, only on the intern table — removing a live global would
    /// silently break the program.
    pub fn remove_unmarked_keys(&mut self) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !key.is_marked() {
                    *entry = Entry { key: None, value: Value::Bool(true) };
                }
            }
        }
    }
}

impl Default for FoxTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::Gc;

    #[test]
    fn set_then_get_round_trips() {
        let mut gc = Gc::new();
        let mut table = FoxTable::new();
        let key = gc.intern("name");
        table.set(key, Value::Number(1.0));
        assert_eq!(table.get(key), Some(Value::Number(1.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn set_on_existing_key_reports_not_new() {
        let mut gc = Gc::new();
        let mut table = FoxTable::new();
        let key = gc.intern("x");
        assert!(table.set(key, Value::Number(1.0)));
        assert!(!table.set(key, Value::Number(2.0)));
        assert_eq!(table.get(key), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn delete_leaves_a_tombstone_that_does_not_break_later_probes() {
        let mut gc = Gc::new();
        let mut table = FoxTable::new();
        let a = gc.intern("a");
        let b = gc.intern("b");
        table.set(a, Value::Number(1.0));
        table.set(b, Value::Number(2.0));
        assert!(table.delete(a));
        assert_eq!(table.get(a), None);
        // b must still be reachable even though probing may have walked
        // through a's now-tombstoned slot to find it.
        assert_eq!(table.get(b), Some(Value::Number(2.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn grows_to_keep_load_factor_at_or_below_three_quarters() {
        let mut gc = Gc::new();
        let mut table = FoxTable::new();
        for i in 0..100 {
            let key = gc.intern(&format!("k{i}"));
            table.set(key, Value::Number(i as f64));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            let key = gc.intern(&format!("k{i}"));
            assert_eq!(table.get(key), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn add_all_copies_every_live_entry_from_another_table() {
        let mut gc = Gc::new();
        let mut base = FoxTable::new();
        let mut sub = FoxTable::new();
        let key = gc.intern("greet");
        base.set(key, Value::Number(42.0));
        sub.add_all(&base);
        assert_eq!(sub.get(key), Some(Value::Number(42.0)));
    }

    #[test]
    fn find_string_locates_an_interned_key_by_raw_bytes() {
        let mut gc = Gc::new();
        let mut table = FoxTable::new();
        let key = gc.intern("hello");
        table.set(key, Value::Bool(true));
        let hash = crate::object::fnv1a(b"hello");
        assert_eq!(table.find_string("hello", hash), Some(key));
        assert_eq!(table.find_string("nope", crate::object::fnv1a(b"nope")), None);
    }
}
