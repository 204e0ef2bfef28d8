// Veld Tables
// Open-addressing hash maps: `Table` is keyed by interned string handles
// (globals, fields, method tables); `ValueMap` is keyed by hashable runtime
// values (Dict/Set). Both keep power-of-two capacity, linear probing, a max
// load factor of 0.75 and tombstoned deletes compacted on resize.

use crate::vm::heap::Handle;
use crate::vm::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;
const MIN_CAPACITY: usize = 8;

/// Interned strings are unique per content, so identity is a valid hash.
#[inline]
fn hash_handle(handle: Handle) -> u32 {
    let mut h = handle.index() as u32 ^ 0x9E37_79B9;
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2_AE35);
    h ^ (h >> 16)
}

/// FNV-1a over the raw bits, shared by string hashing and number hashing.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

/// Numbers hash by their bit pattern with -0.0 folded into 0.0 so that
/// `0.0 == -0.0` keys collide as required.
#[inline]
pub fn hash_number(n: f64) -> u32 {
    let n = if n == 0.0 { 0.0 } else { n };
    hash_bytes(&n.to_bits().to_le_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Slot {
    Empty,
    Tombstone,
    Pair(Handle, Value),
}

/// String-handle-keyed open-addressing map.
#[derive(Debug, Clone, Default)]
pub struct Table {
    slots: Vec<Slot>,
    /// Live entries plus tombstones; drives the resize trigger.
    count: usize,
    live: usize,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn find_slot(slots: &[Slot], key: Handle) -> usize {
        let mask = slots.len() - 1;
        let mut index = hash_handle(key) as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            match slots[index] {
                Slot::Empty => return tombstone.unwrap_or(index),
                Slot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Slot::Pair(k, _) => {
                    if k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_capacity]);
        self.count = 0;
        for slot in old {
            if let Slot::Pair(key, value) = slot {
                let index = Self::find_slot(&self.slots, key);
                self.slots[index] = Slot::Pair(key, value);
                self.count += 1;
            }
        }
    }

    /// Insert or update. Returns true when the key was new.
    pub fn insert(&mut self, key: Handle, value: Value) -> bool {
        if self.slots.is_empty() || (self.count + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM
        {
            self.grow();
        }
        let index = Self::find_slot(&self.slots, key);
        match self.slots[index] {
            Slot::Pair(..) => {
                self.slots[index] = Slot::Pair(key, value);
                false
            }
            Slot::Tombstone => {
                self.slots[index] = Slot::Pair(key, value);
                self.live += 1;
                true
            }
            Slot::Empty => {
                self.slots[index] = Slot::Pair(key, value);
                self.count += 1;
                self.live += 1;
                true
            }
        }
    }

    pub fn get(&self, key: Handle) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.slots[Self::find_slot(&self.slots, key)] {
            Slot::Pair(_, value) => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: Handle) -> bool {
        self.get(key).is_some()
    }

    /// Tombstone the entry; the slot is reclaimed on the next resize.
    pub fn remove(&mut self, key: Handle) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.slots, key);
        if matches!(self.slots[index], Slot::Pair(..)) {
            self.slots[index] = Slot::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    /// Copy every entry of `other` into `self` (inheritance, trait merge).
    pub fn add_all(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Pair(key, value) => Some((*key, *value)),
            _ => None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = Handle> + '_ {
        self.iter().map(|(key, _)| key)
    }
}

#[derive(Debug, Clone, Copy)]
enum MapSlot {
    Empty,
    Tombstone,
    Pair { key: Value, hash: u32, value: Value },
}

/// Value-keyed open-addressing map. The caller supplies the key hash
/// (computed by `Heap::hash_value`, which needs string content); probing
/// equality is plain `Value` equality, which is content-correct for
/// interned strings and referential for everything else.
#[derive(Debug, Clone, Default)]
pub struct ValueMap {
    slots: Vec<MapSlot>,
    count: usize,
    live: usize,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn find_slot(slots: &[MapSlot], key: Value, hash: u32) -> usize {
        let mask = slots.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            match &slots[index] {
                MapSlot::Empty => return tombstone.unwrap_or(index),
                MapSlot::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                MapSlot::Pair { key: k, hash: h, .. } => {
                    if *h == hash && *k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.slots, vec![MapSlot::Empty; new_capacity]);
        self.count = 0;
        for slot in old {
            if let MapSlot::Pair { key, hash, value } = slot {
                let index = Self::find_slot(&self.slots, key, hash);
                self.slots[index] = MapSlot::Pair { key, hash, value };
                self.count += 1;
            }
        }
    }

    pub fn insert(&mut self, key: Value, hash: u32, value: Value) -> bool {
        if self.slots.is_empty() || (self.count + 1) * MAX_LOAD_DEN > self.slots.len() * MAX_LOAD_NUM
        {
            self.grow();
        }
        let index = Self::find_slot(&self.slots, key, hash);
        match self.slots[index] {
            MapSlot::Pair { .. } => {
                self.slots[index] = MapSlot::Pair { key, hash, value };
                false
            }
            MapSlot::Tombstone => {
                self.slots[index] = MapSlot::Pair { key, hash, value };
                self.live += 1;
                true
            }
            MapSlot::Empty => {
                self.slots[index] = MapSlot::Pair { key, hash, value };
                self.count += 1;
                self.live += 1;
                true
            }
        }
    }

    pub fn get(&self, key: Value, hash: u32) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        match self.slots[Self::find_slot(&self.slots, key, hash)] {
            MapSlot::Pair { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: Value, hash: u32) -> bool {
        self.get(key, hash).is_some()
    }

    pub fn remove(&mut self, key: Value, hash: u32) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.slots, key, hash);
        if matches!(self.slots[index], MapSlot::Pair { .. }) {
            self.slots[index] = MapSlot::Tombstone;
            self.live -= 1;
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.slots.iter().filter_map(|slot| match slot {
            MapSlot::Pair { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> Handle {
        Handle::from_index(i)
    }

    #[test]
    fn insert_get_update() {
        let mut table = Table::new();
        assert!(table.insert(key(1), Value::Number(1.0)));
        assert!(!table.insert(key(1), Value::Number(2.0)));
        assert_eq!(table.get(key(1)), Some(Value::Number(2.0)));
        assert_eq!(table.get(key(2)), None);
    }

    #[test]
    fn load_factor_never_exceeds_three_quarters() {
        let mut table = Table::new();
        for i in 0..1000 {
            table.insert(key(i), Value::Number(i as f64));
            assert!(table.len() * MAX_LOAD_DEN <= table.capacity() * MAX_LOAD_NUM);
            assert!(table.capacity().is_power_of_two());
        }
    }

    #[test]
    fn thousand_inserts_five_hundred_deletes() {
        let mut table = Table::new();
        for i in 0..1000 {
            table.insert(key(i), Value::Number(i as f64));
        }
        for i in (0..1000).step_by(2) {
            assert!(table.remove(key(i)));
        }
        assert_eq!(table.len(), 500);
        for i in 0..1000 {
            if i % 2 == 0 {
                assert_eq!(table.get(key(i)), None);
            } else {
                assert_eq!(table.get(key(i)), Some(Value::Number(i as f64)));
            }
        }
    }

    #[test]
    fn tombstones_are_reused_and_compacted() {
        let mut table = Table::new();
        for i in 0..16 {
            table.insert(key(i), Value::Nil);
        }
        for i in 0..16 {
            table.remove(key(i));
        }
        // Reinsert through the tombstones; lookups stay correct.
        for i in 0..16 {
            table.insert(key(i), Value::Number(i as f64));
        }
        for i in 0..16 {
            assert_eq!(table.get(key(i)), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn value_map_number_keys() {
        let mut map = ValueMap::new();
        for i in 0..100 {
            let k = Value::Number(i as f64);
            map.insert(k, hash_number(i as f64), Value::Number((i * 2) as f64));
        }
        for i in 0..100 {
            let k = Value::Number(i as f64);
            assert_eq!(map.get(k, hash_number(i as f64)), Some(Value::Number((i * 2) as f64)));
        }
        assert!(map.remove(Value::Number(3.0), hash_number(3.0)));
        assert_eq!(map.get(Value::Number(3.0), hash_number(3.0)), None);
        assert_eq!(map.len(), 99);
    }

    #[test]
    fn negative_zero_and_zero_share_a_key() {
        let mut map = ValueMap::new();
        map.insert(Value::Number(0.0), hash_number(0.0), Value::Bool(true));
        assert_eq!(
            map.get(Value::Number(-0.0), hash_number(-0.0)),
            Some(Value::Bool(true))
        );
    }
}
