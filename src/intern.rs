//! String intern table, per spec §3 and §4.2.
//!
//! Hand-rolled open addressing with tombstones and 32-bit FNV-1a hashing.
//! The teacher reaches for `lasso::Rodeo` for its symbol table
//! (`runtime::vm::JSVirtualMachine::interner`), which is the right call for
//! ambient plumbing — but this table's probing/tombstone/resize behavior is
//! one of the four subsystems spec §1 calls "the hard engineering", and
//! spec §8 tests its exact shape (interned identity, load factor, capacity
//! growth), so it is written out by hand instead of delegated to a crate.

use crate::object::Obj;
use std::rc::Rc;

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD_FACTOR: f64 = 0.75;

/// Spec §5's hard bound on string length. Callers that build a string out
/// of VM data (`STR`, `STR_CAT`) must check this before interning; the
/// constant-pool loader gets it for free since a string constant's length
/// byte can't encode more than 255 in the first place.
pub const MAX_STRING_LEN: usize = 255;

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Full(Rc<Obj>),
}

pub struct StringInterner {
    slots: Vec<Slot>,
    /// Number of `Full` slots (does not include tombstones).
    occupied: usize,
    tombstones: usize,
}

fn fnv1a(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn slot_bytes(obj: &Obj) -> &[u8] {
    obj.as_str().expect("intern table only stores Str objects").as_bytes()
}

impl StringInterner {
    pub fn new() -> Self {
        Self::with_initial_capacity(INITIAL_CAPACITY)
    }

    /// Same as `new`, but with a caller-supplied starting capacity (must be
    /// a power of two to keep `grow`'s doubling well-behaved). Used by the
    /// CLI's `--string-table-capacity` override (SPEC_FULL §5).
    pub fn with_initial_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        StringInterner {
            slots: vec![Slot::Empty; capacity],
            occupied: 0,
            tombstones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// `find_string`: probe linearly from `hash mod capacity`; stop at the
    /// first empty slot (not found), skip tombstones, compare length/bytes
    /// on every full slot visited.
    pub fn find_string(&self, bytes: &[u8]) -> Option<Rc<Obj>> {
        let capacity = self.slots.len();
        let hash = fnv1a(bytes);
        let mut idx = hash as usize % capacity;
        for _ in 0..capacity {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Full(obj) => {
                    if slot_bytes(obj) == bytes {
                        return Some(obj.clone());
                    }
                }
            }
            idx = (idx + 1) % capacity;
        }
        None
    }

    /// `get`: same lookup as `find_string`, named per spec §4.2's op list.
    pub fn get(&self, key: &[u8]) -> Option<Rc<Obj>> {
        self.find_string(key)
    }

    /// `set`: insert or overwrite the canonical entry for `key`. Grows the
    /// table first if the insertion would push load factor above 0.75;
    /// tombstones are consumed before any empty slot.
    pub fn set(&mut self, key: &[u8], value: Rc<Obj>) -> bool {
        if self.find_string(key).is_some() {
            self.insert_at(key, value);
            return false;
        }
        if (self.occupied + 1) as f64 / self.slots.len() as f64 > MAX_LOAD_FACTOR {
            self.grow();
        }
        self.insert_at(key, value);
        true
    }

    fn insert_at(&mut self, key: &[u8], value: Rc<Obj>) {
        let capacity = self.slots.len();
        let hash = fnv1a(key);
        let mut idx = hash as usize % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    let target = first_tombstone.unwrap_or(idx);
                    if first_tombstone.is_some() {
                        self.tombstones -= 1;
                    }
                    self.slots[target] = Slot::Full(value);
                    self.occupied += 1;
                    return;
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Full(obj) => {
                    if slot_bytes(obj) == key {
                        self.slots[idx] = Slot::Full(value);
                        return;
                    }
                }
            }
            idx = (idx + 1) % capacity;
        }
    }

    /// `delete`: mark the entry as a tombstone so later probes keep
    /// skipping past it instead of stopping short.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let capacity = self.slots.len();
        let hash = fnv1a(key);
        let mut idx = hash as usize % capacity;
        for _ in 0..capacity {
            match &self.slots[idx] {
                Slot::Empty => return false,
                Slot::Full(obj) if slot_bytes(obj) == key => {
                    self.slots[idx] = Slot::Tombstone;
                    self.occupied -= 1;
                    self.tombstones += 1;
                    return true;
                }
                _ => {}
            }
            idx = (idx + 1) % capacity;
        }
        false
    }

    fn grow(&mut self) {
        let new_capacity = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_capacity]);
        self.tombstones = 0;
        self.occupied = 0;
        for slot in old {
            if let Slot::Full(obj) = slot {
                let bytes = slot_bytes(&obj).to_vec();
                self.insert_at(&bytes, obj);
            }
        }
    }

    /// Find-or-create the canonical interned string for `bytes`. The
    /// primary entry point the rest of the VM uses; `get`/`set`/`delete`
    /// exist to match spec §4.2's named operations directly.
    pub fn intern(&mut self, bytes: &[u8]) -> Rc<Obj> {
        if let Some(existing) = self.find_string(bytes) {
            return existing;
        }
        let s = String::from_utf8_lossy(bytes).into_owned();
        let obj = Rc::new(Obj::Str(s));
        self.set(bytes, obj.clone());
        obj
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_pointer_identical() {
        let mut table = StringInterner::new();
        let a = table.intern(b"hi");
        let b = table.intern(b"hi");
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = StringInterner::new();
        for i in 0..100u32 {
            table.intern(i.to_string().as_bytes());
        }
        assert_eq!(table.len(), 100);
        assert!((table.len() as f64 / table.capacity() as f64) <= 0.75);
    }

    #[test]
    fn delete_then_reinsert_reuses_tombstone() {
        let mut table = StringInterner::new();
        table.intern(b"a");
        table.intern(b"b");
        assert!(table.delete(b"a"));
        assert!(table.find_string(b"a").is_none());
        let cap_before = table.capacity();
        table.intern(b"a");
        assert_eq!(table.capacity(), cap_before);
    }
}
