//! Global variable table, per spec §3.
//!
//! A fixed-capacity array of `(present?, value)` pairs, indexed by the
//! small integer the compiler assigns each global — there is no name
//! lookup at this layer.

use crate::error::{VmError, VmResult};
use crate::value::Value;

pub const MAX_GLOBALS: usize = 256;

pub struct Globals {
    slots: Vec<Option<Value>>,
}

impl Globals {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_GLOBALS);
        slots.resize_with(MAX_GLOBALS, || None);
        Globals { slots }
    }

    pub fn set(&mut self, index: u8, value: Value, offset: usize) -> VmResult<()> {
        self.slots
            .get_mut(index as usize)
            .ok_or_else(|| VmError::range(offset, format!("global index {} out of range", index)))
            .map(|slot| *slot = Some(value))
    }

    pub fn get(&self, index: u8, offset: usize) -> VmResult<Value> {
        match self.slots.get(index as usize) {
            Some(Some(v)) => Ok(v.clone()),
            Some(None) => Err(VmError::range(offset, format!("global {} is absent", index))),
            None => Err(VmError::range(offset, format!("global index {} out of range", index))),
        }
    }
}

impl Default for Globals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_global_is_range_error() {
        let globals = Globals::new();
        assert!(matches!(globals.get(0, 0), Err(VmError::Range { .. })));
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut globals = Globals::new();
        globals.set(3, Value::Int(7), 0).unwrap();
        assert!(matches!(globals.get(3, 0).unwrap(), Value::Int(7)));
    }

    #[test]
    fn highest_index_is_addressable() {
        let mut globals = Globals::new();
        globals.set(255, Value::Bool(true), 0).unwrap();
        assert!(matches!(globals.get(255, 0).unwrap(), Value::Bool(true)));
    }
}
