//! Interpreter stacks.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use bitcoin::Witness;

use crate::interpreter::ScriptError;

/// Maximum combined depth of the main and alt stacks.
pub const MAX_STACK_SIZE: usize = 1000;
/// Maximum size of a single stack element.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// A stack of byte vectors with top-relative addressing: offset `-1` is the
/// top, `-2` the element below it, and so on.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScriptStack {
    pub(crate) items: Vec<Vec<u8>>,
}

impl ScriptStack {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn from_items(items: Vec<Vec<u8>>) -> Result<Self, ScriptError> {
        if items.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
        for item in &items {
            if item.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
        }
        Ok(Self { items })
    }

    pub fn from_witness(witness: &Witness) -> Result<Self, ScriptError> {
        Self::from_witness_prefix(witness, witness.len())
    }

    /// Builds a stack from the first `end` witness elements.
    pub fn from_witness_prefix(witness: &Witness, end: usize) -> Result<Self, ScriptError> {
        if end > witness.len() || end > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
        let mut items = Vec::with_capacity(end);
        for elem in witness.iter().take(end) {
            let bytes = elem.to_vec();
            if bytes.len() > MAX_SCRIPT_ELEMENT_SIZE {
                return Err(ScriptError::PushSize);
            }
            items.push(bytes);
        }
        Ok(Self { items })
    }

    pub fn push(&mut self, data: Vec<u8>) -> Result<(), ScriptError> {
        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        self.items.push(data);
        Ok(())
    }

    pub fn push_bool(&mut self, value: bool) -> Result<(), ScriptError> {
        if value {
            self.push(vec![1])
        } else {
            self.push(Vec::new())
        }
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.items.pop()
    }

    pub fn last(&self) -> Option<&Vec<u8>> {
        self.items.last()
    }

    /// Element at negative offset from the top; `top(-1)` is the last pushed.
    pub fn top(&self, offset: isize) -> Option<&Vec<u8>> {
        debug_assert!(offset < 0, "offsets are negative");
        self.items
            .len()
            .checked_sub(offset.unsigned_abs())
            .map(|index| &self.items[index])
    }

    /// Swaps the elements at two negative offsets. Both must be in range.
    pub fn swap(&mut self, a: isize, b: isize) -> bool {
        let len = self.items.len();
        let (Some(ia), Some(ib)) = (
            len.checked_sub(a.unsigned_abs()),
            len.checked_sub(b.unsigned_abs()),
        ) else {
            return false;
        };
        self.items.swap(ia, ib);
        true
    }

    /// Removes the half-open range `[from, to)` expressed in negative
    /// offsets, e.g. `erase(-2, -1)` drops the element below the top.
    pub fn erase(&mut self, from: isize, to: isize) -> bool {
        let len = self.items.len();
        let (Some(start), Some(end)) = (
            len.checked_sub(from.unsigned_abs()),
            len.checked_sub(to.unsigned_abs()),
        ) else {
            return false;
        };
        if start > end {
            return false;
        }
        self.items.drain(start..end);
        true
    }

    /// Inserts `data` so that it ends up at the given negative offset.
    pub fn insert(&mut self, offset: isize, data: Vec<u8>) -> bool {
        let Some(index) = self.items.len().checked_sub(offset.unsigned_abs()) else {
            return false;
        };
        self.items.insert(index, data);
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
