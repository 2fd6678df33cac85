//! Upvalue capture and closing (§4.4 "Closures & Upvalues" / C4).
//!
//! Open upvalues form a singly-linked list threaded through `Vm::open_upvalues`,
//! kept sorted by descending stack slot (highest slot first) — the same
//! arrangement Lua-family VMs use so that capturing the same slot twice
//! returns the existing upvalue, and closing on frame return only has to walk
//! until it sees a slot below the floor.

use crate::object::{GcRef, Obj, Upvalue, UpvalueRecipe, UpvalueState};
use crate::error::VmError;
use crate::vm::Vm;

impl Vm {
    /// Return the existing open upvalue for `slot`, or create and splice in
    /// a new one, preserving descending-slot order.
    pub fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        let mut current = self.open_upvalues;
        let mut prev: Option<GcRef> = None;

        while let Some(r) = current {
            let (node_slot, next) = match self.heap.get(r) {
                Ok(Obj::Upvalue(u)) => match u.state {
                    UpvalueState::Open { slot: s } => (s, u.next_open),
                    UpvalueState::Closed(_) => break,
                },
                _ => break,
            };
            if node_slot == slot {
                return r;
            }
            if node_slot < slot {
                break;
            }
            prev = Some(r);
            current = next;
        }

        let new_upvalue = self.heap.alloc(Obj::Upvalue(Upvalue { state: UpvalueState::Open { slot }, next_open: current }));
        match prev {
            Some(p) => {
                if let Ok(Obj::Upvalue(u)) = self.heap.get_mut(p) {
                    u.next_open = Some(new_upvalue);
                }
            }
            None => self.open_upvalues = Some(new_upvalue),
        }
        new_upvalue
    }

    /// Close every open upvalue pointing at slot `>= floor`, snapshotting its
    /// current stack value in place. Called when a frame returns or a block
    /// scope exits, before those slots are reused.
    pub fn close_upvalues_from(&mut self, floor: usize) {
        while let Some(r) = self.open_upvalues {
            let slot = match self.heap.get(r) {
                Ok(Obj::Upvalue(u)) => match u.state {
                    UpvalueState::Open { slot } => slot,
                    UpvalueState::Closed(_) => break,
                },
                _ => break,
            };
            if slot < floor {
                break;
            }
            let value = self.get_slot(slot);
            let next = match self.heap.get_mut(r) {
                Ok(Obj::Upvalue(u)) => {
                    u.state = UpvalueState::Closed(value);
                    u.next_open
                }
                _ => None,
            };
            self.open_upvalues = next;
        }
    }

    /// Build a closure's upvalue array from its function's recipe list
    /// (`CLOSURE` opcode, §4.4): a `Local` recipe captures (or reuses) an
    /// open upvalue over the enclosing frame's slot; a `Parent` recipe
    /// copies the enclosing closure's own upvalue handle.
    pub fn resolve_closure_upvalues(
        &mut self,
        recipes: &[UpvalueRecipe],
        enclosing: GcRef,
        frame_base: usize,
    ) -> Result<Vec<GcRef>, VmError> {
        let mut result = Vec::with_capacity(recipes.len());
        for recipe in recipes {
            if recipe.is_local {
                result.push(self.capture_upvalue(frame_base + recipe.index as usize));
            } else {
                match self.heap.get(enclosing)? {
                    Obj::Closure(c) => result.push(c.upvalues[recipe.index as usize]),
                    _ => return Err(VmError::message("enclosing value is not a closure")),
                }
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn capturing_the_same_slot_twice_returns_the_same_upvalue() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        let a = vm.capture_upvalue(2);
        let b = vm.capture_upvalue(2);
        assert_eq!(a, b);
    }

    #[test]
    fn closing_snapshots_the_live_value_and_detaches_the_node() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        vm.set_slot(1, Value::number(7.0));
        let u = vm.capture_upvalue(1);
        vm.close_upvalues_from(0);
        assert!(vm.open_upvalues.is_none());
        if let Ok(Obj::Upvalue(up)) = vm.heap().get(u) {
            match up.state {
                UpvalueState::Closed(v) => assert_eq!(v.as_number(), Some(7.0)),
                UpvalueState::Open { .. } => panic!("expected closed"),
            }
        } else {
            panic!("expected upvalue object");
        }
    }

    #[test]
    fn close_only_affects_slots_at_or_above_the_floor() {
        let mut vm = Vm::new();
        vm.ensure_capacity(8).unwrap();
        vm.set_slot(0, Value::number(1.0));
        vm.set_slot(3, Value::number(2.0));
        let low = vm.capture_upvalue(0);
        let high = vm.capture_upvalue(3);
        vm.close_upvalues_from(2);
        assert!(matches!(vm.heap().get(high).unwrap(), Obj::Upvalue(u) if matches!(u.state, UpvalueState::Closed(_))));
        assert!(matches!(vm.heap().get(low).unwrap(), Obj::Upvalue(u) if matches!(u.state, UpvalueState::Open { slot: 0 })));
    }
}
