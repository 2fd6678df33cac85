//! The reference system (§4.5): five flavors, flattening, write-through,
//! cycle detection, and lifetime promotion on return.

use std::collections::HashSet;

use crate::error::VmError;
use crate::object::{GcRef, Obj, Reference, Upvalue, UpvalueState};
use crate::value::{MapKey, Value};
use crate::vm::Vm;

/// Maximum reference-chain depth a `read`/write-through/cycle-check may
/// traverse before failing with `ReferenceCycle` (§3 invariants).
pub const MAX_REF_DEPTH: usize = 64;

/// What a cycle check is guarding against re-entering.
pub(crate) enum RefTarget<'a> {
    Global(&'a str),
    Local(usize),
}

impl Vm {
    pub(crate) fn is_reference(&self, r: GcRef) -> Result<bool, VmError> {
        Ok(matches!(self.heap.get(r)?, Obj::Reference(_)))
    }

    pub(crate) fn get_reference(&self, r: GcRef) -> Result<Reference, VmError> {
        match self.heap.get(r)? {
            Obj::Reference(reference) => Ok(reference.clone()),
            _ => Err(VmError::message("not a reference")),
        }
    }

    /// Fetch the value currently bound by `reference`, without chasing
    /// further hops.
    fn read_binding(&self, reference: &Reference) -> Result<Value, VmError> {
        match reference {
            Reference::LocalSlot(idx) => Ok(self.get_slot(*idx)),
            Reference::Upvalue(u) => match self.heap.get(*u)? {
                Obj::Upvalue(up) => match up.state {
                    UpvalueState::Open { slot } => Ok(self.get_slot(slot)),
                    UpvalueState::Closed(v) => Ok(v),
                },
                _ => Err(VmError::message("not an upvalue")),
            },
            Reference::Global(name) => self.get_global(name),
            Reference::Index { container, index } => self.container_get_index(*container, **index),
            Reference::Property { container, key } => self.container_get_property(*container, **key),
            Reference::Native(_) => {
                Err(VmError::message("native references are opaque to the core"))
            }
        }
    }

    /// Store `v` as the binding `reference` denotes, without chasing
    /// further hops (the slot-write semantics — see `deref_write` for the
    /// write-through variant).
    fn write_binding(&mut self, reference: &Reference, v: Value) -> Result<(), VmError> {
        match reference {
            Reference::LocalSlot(idx) => {
                self.set_slot(*idx, v);
                Ok(())
            }
            Reference::Upvalue(u) => {
                let open_slot = match self.heap.get(*u)? {
                    Obj::Upvalue(up) => match up.state {
                        UpvalueState::Open { slot } => Some(slot),
                        UpvalueState::Closed(_) => None,
                    },
                    _ => return Err(VmError::message("not an upvalue")),
                };
                match open_slot {
                    Some(slot) => {
                        self.set_slot(slot, v);
                        Ok(())
                    }
                    None => {
                        if let Obj::Upvalue(up) = self.heap.get_mut(*u)? {
                            up.state = UpvalueState::Closed(v);
                        }
                        Ok(())
                    }
                }
            }
            Reference::Global(name) => self.set_global(name, v),
            Reference::Index { container, index } => self.container_set_index(*container, **index, v),
            Reference::Property { container, key } => self.container_set_property(*container, **key, v),
            Reference::Native(_) => {
                Err(VmError::message("native references are opaque to the core"))
            }
        }
    }

    /// Read an upvalue's current binding directly (no reference-chasing —
    /// `GET_UPVALUE` reads the variable slot itself, not through it).
    pub(crate) fn read_upvalue(&self, u: GcRef) -> Result<Value, VmError> {
        self.read_binding(&Reference::Upvalue(u))
    }

    /// Overwrite an upvalue's binding directly (`SLOT_SET_UPVALUE`, and the
    /// "else" branch of `SET_UPVALUE`'s write-through check).
    pub(crate) fn write_upvalue(&mut self, u: GcRef, v: Value) -> Result<(), VmError> {
        self.write_binding(&Reference::Upvalue(u), v)
    }

    /// `read(r)`: chase through nested references up to `MAX_REF_DEPTH`.
    pub fn deref_read(&self, start: GcRef) -> Result<Value, VmError> {
        let mut current = start;
        for _ in 0..=MAX_REF_DEPTH {
            let reference = self.get_reference(current)?;
            let v = self.read_binding(&reference)?;
            match v.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
                Some(next) => current = next,
                None => return Ok(v),
            }
        }
        Err(VmError::ReferenceCycle)
    }

    /// `write(r, v, recursive)` — write-through when `recursive`, direct
    /// overwrite otherwise.
    pub fn deref_write(&mut self, start: GcRef, v: Value, recursive: bool) -> Result<(), VmError> {
        if !recursive {
            let reference = self.get_reference(start)?;
            return self.write_binding(&reference, v);
        }
        let mut current = start;
        for _ in 0..=MAX_REF_DEPTH {
            let reference = self.get_reference(current)?;
            let existing = self.read_binding(&reference)?;
            match existing.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
                Some(next) => current = next,
                None => return self.write_binding(&reference, v),
            }
        }
        Err(VmError::ReferenceCycle)
    }

    /// Slot-write: always overwrites the binding directly, never following
    /// through (`SLOT_*` opcode family).
    pub fn slot_write(&mut self, r: GcRef, v: Value) -> Result<(), VmError> {
        let reference = self.get_reference(r)?;
        self.write_binding(&reference, v)
    }

    // ---- flattening ------------------------------------------------------

    /// If `v` is itself a reference, chase to the ultimate binding and
    /// return that handle; otherwise `None`. Used by the flattening
    /// `MAKE_*_REF` opcodes (the `SLOT_MAKE_*` family skips this and always
    /// wraps the immediate binding, by design — see §4.7).
    pub(crate) fn flatten(&self, v: Value) -> Result<Option<GcRef>, VmError> {
        let mut current = match v.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
            Some(r) => r,
            None => return Ok(None),
        };
        for _ in 0..=MAX_REF_DEPTH {
            let reference = self.get_reference(current)?;
            let bound = self.read_binding(&reference)?;
            match bound.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
                Some(next) => current = next,
                None => return Ok(Some(current)),
            }
        }
        Err(VmError::ReferenceCycle)
    }

    pub fn make_ref_to_local(&mut self, idx: usize) -> Result<GcRef, VmError> {
        if let Some(flattened) = self.flatten(self.get_slot(idx))? {
            return Ok(flattened);
        }
        Ok(self.heap.alloc(Obj::Reference(Reference::LocalSlot(idx))))
    }

    pub fn slot_make_ref_to_local(&mut self, idx: usize) -> GcRef {
        self.heap.alloc(Obj::Reference(Reference::LocalSlot(idx)))
    }

    pub fn make_global_ref(&mut self, name: &str) -> Result<GcRef, VmError> {
        let current = self.get_global(name)?;
        if let Some(flattened) = self.flatten(current)? {
            return Ok(flattened);
        }
        Ok(self.heap.alloc(Obj::Reference(Reference::Global(name.to_string()))))
    }

    pub fn slot_make_global_ref(&mut self, name: &str) -> GcRef {
        self.heap.alloc(Obj::Reference(Reference::Global(name.to_string())))
    }

    pub fn make_upvalue_ref(&mut self, u: GcRef) -> Result<GcRef, VmError> {
        let current = self.read_binding(&Reference::Upvalue(u))?;
        if let Some(flattened) = self.flatten(current)? {
            return Ok(flattened);
        }
        Ok(self.heap.alloc(Obj::Reference(Reference::Upvalue(u))))
    }

    pub fn make_index_ref(&mut self, container: Value, index: Value) -> Result<GcRef, VmError> {
        let element = self.container_get_index(container, index)?;
        if let Some(flattened) = self.flatten(element)? {
            return Ok(flattened);
        }
        Ok(self.heap.alloc(Obj::Reference(Reference::Index { container, index: Box::new(index) })))
    }

    pub fn slot_make_index_ref(&mut self, container: Value, index: Value) -> GcRef {
        self.heap.alloc(Obj::Reference(Reference::Index { container, index: Box::new(index) }))
    }

    pub fn make_property_ref(&mut self, container: Value, key: Value) -> Result<GcRef, VmError> {
        let element = self.container_get_property(container, key)?;
        if let Some(flattened) = self.flatten(element)? {
            return Ok(flattened);
        }
        Ok(self.heap.alloc(Obj::Reference(Reference::Property { container, key: Box::new(key) })))
    }

    pub fn slot_make_property_ref(&mut self, container: Value, key: Value) -> GcRef {
        self.heap.alloc(Obj::Reference(Reference::Property { container, key: Box::new(key) }))
    }

    // ---- cycle prevention at assignment -----------------------------------

    fn target_matches(&self, reference: &Reference, target: &RefTarget) -> bool {
        match (reference, target) {
            (Reference::Global(g), RefTarget::Global(t)) => g == t,
            (Reference::LocalSlot(i), RefTarget::Local(t)) => i == t,
            _ => false,
        }
    }

    fn check_no_cycle(&self, start: GcRef, target: &RefTarget) -> Result<(), VmError> {
        let mut current = start;
        for _ in 0..=MAX_REF_DEPTH {
            let reference = self.get_reference(current)?;
            if self.target_matches(&reference, target) {
                return Err(VmError::ReferenceCycle);
            }
            let bound = self.read_binding(&reference)?;
            match bound.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
        Err(VmError::ReferenceCycle)
    }

    /// Assign `v` into local slot `idx`, applying the cycle-prevention rule
    /// when `v` is a reference: a pre-write chain check, then a post-write
    /// re-dereference that rolls the write back on failure.
    pub fn assign_local_checked(&mut self, idx: usize, v: Value) -> Result<(), VmError> {
        if let Some(candidate) = v.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
            self.check_no_cycle(candidate, &RefTarget::Local(idx))?;
            let previous = self.get_slot(idx);
            self.set_slot(idx, v);
            if let Err(e) = self.deref_read(candidate) {
                self.set_slot(idx, previous);
                return Err(e);
            }
            return Ok(());
        }
        self.set_slot(idx, v);
        Ok(())
    }

    /// Assign `v` into global `name`, rejecting a dangling `LocalSlot`
    /// reference outright and otherwise applying the same cycle check as
    /// locals (globals have no stack frame to outlive, so no post-write
    /// re-dereference is needed — the chain can only be broken by another
    /// explicit write).
    pub fn assign_global_checked(&mut self, name: &str, v: Value) -> Result<(), VmError> {
        if let Some(candidate) = v.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
            if let Reference::LocalSlot(_) = self.get_reference(candidate)? {
                return Err(VmError::DanglingRefStore);
            }
            self.check_no_cycle(candidate, &RefTarget::Global(name))?;
        }
        self.set_global(name, v)
    }

    // ---- container access used by Index/Property bindings -----------------

    pub(crate) fn container_get_index(&self, container: Value, index: Value) -> Result<Value, VmError> {
        let r = container.as_object().ok_or_else(|| VmError::type_mismatch("subscript", "list or map", &container))?;
        match self.heap.get(r)? {
            Obj::List(items) => {
                let i = index.as_number().ok_or_else(|| VmError::type_mismatch("subscript", "number", &index))?;
                if i.fract() != 0.0 {
                    return Err(VmError::type_mismatch("subscript", "integer", &index));
                }
                let i = i as i64;
                if i < 0 || i as usize >= items.len() {
                    return Err(VmError::OutOfBounds { index: i, len: items.len() });
                }
                Ok(items[i as usize])
            }
            Obj::Map(map) => {
                let key = self.value_to_map_key(index)?;
                Ok(map.get(&key).copied().unwrap_or(Value::NULL))
            }
            _ => Err(VmError::type_mismatch("subscript", "list or map", &container)),
        }
    }

    pub(crate) fn container_set_index(&mut self, container: Value, index: Value, v: Value) -> Result<(), VmError> {
        let r = container.as_object().ok_or_else(|| VmError::type_mismatch("subscript", "list or map", &container))?;
        match self.heap.get_mut(r)? {
            Obj::List(items) => {
                let i = index.as_number().ok_or_else(|| VmError::type_mismatch("subscript", "number", &index))?;
                if i.fract() != 0.0 {
                    return Err(VmError::type_mismatch("subscript", "integer", &index));
                }
                let i = i as i64;
                if i < 0 || i as usize >= items.len() {
                    return Err(VmError::OutOfBounds { index: i, len: items.len() });
                }
                items[i as usize] = v;
                Ok(())
            }
            Obj::Map(_) => {
                let key = self.value_to_map_key(index)?;
                if let Obj::Map(map) = self.heap.get_mut(r)? {
                    if v.is_null() {
                        map.remove(&key);
                    } else {
                        map.insert(key, v);
                    }
                }
                Ok(())
            }
            _ => Err(VmError::type_mismatch("subscript", "list or map", &container)),
        }
    }

    pub(crate) fn container_get_property(&self, container: Value, key: Value) -> Result<Value, VmError> {
        let r = container.as_object().ok_or_else(|| VmError::type_mismatch("property", "map or struct", &container))?;
        match self.heap.get(r)? {
            Obj::Map(map) => {
                let mk = self.value_to_map_key(key)?;
                Ok(map.get(&mk).copied().unwrap_or(Value::NULL))
            }
            Obj::StructInstance { schema, fields } => {
                let name = self.string_value_contents(key)?;
                let schema_ref = *schema;
                let fields = fields.clone();
                match self.heap.get(schema_ref)? {
                    Obj::StructSchema(s) => match s.field_index.get(&name) {
                        Some(&i) => Ok(fields[i]),
                        None => Err(VmError::KeyMissing { key: name }),
                    },
                    _ => Err(VmError::message("corrupt struct schema")),
                }
            }
            _ => Err(VmError::type_mismatch("property", "map or struct", &container)),
        }
    }

    pub(crate) fn container_set_property(&mut self, container: Value, key: Value, v: Value) -> Result<(), VmError> {
        let r = container.as_object().ok_or_else(|| VmError::type_mismatch("property", "map or struct", &container))?;
        let name = self.string_value_contents(key)?;
        let is_map = matches!(self.heap.get(r)?, Obj::Map(_));
        if is_map {
            let mk = self.value_to_map_key(key)?;
            if let Obj::Map(map) = self.heap.get_mut(r)? {
                if v.is_null() {
                    map.remove(&mk);
                } else {
                    map.insert(mk, v);
                }
            }
            return Ok(());
        }
        let schema_ref = match self.heap.get(r)? {
            Obj::StructInstance { schema, .. } => *schema,
            _ => return Err(VmError::type_mismatch("property", "map or struct", &container)),
        };
        let idx = match self.heap.get(schema_ref)? {
            Obj::StructSchema(s) => *s.field_index.get(&name).ok_or_else(|| VmError::KeyMissing { key: name.clone() })?,
            _ => return Err(VmError::message("corrupt struct schema")),
        };
        if let Obj::StructInstance { fields, .. } = self.heap.get_mut(r)? {
            fields[idx] = v;
        }
        Ok(())
    }

    pub(crate) fn value_to_map_key(&self, v: Value) -> Result<MapKey, VmError> {
        if let Some(r) = v.as_object() {
            if matches!(self.heap.get(r)?, Obj::String(_)) {
                return Ok(MapKey::from_object_str(r));
            }
        }
        MapKey::from_value(v).ok_or_else(|| VmError::type_mismatch("map key", "string, number, or bool", &v))
    }

    pub(crate) fn string_value_contents(&self, v: Value) -> Result<String, VmError> {
        let r = v.as_object().ok_or_else(|| VmError::type_mismatch("property key", "string", &v))?;
        match self.heap.get(r)? {
            Obj::String(s) => Ok(s.to_string()),
            _ => Err(VmError::type_mismatch("property key", "string", &v)),
        }
    }

    // ---- lifetime promotion on return --------------------------------------

    /// Promote every `LocalSlot` reference inside `v` whose target slot lies
    /// in `[frame_base, frame_top)` to an `Upvalue` reference, recursing
    /// into list elements, map values, and struct fields. Mutates matching
    /// `Reference` objects in place so every other `Value` copy of the same
    /// `GcRef` observes the promotion too.
    pub fn promote_escaping_refs(&mut self, v: Value, frame_base: usize, frame_top: usize) -> Result<Value, VmError> {
        let mut visited = HashSet::new();
        self.promote_inner(v, frame_base, frame_top, &mut visited)?;
        Ok(v)
    }

    fn promote_inner(&mut self, v: Value, base: usize, top: usize, visited: &mut HashSet<u32>) -> Result<(), VmError> {
        let Some(r) = v.as_object() else { return Ok(()) };
        if !visited.insert(r.index_for_visited()) {
            return Ok(());
        }
        let obj = self.heap.get(r)?.clone();
        match obj {
            Obj::Reference(Reference::LocalSlot(idx)) if idx >= base && idx < top => {
                let captured = self.capture_upvalue(idx);
                if let Obj::Reference(reference) = self.heap.get_mut(r)? {
                    *reference = Reference::Upvalue(captured);
                }
            }
            Obj::Reference(_) => {}
            Obj::List(items) => {
                for item in items {
                    self.promote_inner(item, base, top, visited)?;
                }
            }
            Obj::Map(map) => {
                for value in map.values().copied().collect::<Vec<_>>() {
                    self.promote_inner(value, base, top, visited)?;
                }
            }
            Obj::StructInstance { fields, .. } => {
                for field in fields {
                    self.promote_inner(field, base, top, visited)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl GcRef {
    pub(crate) fn index_for_visited(self) -> u32 {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn write_through_a_local_slot_reference_round_trips() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        vm.set_slot(0, Value::number(10.0));
        let r = vm.make_ref_to_local(0).unwrap();
        vm.deref_write(r, Value::number(42.0), true).unwrap();
        assert_eq!(vm.get_slot(0).as_number(), Some(42.0));
        assert_eq!(vm.deref_read(r).unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn slot_write_rebinds_the_global_without_following_through() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        vm.set_slot(0, Value::number(10.0));
        let local_ref = vm.slot_make_ref_to_local(0);
        vm.define_global("g", Value::object(local_ref));
        let g_ref = vm.slot_make_global_ref("g");

        vm.slot_write(g_ref, Value::number(99.0)).unwrap();

        // The global itself now holds 99 directly, not a reference to slot 0.
        assert_eq!(vm.get_global("g").unwrap().as_number(), Some(99.0));
        // Slot 0 was never touched.
        assert_eq!(vm.get_slot(0).as_number(), Some(10.0));
    }

    #[test]
    fn flattening_points_at_ultimate_binding() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        vm.set_slot(0, Value::number(7.0));
        let inner = vm.make_ref_to_local(0).unwrap();
        vm.set_slot(1, Value::object(inner));
        let outer = vm.make_ref_to_local(1).unwrap();
        assert_eq!(outer, inner, "creating a ref to a slot holding a ref should flatten to the ultimate binding");
    }

    #[test]
    fn reference_cycle_is_rejected() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        let r = vm.slot_make_ref_to_local(0);
        vm.set_slot(0, Value::object(r));
        assert!(matches!(vm.deref_read(r), Err(VmError::ReferenceCycle)));
    }

    #[test]
    fn storing_local_slot_ref_into_global_is_rejected() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        let r = vm.slot_make_ref_to_local(0);
        vm.define_global("g", Value::NULL);
        let err = vm.assign_global_checked("g", Value::object(r));
        assert!(matches!(err, Err(VmError::DanglingRefStore)));
    }

    #[test]
    fn list_element_reference_survives_list_rebind() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        let list = vm.heap.alloc(crate::object::Obj::List(vec![Value::number(1.0), Value::number(2.0), Value::number(3.0)]));
        let r = vm.make_index_ref(Value::object(list), Value::number(1.0)).unwrap();
        vm.deref_write(r, Value::number(99.0), true).unwrap();
        if let Ok(crate::object::Obj::List(items)) = vm.heap.get(list) {
            assert_eq!(items[1].as_number(), Some(99.0));
        } else {
            panic!("expected list");
        }
        // Rebinding the slot that *held* the list doesn't affect a ref into
        // the old list object itself: it still reads through fine.
        let _new_list = vm.heap.alloc(crate::object::Obj::List(vec![Value::number(7.0), Value::number(8.0)]));
        assert_eq!(vm.deref_read(r).unwrap().as_number(), Some(99.0));
    }
}
