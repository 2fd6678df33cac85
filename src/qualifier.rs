//! Parameter-qualifier transform (§4.6): what a callee's parameter slot
//! actually receives, given the qualifier declared on it and the value (and,
//! for reference-producing qualifiers, the caller-side stack slot) the
//! argument came from.

use std::collections::HashMap;

use crate::error::VmError;
use crate::object::{Obj, ParamQualifier};
use crate::value::Value;
use crate::vm::Vm;

impl Vm {
    /// Materialize one argument according to its parameter's qualifier.
    /// `origin` is the absolute caller-frame stack slot the argument value
    /// came from, when it has one (a plain register read) — `None` for a
    /// value with no addressable origin (e.g. a literal or sub-expression
    /// result), which only `Normal`/`Val`/`Clone`/`Typeof`/`Slot` can accept
    /// (`Slot` passes `value` straight through, so it never needs `origin`).
    pub fn materialize_argument(&mut self, qualifier: ParamQualifier, value: Value, origin: Option<usize>) -> Result<Value, VmError> {
        match qualifier {
            ParamQualifier::Normal => self.auto_deref(value),
            ParamQualifier::Val => {
                let v = self.auto_deref(value)?;
                self.shallow_clone(v)
            }
            ParamQualifier::Clone => {
                let v = self.auto_deref(value)?;
                self.deep_clone(v)
            }
            ParamQualifier::Ref => {
                let slot = origin.ok_or(VmError::MalformedChunk("REF argument has no addressable origin"))?;
                Ok(Value::object(self.make_ref_to_local(slot)?))
            }
            ParamQualifier::Slot => Ok(value),
            ParamQualifier::Typeof => {
                let name = self.typeof_name(value)?;
                Ok(Value::object(self.heap.intern_string(&name)))
            }
        }
    }

    /// Bulk form used by the call protocol (§4.6/§4.7) once it has resolved
    /// each argument's qualifier and caller-side origin.
    pub fn materialize_arguments(
        &mut self,
        qualifiers: &[ParamQualifier],
        values: &[Value],
        origins: &[Option<usize>],
    ) -> Result<Vec<Value>, VmError> {
        qualifiers
            .iter()
            .zip(values.iter())
            .zip(origins.iter())
            .map(|((&q, &v), &o)| self.materialize_argument(q, v, o))
            .collect()
    }

    /// If `v` is a reference, read through it; otherwise return it
    /// unchanged. The default (`Normal`) binding behavior.
    pub(crate) fn auto_deref(&self, v: Value) -> Result<Value, VmError> {
        match v.as_object() {
            Some(r) if self.is_reference(r)? => self.deref_read(r),
            _ => Ok(v),
        }
    }

    /// `typeof` semantics (§4.6 `TYPEOF` qualifier, and the `TYPEOF`
    /// opcode): the fixed primitive name for scalars, the heap object's own
    /// tag name for everything else. Never dereferences a reference.
    pub fn typeof_name(&self, v: Value) -> Result<String, VmError> {
        match v.as_object() {
            Some(r) => Ok(self.heap.get(r)?.type_tag().to_string()),
            None => Ok(v.type_name().to_string()),
        }
    }

    /// Shallow copy (`CLONE_VALUE`): containers get a fresh heap object one
    /// level deep, elements are shared; everything else (scalars, strings,
    /// references, closures, ...) has no value semantics and passes through
    /// unchanged, references included — a reference is cloned by identity.
    pub fn shallow_clone(&mut self, v: Value) -> Result<Value, VmError> {
        let Some(r) = v.as_object() else { return Ok(v) };
        let obj = self.heap.get(r)?.clone();
        match obj {
            Obj::List(items) => Ok(Value::object(self.heap.alloc(Obj::List(items)))),
            Obj::Map(map) => Ok(Value::object(self.heap.alloc(Obj::Map(map)))),
            Obj::StructInstance { schema, fields } => Ok(Value::object(self.heap.alloc(Obj::StructInstance { schema, fields }))),
            _ => Ok(v),
        }
    }

    /// Recursively duplicate a container value (list/map/struct); scalars
    /// and every other object kind (strings are immutable and interned,
    /// closures/functions/references/etc. have no value semantics) pass
    /// through unchanged.
    pub fn deep_clone(&mut self, v: Value) -> Result<Value, VmError> {
        let Some(r) = v.as_object() else { return Ok(v) };
        let obj = self.heap.get(r)?.clone();
        match obj {
            Obj::List(items) => {
                let mut cloned = Vec::with_capacity(items.len());
                for item in items {
                    cloned.push(self.deep_clone(item)?);
                }
                Ok(Value::object(self.heap.alloc(Obj::List(cloned))))
            }
            Obj::Map(map) => {
                let mut cloned = HashMap::with_capacity(map.len());
                for (k, val) in map {
                    cloned.insert(k, self.deep_clone(val)?);
                }
                Ok(Value::object(self.heap.alloc(Obj::Map(cloned))))
            }
            Obj::StructInstance { schema, fields } => {
                let mut cloned = Vec::with_capacity(fields.len());
                for f in fields {
                    cloned.push(self.deep_clone(f)?);
                }
                Ok(Value::object(self.heap.alloc(Obj::StructInstance { schema, fields: cloned })))
            }
            _ => Ok(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_auto_derefs_a_reference_argument() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        vm.set_slot(0, Value::number(42.0));
        let r = vm.make_ref_to_local(0).unwrap();
        let materialized = vm.materialize_argument(ParamQualifier::Normal, Value::object(r), None).unwrap();
        assert_eq!(materialized.as_number(), Some(42.0));
    }

    #[test]
    fn ref_qualifier_produces_a_reference_to_the_origin_slot() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        vm.set_slot(2, Value::number(7.0));
        let materialized = vm.materialize_argument(ParamQualifier::Ref, Value::number(7.0), Some(2)).unwrap();
        let r = materialized.as_object().unwrap();
        assert!(vm.is_reference(r).unwrap());
        assert_eq!(vm.deref_read(r).unwrap().as_number(), Some(7.0));
    }

    #[test]
    fn val_shallow_copies_so_the_callers_container_is_unaffected() {
        let mut vm = Vm::new();
        let list = vm.heap_mut().alloc(Obj::List(vec![Value::number(1.0)]));
        let materialized = vm.materialize_argument(ParamQualifier::Val, Value::object(list), None).unwrap();
        let copy_ref = materialized.as_object().unwrap();
        assert_ne!(copy_ref, list, "val must not hand out the caller's own container");

        match vm.heap_mut().get_mut(copy_ref).unwrap() {
            Obj::List(items) => items.push(Value::number(2.0)),
            _ => panic!("expected list"),
        }
        if let Obj::List(items) = vm.heap().get(list).unwrap() {
            assert_eq!(items.len(), 1, "mutating the param's top level must not write through to the caller's list");
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn slot_passes_the_argument_through_unchanged() {
        let mut vm = Vm::new();
        vm.ensure_capacity(4).unwrap();
        vm.set_slot(1, Value::number(9.0));
        let materialized = vm.materialize_argument(ParamQualifier::Slot, Value::number(9.0), Some(1)).unwrap();
        assert_eq!(materialized.as_number(), Some(9.0), "a plain value must pass through, not be rewrapped as a reference");

        let list = vm.heap_mut().alloc(Obj::List(vec![]));
        let materialized = vm.materialize_argument(ParamQualifier::Slot, Value::object(list), Some(1)).unwrap();
        assert_eq!(materialized.as_object().unwrap(), list, "an existing reference or object must be forwarded as-is");
    }

    #[test]
    fn clone_deep_copies_a_list_so_mutation_does_not_alias() {
        let mut vm = Vm::new();
        let inner = vm.heap_mut().alloc(Obj::List(vec![Value::number(1.0)]));
        let outer = vm.heap_mut().alloc(Obj::List(vec![Value::object(inner)]));
        let cloned = vm.materialize_argument(ParamQualifier::Clone, Value::object(outer), None).unwrap();
        let cloned_ref = cloned.as_object().unwrap();
        assert_ne!(cloned_ref, outer);
        if let Obj::List(items) = vm.heap().get(cloned_ref).unwrap() {
            assert_ne!(items[0].as_object().unwrap(), inner, "nested list must be deep-cloned too");
        } else {
            panic!("expected list");
        }
    }

    #[test]
    fn typeof_reports_the_object_tag_not_dereferenced_value() {
        let mut vm = Vm::new();
        let list = vm.heap_mut().alloc(Obj::List(vec![]));
        assert_eq!(vm.typeof_name(Value::object(list)).unwrap(), "list");
        assert_eq!(vm.typeof_name(Value::number(1.0)).unwrap(), "number");
    }
}
