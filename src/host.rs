//! Host/embedding API (§4.9, C9): the interface a host — whether it is
//! Rust code driving a `Vm` directly or a C caller linking against the
//! `extern "C"` shims below — uses to load chunks, call functions by name,
//! and register natives. The front end that produces `Chunk`s and wires
//! `"name@arity"` globals is out of scope here; this module only implements
//! the runtime side of that contract.
//!
//! The `extern "C"` shims mirror the teacher's `patch_seq_*` naming and
//! `#[unsafe(no_mangle)]` style (`runtime/src/arithmetic.rs`), adapted to an
//! opaque `Vm` handle instead of a raw tagged-stack pointer, since this
//! runtime's state (heap, frames, globals) does not fit in a bare pointer
//! the way a stack-machine value does.

use crate::chunk::Chunk;
use crate::error::VmError;
use crate::frame::CallFrame;
use crate::native::{parse_signature, NativeFn, NativeRef};
use crate::object::{Closure, Function, GcRef, Obj, ObjType, ParamQualifier, QualifierSig};
use crate::value::Value;
use crate::vm::{RunResult, Vm};

impl Vm {
    /// Register `chunk` as a zero-arity top-level function and run it to
    /// completion, the way a host runs a freshly compiled script (§6
    /// `runChunk`). `max_regs` is supplied by the caller because the
    /// compiler that would normally compute it is out of scope here.
    pub fn run_chunk(&mut self, chunk: Chunk, max_regs: usize) -> RunResult {
        let chunk_ref = self.register_chunk(chunk);
        let closure_ref = self.make_closure(chunk_ref, 0, max_regs, Vec::new(), None, "<script>".to_string());
        match self.begin_host_call(closure_ref, &[]) {
            Ok(()) => self.run(),
            Err(e) => {
                let frames = self.error_frames();
                RunResult::RuntimeError(crate::error::format_runtime_error(&e, &frames))
            }
        }
    }

    /// `prepare(name, arity)`: name-mangle to `"name@arity"`, look up the
    /// bound closure, and reset the API stack. Returns `false` if no such
    /// closure is bound (unbound name, wrong arity, or bound to something
    /// other than a closure).
    pub fn prepare(&mut self, name: &str, arity: usize) -> bool {
        let mangled = format!("{name}@{arity}");
        let Some(v) = self.global_slot_for(&mangled).map(|slot| self.get_global_slot(slot)) else {
            return false;
        };
        let is_closure = matches!(v.as_object(), Some(r) if self.heap.get(r).map(|o| o.type_tag()) == Ok(ObjType::Closure));
        if !is_closure {
            return false;
        }
        self.prepared = Some(v);
        self.api_stack.clear();
        true
    }

    pub fn push_number(&mut self, n: f64) {
        self.api_stack.push(Value::number(n));
    }

    pub fn push_string(&mut self, s: &str) {
        let r = self.heap.intern_string(s);
        self.api_stack.push(Value::object(r));
    }

    pub fn push_null(&mut self) {
        self.api_stack.push(Value::NULL);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.api_stack.push(Value::bool(b));
    }

    /// `execute(argc)`: enter the `prepare`d closure with a synthetic caller
    /// frame whose `caller_chunk` is the trampoline chunk; when the callee
    /// returns, the frame stack empties and `run` hands back `RunResult::Ok`
    /// directly (the primary termination path — the trampoline's own `HALT`
    /// instruction is never actually reached). The result is left on top of
    /// the API stack for `get_result`.
    pub fn execute(&mut self, argc: usize) -> RunResult {
        let Some(closure) = self.prepared else {
            return RunResult::RuntimeError("execute called with no prepared closure".to_string());
        };
        if argc != self.api_stack.len() {
            return RunResult::RuntimeError(format!(
                "execute: argc {argc} does not match {} pushed argument(s)",
                self.api_stack.len()
            ));
        }
        let args = std::mem::take(&mut self.api_stack);
        let closure_ref = closure.as_object().expect("prepared value is always an object");
        let result = match self.begin_host_call(closure_ref, &args) {
            Ok(()) => self.run(),
            Err(e) => {
                let frames = self.error_frames();
                RunResult::RuntimeError(crate::error::format_runtime_error(&e, &frames))
            }
        };
        if let RunResult::Ok(v) = result {
            self.api_stack.push(v);
        }
        result
    }

    /// `getResult()`: the top of the API stack left by the last `execute`.
    pub fn get_result(&self) -> Value {
        self.api_stack.last().copied().unwrap_or(Value::NULL)
    }

    /// `defineNative(signature, fn_ptr)`: parse a `"name(q, q, ...)"`
    /// signature (§4.10) and bind a global holding the native function,
    /// callable through the ordinary `CALL` path like any closure.
    ///
    /// `NativeRef` needs `'static` storage for its name and qualifier list;
    /// since the signature is only known at registration time, both are
    /// leaked. Natives are expected to live for the process's lifetime, the
    /// same assumption the compile-time `NativeRef::new` constructor makes
    /// for its `&'static` literals.
    pub fn define_native(&mut self, signature: &str, func: NativeFn) -> bool {
        let Ok((name, qualifiers)) = parse_signature(signature) else {
            return false;
        };
        let name_static: &'static str = Box::leak(name.clone().into_boxed_str());
        let qualifiers_static: &'static [ParamQualifier] = Box::leak(qualifiers.into_boxed_slice());
        let native = NativeRef { name: name_static, arity: qualifiers_static.len(), qualifiers: qualifiers_static, func };
        self.define_native_global(&name, native);
        true
    }

    /// Build a `Function`+`Closure` pair for a chunk with no upvalues, as a
    /// host-registered top-level entry point would need (§4.3).
    fn make_closure(
        &mut self,
        chunk_ref: crate::chunk::ChunkRef,
        arity: usize,
        max_regs: usize,
        qualifiers: Vec<ParamQualifier>,
        name: Option<String>,
        module: String,
    ) -> GcRef {
        let qualifier_sig = if qualifiers.iter().all(|q| matches!(q, ParamQualifier::Normal)) {
            QualifierSig::AllNormal
        } else if qualifiers.is_empty() {
            QualifierSig::AllNormalNoRefs
        } else {
            QualifierSig::HasQualifiers
        };
        let function = Function { chunk: chunk_ref, arity, max_regs, upvalues: Vec::new(), qualifiers, qualifier_sig, name, module };
        let function_ref = self.heap.alloc(Obj::Function(function));
        self.heap.alloc(Obj::Closure(Closure { function: function_ref, upvalues: Vec::new() }))
    }

    /// Push the synthetic caller frame `execute`/`run_chunk` need: arguments
    /// land at stack slot 0, the callee's own registers follow, and the
    /// result slot sits just past the callee's register window where
    /// nothing it does can clobber it.
    fn begin_host_call(&mut self, closure_ref: GcRef, args: &[Value]) -> Result<(), VmError> {
        let function = match self.heap.get(closure_ref)? {
            Obj::Closure(c) => match self.heap.get(c.function)? {
                Obj::Function(f) => f.clone(),
                _ => return Err(VmError::message("closure's function slot is not a function")),
            },
            _ => return Err(VmError::message("prepared value is not a closure")),
        };
        if function.arity != args.len() {
            return Err(VmError::ArityMismatch { expected: function.arity, got: args.len() });
        }
        let base = 0;
        let result_slot = base + function.max_regs;
        self.ensure_capacity(result_slot + 1)?;
        self.stack_top = self.stack_top.max(base + function.max_regs);
        for (i, v) in args.iter().enumerate() {
            self.set_slot(base + i, *v);
        }
        self.frames.push(CallFrame { closure: closure_ref, resume_ip: 0, stack_base: base, caller_chunk: self.trampoline_chunk, return_slot: result_slot });
        Ok(())
    }
}

// ============================================================================
// C ABI shims
// ============================================================================
//
// An opaque `Vm` handle crosses the boundary as a raw pointer the host owns
// and passes back unchanged; these functions never retain it past the call.
// Numbers/bools use C's own `f64`/`bool`; strings are borrowed, NUL-terminated
// `*const c_char` read immediately and copied (interned) before returning.

use std::ffi::{c_char, CStr};

/// Create a fresh VM. The host owns the returned pointer and must release it
/// with [`zym_free`].
///
/// # Safety
/// Always safe to call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_init() -> *mut Vm {
    Box::into_raw(Box::new(Vm::new()))
}

/// Destroy a VM created by [`zym_init`].
///
/// # Safety
/// `vm` must be a pointer returned by `zym_init`, not already freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_free(vm: *mut Vm) {
    if !vm.is_null() {
        drop(unsafe { Box::from_raw(vm) });
    }
}

/// Stable `RunResult` discriminant for the C side.
#[repr(i32)]
pub enum ZymRunResult {
    Ok = 0,
    CompileError = 1,
    RuntimeError = 2,
    Yield = 3,
}

fn tag_result(vm: &mut Vm, result: RunResult) -> ZymRunResult {
    match result {
        RunResult::Ok(v) => {
            vm.api_stack.clear();
            vm.api_stack.push(v);
            ZymRunResult::Ok
        }
        RunResult::CompileError(msg) => {
            tracing::error!(error = %msg, "compile error");
            ZymRunResult::CompileError
        }
        RunResult::RuntimeError(msg) => {
            tracing::error!(error = %msg, "runtime error");
            ZymRunResult::RuntimeError
        }
        RunResult::Yield => ZymRunResult::Yield,
    }
}

/// `prepare(name, arity) -> bool`.
///
/// # Safety
/// `vm` and `name` must be valid, non-null; `name` must be NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_prepare(vm: *mut Vm, name: *const c_char, arity: usize) -> bool {
    let vm = unsafe { &mut *vm };
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    vm.prepare(&name, arity)
}

/// # Safety
/// `vm` must be valid and non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_push_number(vm: *mut Vm, value: f64) {
    unsafe { &mut *vm }.push_number(value);
}

/// # Safety
/// `vm` and `s` must be valid, non-null; `s` must be NUL-terminated.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_push_string(vm: *mut Vm, s: *const c_char) {
    let vm = unsafe { &mut *vm };
    let s = unsafe { CStr::from_ptr(s) }.to_string_lossy();
    vm.push_string(&s);
}

/// # Safety
/// `vm` must be valid and non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_push_null(vm: *mut Vm) {
    unsafe { &mut *vm }.push_null();
}

/// # Safety
/// `vm` must be valid and non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_push_bool(vm: *mut Vm, value: bool) {
    unsafe { &mut *vm }.push_bool(value);
}

/// `execute(argc) -> RunResult`.
///
/// # Safety
/// `vm` must be valid and non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_execute(vm: *mut Vm, argc: usize) -> ZymRunResult {
    let vm = unsafe { &mut *vm };
    let result = vm.execute(argc);
    tag_result(vm, result)
}

/// `getResult() -> Value`, returned as a number; callers that need the full
/// tagged `Value` should stay on the Rust API.
///
/// # Safety
/// `vm` must be valid and non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_get_result_number(vm: *mut Vm) -> f64 {
    unsafe { &*vm }.get_result().as_number().unwrap_or(f64::NAN)
}

/// # Safety
/// `vm` must be valid and non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_set_preemption_enabled(vm: *mut Vm, enabled: bool) {
    unsafe { &mut *vm }.set_preemption_enabled(enabled);
}

/// # Safety
/// `vm` must be valid and non-null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn zym_request_preempt(vm: *mut Vm) {
    unsafe { &mut *vm }.request_preempt();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Opcode;

    fn ret_const_chunk(n: f64) -> Chunk {
        let mut c = Chunk::new("t");
        let idx = c.add_constant(Value::number(n));
        c.push_bx(Opcode::LoadConst, 0, idx, 1);
        c.push(Opcode::Ret, 0, 0, 0, 1);
        c
    }

    #[test]
    fn run_chunk_returns_the_callee_result() {
        let mut vm = Vm::new();
        let result = vm.run_chunk(ret_const_chunk(42.0), 1);
        match result {
            RunResult::Ok(v) => assert_eq!(v.as_number(), Some(42.0)),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn prepare_rejects_an_unbound_name() {
        let mut vm = Vm::new();
        assert!(!vm.prepare("missing", 0));
    }

    #[test]
    fn prepare_execute_get_result_round_trip() {
        let mut vm = Vm::new();
        let mut c = Chunk::new("add_one");
        // in-place add-immediate: reg0 += 1, then return reg0
        c.push_bx(Opcode::AddI, 0, 1u16, 1);
        c.push(Opcode::Ret, 0, 0, 0, 1);
        let chunk_ref = vm.register_chunk(c);
        let closure_ref = vm.make_closure(chunk_ref, 1, 1, vec![ParamQualifier::Normal], Some("add-one".to_string()), "<test>".to_string());
        vm.define_global("add-one@1", Value::object(closure_ref));

        assert!(vm.prepare("add-one", 1));
        vm.push_number(41.0);
        match vm.execute(1) {
            RunResult::Ok(v) => assert_eq!(v.as_number(), Some(42.0)),
            other => panic!("expected Ok, got {other:?}"),
        }
        assert_eq!(vm.get_result().as_number(), Some(42.0));
    }

    #[test]
    fn define_native_binds_a_callable_global() {
        fn double(_vm: &mut Vm, args: &[Value]) -> Value {
            Value::number(args[0].as_number().unwrap() * 2.0)
        }
        let mut vm = Vm::new();
        assert!(vm.define_native("double(normal)", double));
        let v = vm.get_global("double").unwrap();
        let r = v.as_object().unwrap();
        assert_eq!(vm.heap().get(r).unwrap().type_tag(), ObjType::NativeFunction);
    }
}
