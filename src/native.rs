//! Native bridge contract (C10): signature parsing, the `&mut Vm`-threaded
//! call convention, and the two sentinel values a native function uses to
//! report out-of-band outcomes. Native function *bodies* (string formatting,
//! I/O, collection builtins) are out of scope — this module only implements
//! the calling convention they'd plug into.
//!
//! The original ABI this is grounded on is a C-style table of per-arity
//! function-pointer slots (arity 0 through 26). A `fn(&mut Vm, &[Value])
//! -> Value` slice-based signature collapses that table into one Rust type
//! without losing the arity cap, which is the part of the contract that is
//! actually load-bearing (callers must not register functions no embedder
//! could call).

use std::fmt;

use crate::error::VmError;
use crate::object::ParamQualifier;
use crate::value::Value;
use crate::vm::Vm;

/// Hard cap on a native function's parameter count (§4.10).
pub const MAX_NATIVE_ARITY: usize = 26;

pub type NativeFn = fn(&mut Vm, args: &[Value]) -> Value;

/// A registered native function: its dispatch signature plus the Rust
/// function pointer the call protocol invokes.
#[derive(Clone, Copy)]
pub struct NativeRef {
    pub name: &'static str,
    pub arity: usize,
    pub qualifiers: &'static [ParamQualifier],
    pub func: NativeFn,
}

impl fmt::Debug for NativeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRef").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

impl NativeRef {
    pub const fn new(name: &'static str, qualifiers: &'static [ParamQualifier], func: NativeFn) -> Self {
        NativeRef { name, arity: qualifiers.len(), qualifiers, func }
    }
}

/// Parse a textual signature of the form `"name(q, q, q)"` where each `q` is
/// one of `_`/`normal`, `val`, `clone`, `ref`, `slot`, `typeof` (§4.6). Used
/// by host-side registration code that builds signatures at runtime rather
/// than from a `&'static` qualifier list.
pub fn parse_signature(sig: &str) -> Result<(String, Vec<ParamQualifier>), VmError> {
    let open = sig.find('(').ok_or_else(|| VmError::message(format!("malformed native signature '{sig}'")))?;
    let close = sig.rfind(')').ok_or_else(|| VmError::message(format!("malformed native signature '{sig}'")))?;
    if close < open {
        return Err(VmError::message(format!("malformed native signature '{sig}'")));
    }
    let name = sig[..open].trim().to_string();
    let body = sig[open + 1..close].trim();
    let qualifiers = if body.is_empty() {
        Vec::new()
    } else {
        body.split(',').map(|tok| parse_qualifier(tok.trim())).collect::<Result<Vec<_>, _>>()?
    };
    if qualifiers.len() > MAX_NATIVE_ARITY {
        return Err(VmError::message(format!(
            "native function '{name}' declares {} parameters, exceeding the {MAX_NATIVE_ARITY}-parameter limit",
            qualifiers.len()
        )));
    }
    Ok((name, qualifiers))
}

fn parse_qualifier(tok: &str) -> Result<ParamQualifier, VmError> {
    match tok {
        "_" | "normal" => Ok(ParamQualifier::Normal),
        "val" => Ok(ParamQualifier::Val),
        "clone" => Ok(ParamQualifier::Clone),
        "ref" => Ok(ParamQualifier::Ref),
        "slot" => Ok(ParamQualifier::Slot),
        "typeof" => Ok(ParamQualifier::Typeof),
        other => Err(VmError::message(format!("unknown parameter qualifier '{other}'"))),
    }
}

/// Reserved enum pattern a native function returns to report a failure
/// in-band, without the core having to special-case a `Result`-shaped FFI
/// return type. No legitimate `enum` value the core itself ever constructs
/// uses this type-id.
pub fn error_sentinel() -> Value {
    Value::enum_value(0xFFFF, 0xFFFE)
}

/// Reserved pattern signaling that the native already transferred control
/// directly (e.g. by calling `Vm::resume`/`Vm::abort` itself) — the
/// interpreter must not treat the return value as the call's result or
/// advance past it normally.
pub fn control_transfer_sentinel() -> Value {
    Value::enum_value(0xFFFF, 0xFFFD)
}

fn is_error_sentinel(v: Value) -> bool {
    v.as_enum() == Some((0xFFFF, 0xFFFE))
}

fn is_control_transfer_sentinel(v: Value) -> bool {
    v.as_enum() == Some((0xFFFF, 0xFFFD))
}

impl Vm {
    /// Invoke a native function with already-materialized arguments (the
    /// qualifier transform in `qualifier.rs` runs before this). `Ok(None)`
    /// means control was already transferred by the native itself and the
    /// caller must not write a return value or resume normal sequencing.
    pub fn call_native(&mut self, native: &NativeRef, args: &[Value]) -> Result<Option<Value>, VmError> {
        if args.len() != native.arity {
            return Err(VmError::ArityMismatch { expected: native.arity, got: args.len() });
        }
        let result = (native.func)(self, args);
        if is_error_sentinel(result) {
            return Err(VmError::NativeReport(format!("native function '{}' reported an error", native.name)));
        }
        if is_control_transfer_sentinel(result) {
            return Ok(None);
        }
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_multi_parameter_signature() {
        let (name, qualifiers) = parse_signature("push(normal, ref)").unwrap();
        assert_eq!(name, "push");
        assert_eq!(qualifiers, vec![ParamQualifier::Normal, ParamQualifier::Ref]);
    }

    #[test]
    fn parses_zero_arity() {
        let (name, qualifiers) = parse_signature("len()").unwrap();
        assert_eq!(name, "len");
        assert!(qualifiers.is_empty());
    }

    #[test]
    fn rejects_unknown_qualifier() {
        assert!(parse_signature("f(bogus)").is_err());
    }

    #[test]
    fn rejects_excess_arity() {
        let many = (0..30).map(|_| "_").collect::<Vec<_>>().join(",");
        let sig = format!("f({many})");
        assert!(parse_signature(&sig).is_err());
    }

    fn identity_native(_vm: &mut Vm, args: &[Value]) -> Value {
        args[0]
    }

    #[test]
    fn call_native_checks_arity() {
        let mut vm = Vm::new();
        let native = NativeRef::new("identity", &[ParamQualifier::Normal], identity_native);
        let err = vm.call_native(&native, &[]);
        assert!(matches!(err, Err(VmError::ArityMismatch { .. })));
    }

    #[test]
    fn call_native_surfaces_error_sentinel_as_native_report() {
        fn failing(_vm: &mut Vm, _args: &[Value]) -> Value {
            error_sentinel()
        }
        let mut vm = Vm::new();
        let native = NativeRef::new("failing", &[], failing);
        let err = vm.call_native(&native, &[]);
        assert!(matches!(err, Err(VmError::NativeReport(_))));
    }

    #[test]
    fn call_native_returns_none_on_control_transfer() {
        fn transferring(_vm: &mut Vm, _args: &[Value]) -> Value {
            control_transfer_sentinel()
        }
        let mut vm = Vm::new();
        let native = NativeRef::new("transferring", &[], transferring);
        assert_eq!(vm.call_native(&native, &[]).unwrap(), None);
    }
}
