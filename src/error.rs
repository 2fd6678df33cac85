//! Runtime error taxonomy and host-facing formatting.
//!
//! All fallible core operations return `Result<T, VmError>` and propagate
//! with `?`. There is no in-VM try/catch: an error unwinds the whole
//! `Vm::run` call, matching the propagation policy in the specification.

use std::fmt;

use crate::value::Value;

/// A single frame of context captured when an error is formatted for the host.
#[derive(Debug, Clone)]
pub struct ErrorFrame {
    pub module: String,
    pub function: Option<String>,
    pub line: u32,
}

/// Runtime error taxonomy, surfaced to the host as `RunResult::RuntimeError`.
#[derive(Debug, Clone)]
pub enum VmError {
    /// Operand kind does not match the opcode's contract.
    TypeMismatch { expected: &'static str, got: &'static str, op: &'static str },
    /// Call with the wrong argument count, or no dispatcher overload matches.
    ArityMismatch { expected: usize, got: usize },
    /// No dispatcher overload accepts `got` arguments.
    NoOverload { got: usize },
    /// List index or struct field index out of range.
    OutOfBounds { index: i64, len: usize },
    /// Struct field absent on instance, or reference creation against a missing key/index.
    KeyMissing { key: String },
    /// `%` with a zero divisor.
    DivByZero,
    /// Reference chain depth limit exceeded, or post-write re-dereference failed.
    ReferenceCycle,
    /// Attempt to store a `LocalSlot` reference into a global.
    DanglingRefStore,
    /// Frame count or value-stack size would exceed the fixed caps.
    StackOverflow,
    /// Global name not bound.
    UndefinedIdentifier(String),
    /// A native function reported an error via `ERROR_SENTINEL`.
    NativeReport(String),
    /// Delimited-continuation tag not found, or a one-shot continuation reused.
    ContinuationMisuse(&'static str),
    /// Enum values of differing type-ids compared for equality/ordering.
    IncomparableEnum,
    /// Instruction stream exhausted or malformed (defensive — should not occur
    /// against a well-formed `Chunk`).
    MalformedChunk(&'static str),

    /// A free-form message, used for error paths not worth a dedicated variant.
    Message(String),
}

impl VmError {
    pub fn type_mismatch(op: &'static str, expected: &'static str, got: &Value) -> Self {
        VmError::TypeMismatch { expected, got: got.type_name(), op }
    }

    pub fn message(msg: impl Into<String>) -> Self {
        VmError::Message(msg.into())
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::TypeMismatch { expected, got, op } => {
                write!(f, "{op}: expected {expected}, got {got}")
            }
            VmError::ArityMismatch { expected, got } => {
                write!(f, "expected {expected} argument(s), got {got}")
            }
            VmError::NoOverload { got } => write!(f, "no overload accepts {got} argument(s)"),
            VmError::OutOfBounds { index, len } => {
                write!(f, "index {index} out of bounds for length {len}")
            }
            VmError::KeyMissing { key } => write!(f, "key '{key}' is missing"),
            VmError::DivByZero => write!(f, "division by zero"),
            VmError::ReferenceCycle => write!(f, "reference cycle or depth limit exceeded"),
            VmError::DanglingRefStore => {
                write!(f, "cannot store a local-slot reference into a global")
            }
            VmError::StackOverflow => write!(f, "stack overflow"),
            VmError::UndefinedIdentifier(name) => write!(f, "undefined identifier '{name}'"),
            VmError::NativeReport(msg) => write!(f, "{msg}"),
            VmError::ContinuationMisuse(msg) => write!(f, "{msg}"),
            VmError::IncomparableEnum => {
                write!(f, "cannot compare enum values of different types")
            }
            VmError::MalformedChunk(msg) => write!(f, "malformed chunk: {msg}"),
            VmError::Message(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for VmError {}

impl From<String> for VmError {
    fn from(s: String) -> Self {
        VmError::Message(s)
    }
}

/// Render a runtime error the way the host's diagnostic sink expects:
/// `<message>\n[<module>] line <n>\n    at ... (called from ...)` for each frame.
pub fn format_runtime_error(err: &VmError, frames: &[ErrorFrame]) -> String {
    let mut out = format!("{err}");
    for (i, frame) in frames.iter().enumerate() {
        let at = frame.function.as_deref().unwrap_or("<anonymous>");
        out.push('\n');
        out.push_str(&format!("[{}] line {}\n    at {}", frame.module, frame.line, at));
        if i + 1 < frames.len() {
            out.push_str(&format!(" (called from {})", frames[i + 1].module));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_human_readable() {
        let err = VmError::DivByZero;
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn format_includes_every_frame() {
        let err = VmError::UndefinedIdentifier("x".into());
        let frames = vec![
            ErrorFrame { module: "main".into(), function: Some("f".into()), line: 3 },
            ErrorFrame { module: "main".into(), function: Some("g".into()), line: 10 },
        ];
        let rendered = format_runtime_error(&err, &frames);
        assert!(rendered.contains("undefined identifier 'x'"));
        assert!(rendered.contains("[main] line 3"));
        assert!(rendered.contains("[main] line 10"));
        assert!(rendered.contains("called from main"));
    }
}
