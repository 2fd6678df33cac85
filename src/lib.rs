//! `zym-vm`: the execution core for the zym scripting language — a
//! register-based bytecode VM with a tracing mark-sweep GC, first-class
//! mutable references, closures, multi-arity dispatch, and one-shot
//! delimited continuations.
//!
//! This crate is the back end only: lexing, parsing, compiling to `Chunk`s,
//! module loading, and native-library bodies are all out of scope and are
//! expected to live in a separate front-end crate that links against this
//! one (directly, or through the `host` module's C ABI).

pub mod chunk;
pub mod continuation;
pub mod error;
pub mod frame;
pub mod host;
pub mod interpreter;
pub mod native;
pub mod object;
pub mod qualifier;
pub mod reference;
pub mod upvalue;
pub mod value;
pub mod vm;

pub use chunk::{Chunk, ChunkRef, Opcode};
pub use error::VmError;
pub use native::{NativeFn, NativeRef};
pub use object::{GcRef, Obj, ObjType, ParamQualifier};
pub use value::Value;
pub use vm::{RunResult, Vm};
