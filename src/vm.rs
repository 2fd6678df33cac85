//! VM state: stacks, frames, globals, heap, and the pieces every other
//! module's `impl Vm` block builds on. The dispatch loop itself lives in
//! `interpreter.rs`; this module owns construction, the growable value
//! stack, global-variable storage (with inline-cache slots), and the
//! GC-root collection that ties everything together for `Heap::collect`.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::continuation::{PromptEntry, ResumeEntry, WithPromptEntry};
use crate::error::{ErrorFrame, VmError};
use crate::frame::{CallFrame, FRAMES_MAX, STACK_INITIAL, STACK_MAX};
use crate::object::{GcRef, Heap, Obj};
use crate::value::Value;

/// Timeslice budget for cooperative preemption (§5).
pub const DEFAULT_TIMESLICE: u32 = 10_000;

/// Outcome of a top-level `Vm::run` call (§6 `runChunk`).
#[derive(Debug)]
pub enum RunResult {
    Ok(Value),
    CompileError(String),
    RuntimeError(String),
    Yield,
}

pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) stack_top: usize,
    pub(crate) frames: Vec<CallFrame>,

    pub(crate) chunks: Vec<Chunk>,
    pub(crate) heap: Heap,

    /// Global slots hold plain `Value`s uniformly — a native function is a
    /// `Value::object` pointing at a heap `Obj::NativeFunction`, just like a
    /// closure points at `Obj::Closure`, so the call protocol never needs to
    /// special-case how a callee was bound (§4.7/§4.10).
    pub(crate) globals: Vec<Value>,
    pub(crate) global_names: HashMap<String, u32>,

    /// Head of the open-upvalue list, ordered by descending stack slot.
    pub(crate) open_upvalues: Option<GcRef>,

    pub(crate) prompt_stack: Vec<PromptEntry>,
    pub(crate) resume_stack: Vec<ResumeEntry>,
    pub(crate) with_prompt_stack: Vec<WithPromptEntry>,

    pub(crate) preemption_enabled: bool,
    pub(crate) yield_budget: u32,
    pub(crate) preempt_requested: bool,

    /// Scratch stack used by the host embedding API (§4.9) for
    /// `prepare`/`push*`/`execute`/`getResult`.
    pub(crate) api_stack: Vec<Value>,
    pub(crate) trampoline_chunk: u32,
    /// The closure `prepare` resolved, awaiting `execute`.
    pub(crate) prepared: Option<Value>,
}

pub const MAX_PROMPTS: usize = 32;
pub const MAX_RESUME_DEPTH: usize = 16;
pub const MAX_WITH_PROMPT_DEPTH: usize = 16;

impl Vm {
    pub fn new() -> Self {
        let mut chunks = Vec::new();
        chunks.push(Chunk::trampoline());
        Vm {
            stack: vec![Value::NULL; STACK_INITIAL],
            stack_top: 0,
            frames: Vec::with_capacity(FRAMES_MAX),
            chunks,
            heap: Heap::new(),
            globals: Vec::new(),
            global_names: HashMap::new(),
            open_upvalues: None,
            prompt_stack: Vec::new(),
            resume_stack: Vec::new(),
            with_prompt_stack: Vec::new(),
            preemption_enabled: false,
            yield_budget: DEFAULT_TIMESLICE,
            preempt_requested: false,
            api_stack: Vec::new(),
            trampoline_chunk: 0,
            prepared: None,
        }
    }

    pub fn register_chunk(&mut self, chunk: Chunk) -> u32 {
        let idx = self.chunks.len() as u32;
        self.chunks.push(chunk);
        idx
    }

    pub fn chunk(&self, r: u32) -> &Chunk {
        &self.chunks[r as usize]
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    // ---- value-stack access -------------------------------------------------

    /// Grow the stack (doubling) so that slot `needed - 1` exists. Because
    /// `LocalSlot` references and open upvalues store absolute indices,
    /// growing the backing `Vec` never invalidates them — there is no
    /// relocation pass, unlike a raw-pointer implementation.
    pub(crate) fn ensure_capacity(&mut self, needed: usize) -> Result<(), VmError> {
        if needed > STACK_MAX {
            return Err(VmError::StackOverflow);
        }
        if needed > self.stack.len() {
            let mut new_len = self.stack.len().max(STACK_INITIAL);
            while new_len < needed {
                new_len = (new_len * 2).min(STACK_MAX);
            }
            self.stack.resize(new_len, Value::NULL);
        }
        Ok(())
    }

    pub fn push(&mut self, v: Value) -> Result<(), VmError> {
        self.ensure_capacity(self.stack_top + 1)?;
        self.stack[self.stack_top] = v;
        self.stack_top += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.stack_top -= 1;
        self.stack[self.stack_top]
    }

    pub fn get_slot(&self, idx: usize) -> Value {
        self.stack[idx]
    }

    pub fn set_slot(&mut self, idx: usize, v: Value) {
        self.stack[idx] = v;
    }

    // ---- globals -------------------------------------------------------------

    pub fn define_global(&mut self, name: &str, v: Value) -> u32 {
        if let Some(&slot) = self.global_names.get(name) {
            self.globals[slot as usize] = v;
            slot
        } else {
            let slot = self.globals.len() as u32;
            self.globals.push(v);
            self.global_names.insert(name.to_string(), slot);
            slot
        }
    }

    /// Box `native` as a heap `Obj::NativeFunction` and bind it as a global,
    /// so it can be called, stored, and passed around through the same
    /// `CALL` path as a closure (§4.10).
    pub fn define_native_global(&mut self, name: &str, native: crate::native::NativeRef) -> u32 {
        let r = self.heap.alloc(Obj::NativeFunction(native));
        self.define_global(name, Value::object(r))
    }

    pub fn global_slot_for(&self, name: &str) -> Option<u32> {
        self.global_names.get(name).copied()
    }

    pub fn get_global(&self, name: &str) -> Result<Value, VmError> {
        let slot = self.global_names.get(name).ok_or_else(|| VmError::UndefinedIdentifier(name.to_string()))?;
        Ok(self.globals[*slot as usize])
    }

    pub fn get_global_slot(&self, slot: u32) -> Value {
        self.globals[slot as usize]
    }

    pub fn set_global(&mut self, name: &str, v: Value) -> Result<(), VmError> {
        let slot = *self.global_names.get(name).ok_or_else(|| VmError::UndefinedIdentifier(name.to_string()))?;
        self.globals[slot as usize] = v;
        Ok(())
    }

    pub fn set_global_slot(&mut self, slot: u32, v: Value) {
        self.globals[slot as usize] = v;
    }

    // ---- GC ------------------------------------------------------------------

    /// Collect every root this VM knows about and run one GC cycle, if
    /// allocation pressure warrants it.
    pub fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_now();
        }
    }

    pub fn collect_now(&mut self) {
        let roots = self.gather_roots();
        self.heap.collect(roots);
    }

    fn gather_roots(&self) -> Vec<Value> {
        let mut roots = Vec::with_capacity(self.stack_top + self.frames.len() * 2 + self.globals.len());
        roots.extend_from_slice(&self.stack[..self.stack_top]);
        roots.extend_from_slice(&self.api_stack);
        for chunk in &self.chunks {
            roots.extend_from_slice(&chunk.constants);
        }
        for frame in &self.frames {
            roots.push(Value::object(frame.closure));
        }
        if let Some(head) = self.open_upvalues {
            roots.push(Value::object(head));
        }
        roots.extend_from_slice(&self.globals);
        for entry in &self.prompt_stack {
            roots.push(Value::object(entry.tag));
        }
        roots
    }

    /// Frame-by-frame error context for the host's diagnostic sink (§6).
    /// Assumes the caller has synced the live top frame's `resume_ip` to the
    /// interpreter's current `ip` before calling this (done at the single
    /// point `interpreter::run` converts a propagated `VmError`).
    pub(crate) fn error_frames(&self) -> Vec<ErrorFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| {
                let (module, function, chunk_ref) = match self.heap.get(f.closure) {
                    Ok(Obj::Closure(c)) => match self.heap.get(c.function) {
                        Ok(Obj::Function(func)) => (func.module.clone(), func.name.clone(), func.chunk),
                        _ => ("<unknown>".to_string(), None, self.trampoline_chunk),
                    },
                    _ => ("<unknown>".to_string(), None, self.trampoline_chunk),
                };
                let line = self.chunk(chunk_ref).line_at(f.resume_ip);
                ErrorFrame { module, function, line }
            })
            .collect()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
