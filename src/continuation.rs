//! Delimited continuations (§4.8): prompts, one-shot capture, and resume.
//!
//! A prompt installed by `PUSH_PROMPT` records where its body started
//! (`frame_index`/`stack_base`) and where control resumes once the body
//! finishes or is aborted (`resume_ip`/`result_slot`, both in the installing
//! frame). `CAPTURE` snapshots everything above a matching prompt into a
//! `Continuation`; `RESUME` splices that snapshot back onto the live stack at
//! its current position, re-basing every absolute index by the shift between
//! the two positions. The installing frame itself is never part of the
//! snapshot — only the frames/stack *above* it are.

use crate::error::VmError;
use crate::frame::CallFrame;
use crate::object::{Continuation, GcRef, Obj, SavedFrame};
use crate::value::Value;
use crate::vm::{Vm, MAX_PROMPTS, MAX_RESUME_DEPTH, MAX_WITH_PROMPT_DEPTH};

/// One installed `withPrompt` boundary.
#[derive(Debug, Clone)]
pub struct PromptEntry {
    pub tag: GcRef,
    pub frame_index: usize,
    pub stack_base: usize,
    /// Instruction to resume at, in the installing frame's own chunk, once
    /// the body completes (normally or via `ABORT`).
    pub resume_ip: usize,
    /// Absolute stack slot, in the installing frame, that receives the
    /// body's result.
    pub result_slot: usize,
}

/// Parallel bookkeeping purely for the cleanup rule in `prune_prompts_above`:
/// any unwind that drops frames below a prompt's installing frame must
/// invalidate that prompt too, not just the one a `CAPTURE`/`ABORT` targeted
/// by tag.
#[derive(Debug, Clone)]
pub struct WithPromptEntry {
    pub frame_boundary: usize,
}

/// A pending `RESUME`: once the restored frame chain unwinds back down to
/// `frame_boundary` (the resumer's own frame count), the return value is
/// delivered to `result_slot` in the resumer's frame instead of following
/// the (meaningless, post-capture) `return_slot` baked into the bottommost
/// restored frame. `interpreter::run`'s `RET` handling checks this stack
/// before falling back to the popped frame's own `return_slot`.
#[derive(Debug, Clone)]
pub struct ResumeEntry {
    pub frame_boundary: usize,
    pub result_slot: usize,
}

impl Vm {
    pub fn push_prompt(&mut self, tag: GcRef, resume_ip: usize, result_slot: usize) -> Result<(), VmError> {
        if self.prompt_stack.len() >= MAX_PROMPTS {
            return Err(VmError::ContinuationMisuse("too many nested prompts"));
        }
        if self.with_prompt_stack.len() >= MAX_WITH_PROMPT_DEPTH {
            return Err(VmError::ContinuationMisuse("with-prompt nesting too deep"));
        }
        let frame_index = self.frames.len();
        self.prompt_stack.push(PromptEntry { tag, frame_index, stack_base: self.stack_top, resume_ip, result_slot });
        self.with_prompt_stack.push(WithPromptEntry { frame_boundary: frame_index });
        Ok(())
    }

    /// Normal (non-aborted) exit from a `withPrompt` body: `value` is
    /// whatever the body's last expression produced, delivered to the
    /// installing frame's own result slot.
    pub fn pop_prompt(&mut self, value: Value) -> Result<(), VmError> {
        let entry = self.prompt_stack.pop().ok_or(VmError::ContinuationMisuse("POP_PROMPT with no active prompt"))?;
        self.with_prompt_stack.pop();
        self.set_slot(entry.result_slot, value);
        Ok(())
    }

    fn find_prompt(&self, tag: GcRef) -> Result<PromptEntry, VmError> {
        self.prompt_stack
            .iter()
            .rev()
            .find(|p| p.tag == tag)
            .cloned()
            .ok_or(VmError::ContinuationMisuse("no matching prompt for this tag"))
    }

    /// Any event that drops the frame count to `frame_count` invalidates
    /// every prompt installed at or above that depth — not just the one a
    /// `CAPTURE`/`ABORT` explicitly targeted.
    fn prune_prompts_above(&mut self, frame_count: usize) {
        while matches!(self.with_prompt_stack.last(), Some(w) if w.frame_boundary >= frame_count) {
            self.with_prompt_stack.pop();
        }
        while matches!(self.prompt_stack.last(), Some(p) if p.frame_index >= frame_count) {
            self.prompt_stack.pop();
        }
    }

    /// `CAPTURE(tag)`: reify the call-stack slice above the matching prompt
    /// as a one-shot `Continuation`. `resume_ip` is the instruction index,
    /// in the top frame's own chunk, right *after* the `CAPTURE` instruction
    /// itself — what a later `RESUME` restores control to. `dest_slot` is
    /// the absolute stack slot the `CAPTURE` instruction itself targets,
    /// i.e. where `resume`'s argument will later land.
    ///
    /// Normal (non-aborted) completion of a `CAPTURE` behaves like an
    /// implicit abort with the continuation object as the delivered value:
    /// the installing frame resumes at the matching prompt's own
    /// `resume_ip`, skipping the rest of the `withPrompt` body (whose
    /// frames were just unwound).
    pub fn capture(&mut self, tag: GcRef, resume_ip: usize, dest_slot: usize) -> Result<GcRef, VmError> {
        let entry = self.find_prompt(tag)?;
        if let Some(top) = self.frames.last_mut() {
            top.resume_ip = resume_ip;
        }

        let saved_frames: Vec<SavedFrame> = self.frames[entry.frame_index..]
            .iter()
            .map(|f| SavedFrame {
                closure: f.closure,
                resume_ip: f.resume_ip,
                stack_base: f.stack_base,
                caller_chunk: f.caller_chunk,
                return_slot: f.return_slot,
            })
            .collect();
        let saved_values: Vec<Value> = self.stack[entry.stack_base..self.stack_top].to_vec();

        self.close_upvalues_from(entry.stack_base);
        self.frames.truncate(entry.frame_index);
        self.stack_top = entry.stack_base;
        self.prune_prompts_above(entry.frame_index);

        let k = self.heap.alloc(Obj::Continuation(Continuation {
            tag,
            frames: saved_frames,
            values: saved_values,
            stack_base: entry.stack_base,
            result_slot: dest_slot,
            used: false,
        }));

        self.set_slot(entry.result_slot, Value::object(k));
        if entry.result_slot + 1 > self.stack_top {
            self.stack_top = entry.result_slot + 1;
        }
        if let Some(top) = self.frames.last_mut() {
            top.resume_ip = entry.resume_ip;
        }
        Ok(k)
    }

    /// `ABORT(tag, value)`: unwind straight to the matching prompt's
    /// installing frame without capturing anything, delivering `value` as
    /// the `withPrompt` body's result.
    pub fn abort(&mut self, tag: GcRef, value: Value) -> Result<(), VmError> {
        let entry = self.find_prompt(tag)?;
        self.close_upvalues_from(entry.stack_base);
        self.frames.truncate(entry.frame_index);
        self.stack_top = entry.stack_base;
        self.prune_prompts_above(entry.frame_index);
        self.set_slot(entry.result_slot, value);
        if let Some(top) = self.frames.last_mut() {
            top.resume_ip = entry.resume_ip;
        }
        Ok(())
    }

    /// `RESUME(k, arg)`: splice a captured continuation back onto the live
    /// stack at its current position and re-enter it. `resumer_result_slot`
    /// is the absolute slot, in the *resuming* frame, that should receive
    /// the value once the restored frame chain fully returns (see
    /// `ResumeEntry`).
    pub fn resume(&mut self, k: GcRef, arg: Value, resumer_result_slot: usize) -> Result<(), VmError> {
        if self.resume_stack.len() >= MAX_RESUME_DEPTH {
            return Err(VmError::ContinuationMisuse("resume nesting too deep"));
        }
        let continuation = match self.heap.get(k)? {
            Obj::Continuation(c) => c.clone(),
            _ => return Err(VmError::ContinuationMisuse("not a continuation")),
        };
        if continuation.used {
            return Err(VmError::ContinuationMisuse("continuation already resumed"));
        }
        if let Obj::Continuation(c) = self.heap.get_mut(k)? {
            c.used = true;
        }

        let caller_frame_count = self.frames.len();
        let new_base = self.stack_top;
        let shift = new_base as i64 - continuation.stack_base as i64;

        self.ensure_capacity(new_base + continuation.values.len())?;
        for (i, v) in continuation.values.iter().enumerate() {
            self.set_slot(new_base + i, *v);
        }
        self.stack_top = new_base + continuation.values.len();

        for sf in &continuation.frames {
            self.frames.push(CallFrame {
                closure: sf.closure,
                resume_ip: sf.resume_ip,
                stack_base: (sf.stack_base as i64 + shift) as usize,
                caller_chunk: sf.caller_chunk,
                return_slot: (sf.return_slot as i64 + shift) as usize,
            });
        }

        let dest = (continuation.result_slot as i64 + shift) as usize;
        self.set_slot(dest, arg);

        self.resume_stack.push(ResumeEntry { frame_boundary: caller_frame_count, result_slot: resumer_result_slot });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_snapshots_frames_above_the_prompt_and_unwinds() {
        let mut vm = Vm::new();
        vm.ensure_capacity(8).unwrap();
        let tag = vm.heap_mut().alloc(Obj::PromptTag(1));
        vm.push_prompt(tag, 99, 0).unwrap();

        let closure = vm.heap_mut().alloc(Obj::Closure(crate::object::Closure { function: tag, upvalues: vec![] }));
        vm.frames.push(CallFrame { closure, resume_ip: 0, stack_base: vm.stack_top, caller_chunk: 0, return_slot: 0 });
        vm.push(Value::number(1.0)).unwrap();

        let k = vm.capture(tag, 5, 0).unwrap();
        assert!(vm.frames.is_empty());
        assert_eq!(vm.prompt_stack.len(), 0);
        if let Obj::Continuation(c) = vm.heap().get(k).unwrap() {
            assert_eq!(c.frames.len(), 1);
            assert_eq!(c.values.len(), 1);
            assert!(!c.used);
        } else {
            panic!("expected continuation");
        }
    }

    #[test]
    fn resuming_rejects_a_used_continuation() {
        let mut vm = Vm::new();
        vm.ensure_capacity(8).unwrap();
        let tag = vm.heap_mut().alloc(Obj::PromptTag(1));
        vm.push_prompt(tag, 99, 0).unwrap();
        let closure = vm.heap_mut().alloc(Obj::Closure(crate::object::Closure { function: tag, upvalues: vec![] }));
        vm.frames.push(CallFrame { closure, resume_ip: 0, stack_base: vm.stack_top, caller_chunk: 0, return_slot: 0 });
        let k = vm.capture(tag, 5, 0).unwrap();

        vm.resume(k, Value::number(10.0), 0).unwrap();
        let err = vm.resume(k, Value::number(20.0), 0);
        assert!(matches!(err, Err(VmError::ContinuationMisuse(_))));
    }

    #[test]
    fn abort_unwinds_to_the_installing_frame_and_delivers_the_value() {
        let mut vm = Vm::new();
        vm.ensure_capacity(8).unwrap();
        let placeholder = vm.heap_mut().alloc(Obj::PromptTag(0));
        let install_closure = vm.heap_mut().alloc(Obj::Closure(crate::object::Closure { function: placeholder, upvalues: vec![] }));
        vm.frames.push(CallFrame { closure: install_closure, resume_ip: 0, stack_base: 0, caller_chunk: 0, return_slot: 0 });

        let tag = vm.heap_mut().alloc(Obj::PromptTag(1));
        vm.push_prompt(tag, 42, 0).unwrap();

        let body_closure = vm.heap_mut().alloc(Obj::Closure(crate::object::Closure { function: placeholder, upvalues: vec![] }));
        vm.frames.push(CallFrame { closure: body_closure, resume_ip: 0, stack_base: vm.stack_top, caller_chunk: 0, return_slot: 0 });

        vm.abort(tag, Value::number(123.0)).unwrap();
        assert_eq!(vm.frames.len(), 1);
        assert_eq!(vm.get_slot(0).as_number(), Some(123.0));
        assert_eq!(vm.frames.last().unwrap().resume_ip, 42);
    }
}
