//! The dispatch loop (§4.7): one `Vm::run` call decodes and executes
//! instructions from the current top frame until it returns to an empty
//! frame stack, yields cooperatively, or faults.
//!
//! Instruction operand conventions used throughout this module (none of
//! these come from a compiler, since the front end is out of scope — they
//! are this interpreter's own contract for the three operand shapes
//! `chunk.rs` documents):
//!
//! - reg-reg (`ADD`, `EQ`, ...): `A` = dest, `B` = lhs, `C` = rhs — three
//!   independent registers, no extra words.
//! - reg-imm16 (`ADD_I`, `BRANCH_LT_I`, ...): `A` = dest *and* lhs (the
//!   operation reads then overwrites the same register), `Bx` = the signed
//!   16-bit immediate. `BRANCH_*_I` additionally consumes one extra word
//!   holding the signed jump offset.
//! - reg-lit64 (`ADD_L`, `BRANCH_LT_L`, ...): `A` = dest/lhs, immediately
//!   followed by two extra words holding an f64 literal (`Chunk::read_f64`).
//!   `BRANCH_*_L` additionally consumes one further extra word for the jump
//!   offset, after the two literal words.
//!
//! All registers are relative to the executing frame's `stack_base`.
//! `MOVE` and upvalue/global reads never auto-dereference; arithmetic,
//! comparison, logical, `NOT`, subscript, and property operands always do
//! (§4.7's invariant) via `Vm::auto_deref`.
//!
//! A `withPrompt` body is ordinary straight-line code in the same frame as
//! its `PUSH_PROMPT`/`POP_PROMPT` pair, not a separate call — `PUSH_PROMPT`
//! takes one extra word (like a `BRANCH_*` offset) giving where to jump to
//! skip the rest of the body, used only when `CAPTURE`/`ABORT` unwinds from
//! a nested call back up to the installing frame. Falling through to
//! `POP_PROMPT` normally needs no jump at all.

use crate::chunk::{decode, encode_bx, Instr, Opcode};
use crate::error::{format_runtime_error, VmError};
use crate::object::{Closure, Dispatcher, Function, Obj, ObjType, QualifierSig};
use crate::value::Value;
use crate::vm::{RunResult, Vm, DEFAULT_TIMESLICE};

impl Vm {
    /// Run until the frame stack empties (a top-level return), a
    /// cooperative yield point is hit, or an error propagates.
    pub fn run(&mut self) -> RunResult {
        loop {
            self.maybe_collect();
            match self.step() {
                Ok(Some(result)) => return result,
                Ok(None) => {
                    if self.preemption_enabled {
                        if self.yield_budget == 0 {
                            self.yield_budget = DEFAULT_TIMESLICE;
                            if self.preempt_requested {
                                self.preempt_requested = false;
                                return RunResult::Yield;
                            }
                        } else {
                            self.yield_budget -= 1;
                        }
                    }
                }
                Err(e) => {
                    let frames = self.error_frames();
                    return RunResult::RuntimeError(format_runtime_error(&e, &frames));
                }
            }
        }
    }

    /// Request that the next convenient checkpoint in `run` return
    /// `RunResult::Yield` instead of continuing (§5 cooperative preemption).
    pub fn request_preempt(&mut self) {
        self.preempt_requested = true;
    }

    pub fn set_preemption_enabled(&mut self, enabled: bool) {
        self.preemption_enabled = enabled;
        if enabled {
            self.yield_budget = DEFAULT_TIMESLICE;
        }
    }

    fn function_of(&self, closure_ref: crate::object::GcRef) -> Result<Function, VmError> {
        match self.heap.get(closure_ref)? {
            Obj::Closure(c) => match self.heap.get(c.function)? {
                Obj::Function(f) => Ok(f.clone()),
                _ => Err(VmError::message("closure's function slot is not a function")),
            },
            _ => Err(VmError::message("not a closure")),
        }
    }

    fn read_reg(&self, base: usize, idx: u8) -> Value {
        self.get_slot(base + idx as usize)
    }

    fn write_reg(&mut self, base: usize, idx: u8, v: Value) {
        self.set_slot(base + idx as usize, v);
    }

    /// Fetch-decode-execute exactly one instruction from the current top
    /// frame. `Ok(Some(_))` means `run` should return that result; `Ok(None)`
    /// means keep looping.
    fn step(&mut self) -> Result<Option<RunResult>, VmError> {
        let frame = self.frames.last().ok_or_else(|| VmError::message("run() called with no active frame"))?;
        let closure_ref = frame.closure;
        let base = frame.stack_base;
        let start_ip = frame.resume_ip;
        let chunk_ref = self.function_of(closure_ref)?.chunk;

        match self.dispatch(closure_ref, chunk_ref, base, start_ip) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Some(top) = self.frames.last_mut() {
                    top.resume_ip = start_ip;
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &mut self,
        closure_ref: crate::object::GcRef,
        chunk_ref: u32,
        base: usize,
        ip: usize,
    ) -> Result<Option<RunResult>, VmError> {
        let word = *self.chunk(chunk_ref).instructions.get(ip).ok_or(VmError::MalformedChunk("ip past end of chunk"))?;
        let instr = decode(word);
        let mut ip = ip + 1;

        match instr.op {
            Opcode::Halt => {
                let v = self.get_slot(base);
                return Ok(Some(RunResult::Ok(v)));
            }

            Opcode::Move => {
                let v = self.read_reg(base, instr.b);
                self.write_reg(base, instr.a, v);
            }
            Opcode::LoadConst => {
                let v = self.chunk(chunk_ref).constants[instr.bx() as usize];
                self.write_reg(base, instr.a, v);
            }
            Opcode::LoadNull => self.write_reg(base, instr.a, Value::NULL),
            Opcode::LoadBool => self.write_reg(base, instr.a, Value::bool(instr.b != 0)),

            // ---- arithmetic, reg-reg ------------------------------------
            Opcode::Add => self.do_add(base, instr)?,
            Opcode::Sub => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number(a - b)))?,
            Opcode::Mul => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number(a * b)))?,
            Opcode::Div => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number(a / b)))?,
            Opcode::Mod => self.numeric_binop_rr(base, instr, |a, b| {
                if b == 0.0 {
                    Err(VmError::DivByZero)
                } else {
                    Ok(Value::number(a % b))
                }
            })?,

            // ---- arithmetic, reg-imm16 (in-place) -----------------------
            Opcode::AddI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number(a + b)))?,
            Opcode::SubI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number(a - b)))?,
            Opcode::MulI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number(a * b)))?,
            Opcode::DivI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number(a / b)))?,
            Opcode::ModI => self.numeric_binop_i(base, instr, |a, b| {
                if b == 0.0 {
                    Err(VmError::DivByZero)
                } else {
                    Ok(Value::number(a % b))
                }
            })?,

            // ---- arithmetic, reg-lit64 (in-place) ------------------------
            Opcode::AddL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number(a + b)))?,
            Opcode::SubL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number(a - b)))?,
            Opcode::MulL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number(a * b)))?,
            Opcode::DivL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number(a / b)))?,
            Opcode::ModL => {
                ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| {
                    if b == 0.0 {
                        Err(VmError::DivByZero)
                    } else {
                        Ok(Value::number(a % b))
                    }
                })?
            }

            // ---- bitwise, reg-reg -----------------------------------------
            Opcode::BAnd => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number((to_i32(a) & to_i32(b)) as f64)))?,
            Opcode::BOr => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number((to_i32(a) | to_i32(b)) as f64)))?,
            Opcode::BXor => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number((to_i32(a) ^ to_i32(b)) as f64)))?,
            Opcode::Shl => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number((to_i32(a).wrapping_shl(shift_mask(b))) as f64)))?,
            Opcode::Shr => self.numeric_binop_rr(base, instr, |a, b| Ok(Value::number((to_i32(a).wrapping_shr(shift_mask(b))) as f64)))?,

            Opcode::BAndI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number((to_i32(a) & to_i32(b)) as f64)))?,
            Opcode::BOrI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number((to_i32(a) | to_i32(b)) as f64)))?,
            Opcode::BXorI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number((to_i32(a) ^ to_i32(b)) as f64)))?,
            Opcode::ShlI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number((to_i32(a).wrapping_shl(shift_mask(b))) as f64)))?,
            Opcode::ShrI => self.numeric_binop_i(base, instr, |a, b| Ok(Value::number((to_i32(a).wrapping_shr(shift_mask(b))) as f64)))?,

            Opcode::BAndL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number((to_i32(a) & to_i32(b)) as f64)))?,
            Opcode::BOrL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number((to_i32(a) | to_i32(b)) as f64)))?,
            Opcode::BXorL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number((to_i32(a) ^ to_i32(b)) as f64)))?,
            Opcode::ShlL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number((to_i32(a).wrapping_shl(shift_mask(b))) as f64)))?,
            Opcode::ShrL => ip = self.numeric_binop_l(base, instr, chunk_ref, ip, |a, b| Ok(Value::number((to_i32(a).wrapping_shr(shift_mask(b))) as f64)))?,

            // ---- unary -----------------------------------------------------
            Opcode::Neg => {
                let v = self.auto_deref(self.read_reg(base, instr.b))?;
                let n = v.as_number().ok_or_else(|| VmError::type_mismatch("negate", "number", &v))?;
                self.write_reg(base, instr.a, Value::number(-n));
            }
            Opcode::Not => {
                let v = self.auto_deref(self.read_reg(base, instr.b))?;
                self.write_reg(base, instr.a, Value::bool(!v.is_truthy()));
            }
            Opcode::BNot => {
                let v = self.auto_deref(self.read_reg(base, instr.b))?;
                let n = v.as_number().ok_or_else(|| VmError::type_mismatch("bitwise-not", "number", &v))?;
                self.write_reg(base, instr.a, Value::number(!to_i32(n) as f64));
            }

            // ---- comparisons, reg-reg --------------------------------------
            Opcode::Eq => self.compare_rr(base, instr, |vm, a, b| vm.values_equal(a, b))?,
            Opcode::Ne => self.compare_rr(base, instr, |vm, a, b| vm.values_equal(a, b).map(|r| !r))?,
            Opcode::Lt => self.compare_rr(base, instr, |vm, a, b| vm.values_lt(a, b))?,
            Opcode::Le => self.compare_rr(base, instr, |vm, a, b| vm.values_lt(b, a).map(|r| !r))?,
            Opcode::Gt => self.compare_rr(base, instr, |vm, a, b| vm.values_lt(b, a))?,
            Opcode::Ge => self.compare_rr(base, instr, |vm, a, b| vm.values_lt(a, b).map(|r| !r))?,

            Opcode::EqI => self.compare_i(base, instr, |vm, a, b| vm.values_equal(a, b))?,
            Opcode::NeI => self.compare_i(base, instr, |vm, a, b| vm.values_equal(a, b).map(|r| !r))?,
            Opcode::LtI => self.compare_i(base, instr, |vm, a, b| vm.values_lt(a, b))?,
            Opcode::LeI => self.compare_i(base, instr, |vm, a, b| vm.values_lt(b, a).map(|r| !r))?,
            Opcode::GtI => self.compare_i(base, instr, |vm, a, b| vm.values_lt(b, a))?,
            Opcode::GeI => self.compare_i(base, instr, |vm, a, b| vm.values_lt(a, b).map(|r| !r))?,

            Opcode::EqL => ip = self.compare_l(base, instr, chunk_ref, ip, |vm, a, b| vm.values_equal(a, b))?,
            Opcode::NeL => ip = self.compare_l(base, instr, chunk_ref, ip, |vm, a, b| vm.values_equal(a, b).map(|r| !r))?,
            Opcode::LtL => ip = self.compare_l(base, instr, chunk_ref, ip, |vm, a, b| vm.values_lt(a, b))?,
            Opcode::LeL => ip = self.compare_l(base, instr, chunk_ref, ip, |vm, a, b| vm.values_lt(b, a).map(|r| !r))?,
            Opcode::GtL => ip = self.compare_l(base, instr, chunk_ref, ip, |vm, a, b| vm.values_lt(b, a))?,
            Opcode::GeL => ip = self.compare_l(base, instr, chunk_ref, ip, |vm, a, b| vm.values_lt(a, b).map(|r| !r))?,

            // ---- control flow -----------------------------------------------
            Opcode::Jump => {
                ip = (ip as i64 + instr.sbx() as i64) as usize;
            }
            Opcode::JumpIfFalse => {
                let cond = self.auto_deref(self.read_reg(base, instr.a))?;
                if !cond.is_truthy() {
                    ip = (ip as i64 + instr.sbx() as i64) as usize;
                }
            }
            Opcode::BranchEqI | Opcode::BranchNeI | Opcode::BranchLtI | Opcode::BranchLeI | Opcode::BranchGtI | Opcode::BranchGeI => {
                let lhs = self.auto_deref(self.read_reg(base, instr.a))?;
                let imm = Value::number(instr.sbx() as f64);
                let offset_word = self.chunk(chunk_ref).instructions[ip] as i32 as i16;
                ip += 1;
                let take = self.branch_condition(instr.op, lhs, imm)?;
                if take {
                    ip = (ip as i64 + offset_word as i64) as usize;
                }
            }
            Opcode::BranchEqL | Opcode::BranchNeL | Opcode::BranchLtL | Opcode::BranchLeL | Opcode::BranchGtL | Opcode::BranchGeL => {
                let lhs = self.auto_deref(self.read_reg(base, instr.a))?;
                let lit = Value::number(self.chunk(chunk_ref).read_f64(ip));
                ip += 2;
                let offset_word = self.chunk(chunk_ref).instructions[ip] as i32 as i16;
                ip += 1;
                let take = self.branch_condition(instr.op, lhs, lit)?;
                if take {
                    ip = (ip as i64 + offset_word as i64) as usize;
                }
            }

            // ---- calls / return ---------------------------------------------
            Opcode::Call => {
                let callee = self.read_reg(base, instr.a);
                let argc = instr.b as usize;
                let args_start = base + instr.a as usize + 1;
                let dest = base + instr.c as usize;
                self.frames.last_mut().unwrap().resume_ip = ip;
                self.do_call(callee, args_start, argc, dest)?;
                return Ok(None);
            }
            Opcode::CallSelf => {
                let callee = Value::object(closure_ref);
                let argc = instr.b as usize;
                let args_start = base + instr.a as usize;
                let dest = base + instr.c as usize;
                self.frames.last_mut().unwrap().resume_ip = ip;
                self.do_call(callee, args_start, argc, dest)?;
                return Ok(None);
            }
            Opcode::TailCall => {
                let callee = self.read_reg(base, instr.a);
                let argc = instr.b as usize;
                let args_src = base + instr.a as usize + 1;
                self.frames.last_mut().unwrap().resume_ip = ip;
                self.do_tail_call(callee, base, args_src, argc)?;
                return Ok(None);
            }
            Opcode::TailCallSelf => {
                let callee = Value::object(closure_ref);
                let argc = instr.b as usize;
                let args_src = base + instr.a as usize;
                self.frames.last_mut().unwrap().resume_ip = ip;
                self.do_tail_call(callee, base, args_src, argc)?;
                return Ok(None);
            }
            Opcode::SmartTailCall => {
                let callee = self.read_reg(base, instr.a);
                let argc = instr.b as usize;
                if self.callee_has_no_upvalues(callee)? {
                    let args_src = base + instr.a as usize + 1;
                    self.frames.last_mut().unwrap().resume_ip = ip;
                    self.do_tail_call(callee, base, args_src, argc)?;
                } else {
                    let args_start = base + instr.a as usize + 1;
                    let dest = base + instr.c as usize;
                    self.frames.last_mut().unwrap().resume_ip = ip;
                    self.do_call(callee, args_start, argc, dest)?;
                }
                return Ok(None);
            }
            Opcode::SmartTailCallSelf => {
                let callee = Value::object(closure_ref);
                let argc = instr.b as usize;
                if self.callee_has_no_upvalues(callee)? {
                    let args_src = base + instr.a as usize;
                    self.frames.last_mut().unwrap().resume_ip = ip;
                    self.do_tail_call(callee, base, args_src, argc)?;
                } else {
                    let args_start = base + instr.a as usize;
                    let dest = base + instr.c as usize;
                    self.frames.last_mut().unwrap().resume_ip = ip;
                    self.do_call(callee, args_start, argc, dest)?;
                }
                return Ok(None);
            }
            Opcode::Ret => {
                let v_raw = self.read_reg(base, instr.a);
                return self.do_return(v_raw);
            }

            // ---- globals ------------------------------------------------------
            Opcode::DefineGlobal => {
                let name = self.string_value_contents(self.chunk(chunk_ref).constants[instr.bx() as usize])?;
                let v = self.read_reg(base, instr.a);
                self.define_global(&name, v);
            }
            Opcode::GetGlobal => {
                let name = self.string_value_contents(self.chunk(chunk_ref).constants[instr.bx() as usize])?;
                let v = self.get_global(&name)?;
                self.write_reg(base, instr.a, v);
                if let Some(slot) = self.global_slot_for(&name) {
                    if slot <= u16::MAX as u32 {
                        let new_word = encode_bx(Opcode::GetGlobalCached, instr.a, slot as u16);
                        self.chunks[chunk_ref as usize].instructions[ip - 1] = new_word;
                    }
                }
            }
            Opcode::GetGlobalCached => {
                let v = self.get_global_slot(instr.bx() as u32);
                self.write_reg(base, instr.a, v);
            }
            Opcode::SetGlobal => {
                let name = self.string_value_contents(self.chunk(chunk_ref).constants[instr.bx() as usize])?;
                let v = self.read_reg(base, instr.a);
                self.set_global_write_through(&name, v)?;
                if let Some(slot) = self.global_slot_for(&name) {
                    if slot <= u16::MAX as u32 {
                        let new_word = encode_bx(Opcode::SetGlobalCached, instr.a, slot as u16);
                        self.chunks[chunk_ref as usize].instructions[ip - 1] = new_word;
                    }
                }
            }
            Opcode::SetGlobalCached => {
                let v = self.read_reg(base, instr.a);
                self.set_global_slot(instr.bx() as u32, v);
            }
            Opcode::SlotSetGlobal => {
                let name = self.string_value_contents(self.chunk(chunk_ref).constants[instr.bx() as usize])?;
                let v = self.read_reg(base, instr.a);
                self.set_global(&name, v)?;
            }

            // ---- closures / upvalues --------------------------------------
            Opcode::Closure => {
                let func_val = self.chunk(chunk_ref).constants[instr.bx() as usize];
                let func_ref = func_val.as_object().ok_or(VmError::MalformedChunk("CLOSURE constant is not an object"))?;
                let function = match self.heap.get(func_ref)? {
                    Obj::Function(f) => f.clone(),
                    _ => return Err(VmError::MalformedChunk("CLOSURE constant is not a function")),
                };
                let upvalues = self.resolve_closure_upvalues(&function.upvalues, closure_ref, base)?;
                let new_closure = self.heap.alloc(Obj::Closure(Closure { function: func_ref, upvalues }));
                self.write_reg(base, instr.a, Value::object(new_closure));
            }
            Opcode::GetUpvalue => {
                let u = self.closure_upvalue(closure_ref, instr.b as usize)?;
                let v = self.read_upvalue(u)?;
                self.write_reg(base, instr.a, v);
            }
            Opcode::SetUpvalue => {
                let u = self.closure_upvalue(closure_ref, instr.b as usize)?;
                let new_v = self.read_reg(base, instr.a);
                let current = self.read_upvalue(u)?;
                if let Some(r) = current.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
                    self.deref_write(r, new_v, true)?;
                } else {
                    self.write_upvalue(u, new_v)?;
                }
            }
            Opcode::SlotSetUpvalue => {
                let u = self.closure_upvalue(closure_ref, instr.b as usize)?;
                let new_v = self.read_reg(base, instr.a);
                self.write_upvalue(u, new_v)?;
            }
            Opcode::CloseUpvalue => {
                self.close_upvalues_from(base + instr.a as usize);
            }
            Opcode::CloseFrameUpvalues => {
                self.close_upvalues_from(base);
            }

            // ---- containers ----------------------------------------------
            Opcode::NewList => {
                let list = self.heap.alloc(Obj::List(Vec::new()));
                self.write_reg(base, instr.a, Value::object(list));
            }
            Opcode::ListAppend => {
                let list_v = self.read_reg(base, instr.a);
                let item = self.read_reg(base, instr.b);
                let r = list_v.as_object().ok_or_else(|| VmError::type_mismatch("list-append", "list", &list_v))?;
                match self.heap.get_mut(r)? {
                    Obj::List(items) => items.push(item),
                    _ => return Err(VmError::type_mismatch("list-append", "list", &list_v)),
                }
            }
            Opcode::ListSpread => {
                let list_v = self.read_reg(base, instr.a);
                let src_v = self.auto_deref(self.read_reg(base, instr.b))?;
                let src_r = src_v.as_object().ok_or_else(|| VmError::type_mismatch("list-spread", "list", &src_v))?;
                let items = match self.heap.get(src_r)? {
                    Obj::List(items) => items.clone(),
                    _ => return Err(VmError::type_mismatch("list-spread", "list", &src_v)),
                };
                let r = list_v.as_object().ok_or_else(|| VmError::type_mismatch("list-spread", "list", &list_v))?;
                match self.heap.get_mut(r)? {
                    Obj::List(dest) => dest.extend(items),
                    _ => return Err(VmError::type_mismatch("list-spread", "list", &list_v)),
                }
            }
            Opcode::NewMap => {
                let map = self.heap.alloc(Obj::Map(Default::default()));
                self.write_reg(base, instr.a, Value::object(map));
            }
            Opcode::MapSet => {
                let map_v = self.read_reg(base, instr.a);
                let key = self.auto_deref(self.read_reg(base, instr.b))?;
                let v = self.read_reg(base, instr.c);
                self.container_set_index(map_v, key, v)?;
            }
            Opcode::MapSpread => {
                let map_v = self.read_reg(base, instr.a);
                let src_v = self.auto_deref(self.read_reg(base, instr.b))?;
                let src_r = src_v.as_object().ok_or_else(|| VmError::type_mismatch("map-spread", "map", &src_v))?;
                let entries = match self.heap.get(src_r)? {
                    Obj::Map(m) => m.clone(),
                    _ => return Err(VmError::type_mismatch("map-spread", "map", &src_v)),
                };
                let r = map_v.as_object().ok_or_else(|| VmError::type_mismatch("map-spread", "map", &map_v))?;
                match self.heap.get_mut(r)? {
                    Obj::Map(dest) => dest.extend(entries),
                    _ => return Err(VmError::type_mismatch("map-spread", "map", &map_v)),
                }
            }
            Opcode::GetSubscript => {
                let container = self.auto_deref(self.read_reg(base, instr.b))?;
                let index = self.auto_deref(self.read_reg(base, instr.c))?;
                let v = self.container_get_index(container, index)?;
                self.write_reg(base, instr.a, v);
            }
            Opcode::SetSubscript => {
                let container = self.auto_deref(self.read_reg(base, instr.a))?;
                let index = self.auto_deref(self.read_reg(base, instr.b))?;
                let v = self.read_reg(base, instr.c);
                self.write_through_container_index(container, index, v)?;
            }
            Opcode::SlotSetSubscript => {
                let container = self.auto_deref(self.read_reg(base, instr.a))?;
                let index = self.auto_deref(self.read_reg(base, instr.b))?;
                let v = self.read_reg(base, instr.c);
                self.container_set_index(container, index, v)?;
            }
            Opcode::GetMapProperty | Opcode::GetStructField => {
                let container = self.auto_deref(self.read_reg(base, instr.b))?;
                let key = self.auto_deref(self.read_reg(base, instr.c))?;
                let v = self.container_get_property(container, key)?;
                self.write_reg(base, instr.a, v);
            }
            Opcode::SetMapProperty | Opcode::SetStructField => {
                let container = self.auto_deref(self.read_reg(base, instr.a))?;
                let key = self.auto_deref(self.read_reg(base, instr.b))?;
                let v = self.read_reg(base, instr.c);
                self.write_through_container_property(container, key, v)?;
            }
            Opcode::SlotSetMapProperty | Opcode::SlotSetStructField => {
                let container = self.auto_deref(self.read_reg(base, instr.a))?;
                let key = self.auto_deref(self.read_reg(base, instr.b))?;
                let v = self.read_reg(base, instr.c);
                self.container_set_property(container, key, v)?;
            }
            Opcode::NewStruct => {
                let schema_val = self.chunk(chunk_ref).constants[instr.bx() as usize];
                let schema_ref = schema_val.as_object().ok_or(VmError::MalformedChunk("NEW_STRUCT constant is not an object"))?;
                let field_count = match self.heap.get(schema_ref)? {
                    Obj::StructSchema(s) => s.fields.len(),
                    _ => return Err(VmError::MalformedChunk("NEW_STRUCT constant is not a schema")),
                };
                let inst = self.heap.alloc(Obj::StructInstance { schema: schema_ref, fields: vec![Value::NULL; field_count] });
                self.write_reg(base, instr.a, Value::object(inst));
            }
            Opcode::StructSpread => {
                let dest_v = self.read_reg(base, instr.a);
                let src_v = self.auto_deref(self.read_reg(base, instr.b))?;
                let dest_r = dest_v.as_object().ok_or_else(|| VmError::type_mismatch("struct-spread", "struct", &dest_v))?;
                let src_r = src_v.as_object().ok_or_else(|| VmError::type_mismatch("struct-spread", "struct", &src_v))?;
                let src_fields = match self.heap.get(src_r)? {
                    Obj::StructInstance { fields, .. } => fields.clone(),
                    _ => return Err(VmError::type_mismatch("struct-spread", "struct", &src_v)),
                };
                match self.heap.get_mut(dest_r)? {
                    Obj::StructInstance { fields, .. } => {
                        for (i, v) in src_fields.into_iter().enumerate() {
                            if i < fields.len() {
                                fields[i] = v;
                            }
                        }
                    }
                    _ => return Err(VmError::type_mismatch("struct-spread", "struct", &dest_v)),
                }
            }

            // ---- dispatchers -------------------------------------------------
            Opcode::NewDispatcher => {
                let d = self.heap.alloc(Obj::Dispatcher(Dispatcher::default()));
                self.write_reg(base, instr.a, Value::object(d));
            }
            Opcode::AddOverload => {
                let d_v = self.read_reg(base, instr.a);
                let overload_v = self.read_reg(base, instr.b);
                let d_r = d_v.as_object().ok_or_else(|| VmError::type_mismatch("add-overload", "dispatcher", &d_v))?;
                let overload_r = overload_v.as_object().ok_or_else(|| VmError::type_mismatch("add-overload", "closure", &overload_v))?;
                match self.heap.get_mut(d_r)? {
                    Obj::Dispatcher(d) => d.overloads.push(overload_r),
                    _ => return Err(VmError::type_mismatch("add-overload", "dispatcher", &d_v)),
                }
            }

            // ---- clone ---------------------------------------------------
            Opcode::CloneValue => {
                let v = self.read_reg(base, instr.b);
                let cloned = self.shallow_clone(v)?;
                self.write_reg(base, instr.a, cloned);
            }
            Opcode::DeepCloneValue => {
                let v = self.read_reg(base, instr.b);
                let cloned = self.deep_clone(v)?;
                self.write_reg(base, instr.a, cloned);
            }

            // ---- references -----------------------------------------------
            Opcode::MakeRef => {
                let r = self.make_ref_to_local(base + instr.b as usize)?;
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::SlotMakeRef => {
                let r = self.slot_make_ref_to_local(base + instr.b as usize);
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::MakeGlobalRef => {
                let name = self.string_value_contents(self.chunk(chunk_ref).constants[instr.bx() as usize])?;
                let r = self.make_global_ref(&name)?;
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::SlotMakeGlobalRef => {
                let name = self.string_value_contents(self.chunk(chunk_ref).constants[instr.bx() as usize])?;
                let r = self.slot_make_global_ref(&name);
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::MakeUpvalueRef => {
                let u = self.closure_upvalue(closure_ref, instr.b as usize)?;
                let r = self.make_upvalue_ref(u)?;
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::MakeIndexRef => {
                let container = self.read_reg(base, instr.b);
                let index = self.read_reg(base, instr.c);
                let r = self.make_index_ref(container, index)?;
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::SlotMakeIndexRef => {
                let container = self.read_reg(base, instr.b);
                let index = self.read_reg(base, instr.c);
                let r = self.slot_make_index_ref(container, index);
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::MakePropertyRef => {
                let container = self.read_reg(base, instr.b);
                let key = self.read_reg(base, instr.c);
                let r = self.make_property_ref(container, key)?;
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::SlotMakePropertyRef => {
                let container = self.read_reg(base, instr.b);
                let key = self.read_reg(base, instr.c);
                let r = self.slot_make_property_ref(container, key);
                self.write_reg(base, instr.a, Value::object(r));
            }
            Opcode::DerefGet => {
                let r = self.read_reg(base, instr.b).as_object().ok_or(VmError::MalformedChunk("DEREF_GET operand is not a reference"))?;
                let v = self.deref_read(r)?;
                self.write_reg(base, instr.a, v);
            }
            Opcode::DerefSet => {
                let r = self.read_reg(base, instr.a).as_object().ok_or(VmError::MalformedChunk("DEREF_SET operand is not a reference"))?;
                let v = self.read_reg(base, instr.b);
                self.deref_write(r, v, true)?;
            }
            Opcode::SlotDerefSet => {
                let r = self.read_reg(base, instr.a).as_object().ok_or(VmError::MalformedChunk("SLOT_DEREF_SET operand is not a reference"))?;
                let v = self.read_reg(base, instr.b);
                self.slot_write(r, v)?;
            }

            // ---- increment / decrement --------------------------------------
            Opcode::PreInc => self.inc_dec(base, instr, 1.0, true)?,
            Opcode::PostInc => self.inc_dec(base, instr, 1.0, false)?,
            Opcode::PreDec => self.inc_dec(base, instr, -1.0, true)?,
            Opcode::PostDec => self.inc_dec(base, instr, -1.0, false)?,

            // ---- typeof ------------------------------------------------------
            Opcode::Typeof => {
                let v = self.read_reg(base, instr.b);
                let name = self.typeof_name(v)?;
                let s = self.heap.intern_string(&name);
                self.write_reg(base, instr.a, Value::object(s));
            }

            // ---- delimited continuations --------------------------------
            Opcode::PushPrompt => {
                let tag_v = self.read_reg(base, instr.a);
                let tag = tag_v.as_object().ok_or(VmError::MalformedChunk("PUSH_PROMPT tag is not an object"))?;
                let offset_word = self.chunk(chunk_ref).instructions[ip] as i32 as i16;
                ip += 1;
                let target = (ip as i64 + offset_word as i64) as usize;
                let result_slot = base + instr.b as usize;
                self.push_prompt(tag, target, result_slot)?;
            }
            Opcode::PopPrompt => {
                let v = self.read_reg(base, instr.a);
                self.pop_prompt(v)?;
            }
            Opcode::Capture => {
                let tag_v = self.read_reg(base, instr.a);
                let tag = tag_v.as_object().ok_or(VmError::MalformedChunk("CAPTURE tag is not an object"))?;
                let dest = base + instr.b as usize;
                self.frames.last_mut().unwrap().resume_ip = ip;
                self.capture(tag, ip, dest)?;
                return Ok(None);
            }
            Opcode::Resume => {
                let k_v = self.read_reg(base, instr.a);
                let k = k_v.as_object().ok_or(VmError::MalformedChunk("RESUME target is not a continuation"))?;
                let arg = self.read_reg(base, instr.b);
                let resumer_slot = base + instr.c as usize;
                self.frames.last_mut().unwrap().resume_ip = ip;
                self.resume(k, arg, resumer_slot)?;
                return Ok(None);
            }
            Opcode::Abort => {
                let tag_v = self.read_reg(base, instr.a);
                let tag = tag_v.as_object().ok_or(VmError::MalformedChunk("ABORT tag is not an object"))?;
                let v = self.read_reg(base, instr.b);
                self.abort(tag, v)?;
                return Ok(None);
            }
        }

        self.frames.last_mut().unwrap().resume_ip = ip;
        Ok(None)
    }

    // ---- arithmetic/comparison helpers ---------------------------------

    fn numeric_binop_rr(&mut self, base: usize, instr: Instr, op: impl Fn(f64, f64) -> Result<Value, VmError>) -> Result<(), VmError> {
        let a = self.auto_deref(self.read_reg(base, instr.b))?;
        let b = self.auto_deref(self.read_reg(base, instr.c))?;
        let (an, bn) = (a.as_number(), b.as_number());
        let result = match (an, bn) {
            (Some(x), Some(y)) => op(x, y)?,
            _ => return Err(VmError::type_mismatch("arithmetic", "number", if an.is_none() { &a } else { &b })),
        };
        self.write_reg(base, instr.a, result);
        Ok(())
    }

    /// `ADD`: numeric addition, or string concatenation (§4.7) when both
    /// operands are strings — the interned result of `a + b`. Mixed
    /// string/number operands are a `TypeMismatch`, not an implicit coercion.
    fn do_add(&mut self, base: usize, instr: Instr) -> Result<(), VmError> {
        let a = self.auto_deref(self.read_reg(base, instr.b))?;
        let b = self.auto_deref(self.read_reg(base, instr.c))?;
        let result = match (self.as_string(a)?, self.as_string(b)?) {
            (Some(sa), Some(sb)) => Value::object(self.heap.intern_string(&format!("{sa}{sb}"))),
            _ => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => Value::number(x + y),
                _ => return Err(VmError::type_mismatch("arithmetic", "number", if a.as_number().is_none() { &a } else { &b })),
            },
        };
        self.write_reg(base, instr.a, result);
        Ok(())
    }

    /// `v`'s string contents if it is a (non-reference) string object, else `None`.
    fn as_string(&self, v: Value) -> Result<Option<String>, VmError> {
        match v.as_object() {
            Some(r) if self.heap.get(r)?.type_tag() == ObjType::String => Ok(Some(self.string_value_contents(v)?)),
            _ => Ok(None),
        }
    }

    fn numeric_binop_i(&mut self, base: usize, instr: Instr, op: impl Fn(f64, f64) -> Result<Value, VmError>) -> Result<(), VmError> {
        let a = self.auto_deref(self.read_reg(base, instr.a))?;
        let an = a.as_number().ok_or_else(|| VmError::type_mismatch("arithmetic", "number", &a))?;
        let imm = instr.sbx() as f64;
        let result = op(an, imm)?;
        self.write_reg(base, instr.a, result);
        Ok(())
    }

    fn numeric_binop_l(
        &mut self,
        base: usize,
        instr: Instr,
        chunk_ref: u32,
        ip: usize,
        op: impl Fn(f64, f64) -> Result<Value, VmError>,
    ) -> Result<usize, VmError> {
        let a = self.auto_deref(self.read_reg(base, instr.a))?;
        let an = a.as_number().ok_or_else(|| VmError::type_mismatch("arithmetic", "number", &a))?;
        let lit = self.chunk(chunk_ref).read_f64(ip);
        let result = op(an, lit)?;
        self.write_reg(base, instr.a, result);
        Ok(ip + 2)
    }

    fn compare_rr(&mut self, base: usize, instr: Instr, cmp: impl Fn(&mut Vm, Value, Value) -> Result<bool, VmError>) -> Result<(), VmError> {
        let a = self.auto_deref(self.read_reg(base, instr.b))?;
        let b = self.auto_deref(self.read_reg(base, instr.c))?;
        let result = cmp(self, a, b)?;
        self.write_reg(base, instr.a, Value::bool(result));
        Ok(())
    }

    fn compare_i(&mut self, base: usize, instr: Instr, cmp: impl Fn(&mut Vm, Value, Value) -> Result<bool, VmError>) -> Result<(), VmError> {
        let a = self.auto_deref(self.read_reg(base, instr.a))?;
        let imm = Value::number(instr.sbx() as f64);
        let result = cmp(self, a, imm)?;
        self.write_reg(base, instr.a, Value::bool(result));
        Ok(())
    }

    fn compare_l(
        &mut self,
        base: usize,
        instr: Instr,
        chunk_ref: u32,
        ip: usize,
        cmp: impl Fn(&mut Vm, Value, Value) -> Result<bool, VmError>,
    ) -> Result<usize, VmError> {
        let a = self.auto_deref(self.read_reg(base, instr.a))?;
        let lit = Value::number(self.chunk(chunk_ref).read_f64(ip));
        let result = cmp(self, a, lit)?;
        self.write_reg(base, instr.a, Value::bool(result));
        Ok(ip + 2)
    }

    fn branch_condition(&mut self, op: Opcode, lhs: Value, rhs: Value) -> Result<bool, VmError> {
        match op {
            Opcode::BranchEqI | Opcode::BranchEqL => self.values_equal(lhs, rhs),
            Opcode::BranchNeI | Opcode::BranchNeL => self.values_equal(lhs, rhs).map(|r| !r),
            Opcode::BranchLtI | Opcode::BranchLtL => self.values_lt(lhs, rhs),
            Opcode::BranchLeI | Opcode::BranchLeL => self.values_lt(rhs, lhs).map(|r| !r),
            Opcode::BranchGtI | Opcode::BranchGtL => self.values_lt(rhs, lhs),
            Opcode::BranchGeI | Opcode::BranchGeL => self.values_lt(lhs, rhs).map(|r| !r),
            _ => unreachable!("branch_condition called with a non-branch opcode"),
        }
    }

    /// `==`/`!=` semantics: numbers/bools/null structurally, objects by
    /// identity, enums only when the type-id matches (a type-id mismatch is
    /// a hard error, not a silent `false`).
    fn values_equal(&self, a: Value, b: Value) -> Result<bool, VmError> {
        if let (Some((ta, _)), Some((tb, _))) = (a.as_enum(), b.as_enum()) {
            if ta != tb {
                return Err(VmError::IncomparableEnum);
            }
        }
        Ok(a == b)
    }

    fn values_lt(&self, a: Value, b: Value) -> Result<bool, VmError> {
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok(x < y),
            _ => Err(VmError::type_mismatch("comparison", "number", if a.as_number().is_none() { &a } else { &b })),
        }
    }

    fn inc_dec(&mut self, base: usize, instr: Instr, delta: f64, pre: bool) -> Result<(), VmError> {
        let original = self.read_reg(base, instr.b);
        let is_ref = original.as_object().filter(|o| self.is_reference(*o).unwrap_or(false));
        let current = match is_ref {
            Some(r) => self.deref_read(r)?,
            None => original,
        };
        let n = current.as_number().ok_or_else(|| VmError::type_mismatch("increment/decrement", "number", &current))?;
        let new_val = Value::number(n + delta);
        match is_ref {
            Some(r) => self.deref_write(r, new_val, true)?,
            None => self.write_reg(base, instr.b, new_val),
        }
        self.write_reg(base, instr.a, if pre { new_val } else { current });
        Ok(())
    }

    fn closure_upvalue(&self, closure_ref: crate::object::GcRef, index: usize) -> Result<crate::object::GcRef, VmError> {
        match self.heap.get(closure_ref)? {
            Obj::Closure(c) => c.upvalues.get(index).copied().ok_or(VmError::MalformedChunk("upvalue index out of range")),
            _ => Err(VmError::message("not a closure")),
        }
    }

    /// `SET_GLOBAL`'s runtime write-through check (§4.5): if the global
    /// currently holds a reference, assignment chases through it; otherwise
    /// it rebinds the global (subject to the usual cycle check).
    fn set_global_write_through(&mut self, name: &str, v: Value) -> Result<(), VmError> {
        let current = self.get_global(name)?;
        if let Some(r) = current.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
            self.deref_write(r, v, true)
        } else {
            self.assign_global_checked(name, v)
        }
    }

    /// Shared write-through check for subscript/property assignment: if the
    /// slot currently holds a reference, chase through it; otherwise store
    /// directly. `SLOT_SET_*` opcodes skip this and always store directly.
    fn write_through_container_index(&mut self, container: Value, index: Value, v: Value) -> Result<(), VmError> {
        let existing = self.container_get_index(container, index)?;
        if let Some(r) = existing.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
            self.deref_write(r, v, true)
        } else {
            self.container_set_index(container, index, v)
        }
    }

    fn write_through_container_property(&mut self, container: Value, key: Value, v: Value) -> Result<(), VmError> {
        let existing = self.container_get_property(container, key)?;
        if let Some(r) = existing.as_object().filter(|o| self.is_reference(*o).unwrap_or(false)) {
            self.deref_write(r, v, true)
        } else {
            self.container_set_property(container, key, v)
        }
    }

    // ---- call protocol (§4.6) -------------------------------------------

    fn callee_has_no_upvalues(&self, callee: Value) -> Result<bool, VmError> {
        let r = callee.as_object().ok_or_else(|| VmError::type_mismatch("call", "closure", &callee))?;
        match self.heap.get(r)? {
            Obj::Closure(c) => Ok(c.upvalues.is_empty()),
            _ => Ok(false),
        }
    }

    /// Resolve `callee` (closure, dispatcher, or native function) against
    /// `argc`, push a new frame (or invoke the native directly), and place
    /// the result at `dest` once it returns.
    fn do_call(&mut self, callee: Value, args_start: usize, argc: usize, dest: usize) -> Result<(), VmError> {
        let r = callee.as_object().ok_or_else(|| VmError::type_mismatch("call", "closure, dispatcher, or native function", &callee))?;
        let obj_tag = self.heap.get(r)?.type_tag();
        match obj_tag {
            ObjType::Closure => self.call_closure(r, args_start, argc, dest),
            ObjType::Dispatcher => {
                let overloads = match self.heap.get(r)? {
                    Obj::Dispatcher(d) => d.overloads.clone(),
                    _ => unreachable!(),
                };
                for overload in overloads {
                    let arity = self.function_of(overload)?.arity;
                    if arity == argc {
                        return self.call_closure(overload, args_start, argc, dest);
                    }
                }
                Err(VmError::NoOverload { got: argc })
            }
            ObjType::NativeFunction => self.call_native_at(r, args_start, argc, dest),
            _ => Err(VmError::type_mismatch("call", "closure, dispatcher, or native function", &callee)),
        }
    }

    fn call_closure(&mut self, closure_ref: crate::object::GcRef, args_start: usize, argc: usize, dest: usize) -> Result<(), VmError> {
        let function = self.function_of(closure_ref)?;
        if function.arity != argc {
            return Err(VmError::ArityMismatch { expected: function.arity, got: argc });
        }
        let materialized = self.materialize_call_args(&function, args_start, argc)?;

        if self.frames.len() >= crate::frame::FRAMES_MAX {
            return Err(VmError::StackOverflow);
        }
        let new_base = args_start;
        self.ensure_capacity(new_base + function.max_regs)?;
        self.stack_top = self.stack_top.max(new_base + function.max_regs);
        for (i, v) in materialized.into_iter().enumerate() {
            self.set_slot(new_base + i, v);
        }
        let caller_chunk = self.function_of(self.frames.last().map(|f| f.closure).unwrap_or(closure_ref))?.chunk;
        self.frames.push(crate::frame::CallFrame {
            closure: closure_ref,
            resume_ip: 0,
            stack_base: new_base,
            caller_chunk,
            return_slot: dest,
        });
        Ok(())
    }

    fn call_native_at(&mut self, native_ref: crate::object::GcRef, args_start: usize, argc: usize, dest: usize) -> Result<(), VmError> {
        let native = match self.heap.get(native_ref)? {
            Obj::NativeFunction(n) => *n,
            _ => unreachable!(),
        };
        let values: Vec<Value> = (0..argc).map(|i| self.get_slot(args_start + i)).collect();
        let origins: Vec<Option<usize>> = (0..argc).map(|i| Some(args_start + i)).collect();
        let materialized = self.materialize_arguments(native.qualifiers, &values, &origins)?;
        match self.call_native(&native, &materialized)? {
            Some(v) => {
                self.set_slot(dest, v);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn materialize_call_args(&mut self, function: &Function, args_start: usize, argc: usize) -> Result<Vec<Value>, VmError> {
        match function.qualifier_sig {
            QualifierSig::AllNormalNoRefs => Ok((0..argc).map(|i| self.get_slot(args_start + i)).collect()),
            QualifierSig::AllNormal => (0..argc).map(|i| self.auto_deref(self.get_slot(args_start + i))).collect(),
            QualifierSig::HasQualifiers => {
                let values: Vec<Value> = (0..argc).map(|i| self.get_slot(args_start + i)).collect();
                let origins: Vec<Option<usize>> = (0..argc).map(|i| Some(args_start + i)).collect();
                self.materialize_arguments(&function.qualifiers, &values, &origins)
            }
        }
    }

    /// `TAIL_CALL`/`SMART_TAIL_CALL` (closure path): reuse the current frame
    /// instead of pushing a new one. The caller must already have executed
    /// `CLOSE_FRAME_UPVALUES` (a separate, compiler-emitted instruction).
    /// Dispatcher and native callees fall back to an ordinary (frame-pushing)
    /// call — tail-call reuse only applies to direct closure calls.
    fn do_tail_call(&mut self, callee: Value, base: usize, args_src: usize, argc: usize) -> Result<(), VmError> {
        let r = callee.as_object().ok_or_else(|| VmError::type_mismatch("call", "closure", &callee))?;
        if self.heap.get(r)?.type_tag() != ObjType::Closure {
            // Not a closure: no frame to reuse. The caller has already synced
            // this frame's resume_ip; push a real frame for the callee and
            // return here to receive its result, same as an ordinary CALL.
            let dest = base;
            return self.do_call(callee, args_src, argc, dest);
        }
        let function = self.function_of(r)?;
        if function.arity != argc {
            return Err(VmError::ArityMismatch { expected: function.arity, got: argc });
        }

        let raw_args: Vec<Value> = (0..argc).map(|i| self.get_slot(args_src + i)).collect();
        for (i, v) in raw_args.iter().enumerate() {
            self.set_slot(base + i, *v);
        }
        let materialized = match function.qualifier_sig {
            QualifierSig::AllNormalNoRefs => (0..argc).map(|i| self.get_slot(base + i)).collect(),
            QualifierSig::AllNormal => (0..argc).map(|i| self.auto_deref(self.get_slot(base + i))).collect::<Result<Vec<_>, _>>()?,
            QualifierSig::HasQualifiers => {
                let values: Vec<Value> = (0..argc).map(|i| self.get_slot(base + i)).collect();
                let origins: Vec<Option<usize>> = (0..argc).map(|i| Some(base + i)).collect();
                self.materialize_arguments(&function.qualifiers, &values, &origins)?
            }
        };
        for (i, v) in materialized.into_iter().enumerate() {
            self.set_slot(base + i, v);
        }

        self.ensure_capacity(base + function.max_regs)?;
        self.stack_top = self.stack_top.max(base + function.max_regs);
        let frame = self.frames.last_mut().unwrap();
        frame.closure = r;
        frame.resume_ip = 0;
        Ok(())
    }

    /// `RET`: promote escaping references, close upvalues, pop the frame,
    /// and deliver the value either to a pending `RESUME`'s resumer slot
    /// (§4.8 — the bottommost restored frame's own `return_slot` is
    /// meaningless once its original caller is long gone) or to the popped
    /// frame's ordinary `return_slot` (§4.6). A `withPrompt` body runs
    /// inline in the installing frame rather than as a separate call, so
    /// `POP_PROMPT` — not `RET` — is what finalizes a prompt.
    fn do_return(&mut self, v_raw: Value) -> Result<Option<RunResult>, VmError> {
        let popped = self.frames.pop().ok_or_else(|| VmError::message("RET with no active frame"))?;
        let function = self.function_of(popped.closure)?;
        let v = self.promote_escaping_refs(v_raw, popped.stack_base, popped.stack_base + function.max_regs)?;
        self.close_upvalues_from(popped.stack_base);
        self.stack_top = popped.stack_base;
        let new_frame_count = self.frames.len();

        if matches!(self.resume_stack.last(), Some(r) if r.frame_boundary == new_frame_count) {
            let resume_entry = self.resume_stack.pop().unwrap();
            self.set_slot(resume_entry.result_slot, v);
            return Ok(if self.frames.is_empty() { Some(RunResult::Ok(v)) } else { None });
        }

        if self.frames.is_empty() {
            return Ok(Some(RunResult::Ok(v)));
        }
        self.set_slot(popped.return_slot, v);
        Ok(None)
    }
}

fn to_i32(n: f64) -> i32 {
    (n as i64 as u32) as i32
}

fn shift_mask(n: f64) -> u32 {
    (to_i32(n) as u32) & 0x1F
}
