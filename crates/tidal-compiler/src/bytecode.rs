//! The instruction emitter.
//!
//! [`ByteCode`] is an append-only instruction list. A front end walks its
//! resolved tree and calls the `emit_*` methods; every method returns the
//! address of the instruction it appended (or, for loads and stores, how
//! many instructions it needed) so jumps can be back-patched.

use crate::scope::{RuntimeScopeBlock, RuntimeScopeFrame};
use std::ops::{Deref, DerefMut};
use tidal_core::{Instruction, LuaError, OpCode, SourceRef, SymbolRef, Value};

/// Longest name kept on a `Debug` instruction.
const DEBUG_NAME_LIMIT: usize = 32;

/// What a `Meta` instruction introduces; stored in its `num_val2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MetaKind {
    ChunkEntrypoint = 0,
    FunctionEntrypoint = 1,
}

impl MetaKind {
    pub fn from_i32(v: i32) -> Option<MetaKind> {
        match v {
            0 => Some(MetaKind::ChunkEntrypoint),
            1 => Some(MetaKind::FunctionEntrypoint),
            _ => None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ByteCode {
    pub code: Vec<Instruction>,
    source_stack: Vec<Option<SourceRef>>,
    current_source: Option<SourceRef>,
}

/// Keeps a source location active until dropped.
///
/// Derefs to the [`ByteCode`] it was created from, so emission continues
/// through the guard.
pub struct SourceScope<'a> {
    code: &'a mut ByteCode,
}

impl Deref for SourceScope<'_> {
    type Target = ByteCode;

    fn deref(&self) -> &ByteCode {
        self.code
    }
}

impl DerefMut for SourceScope<'_> {
    fn deref_mut(&mut self) -> &mut ByteCode {
        self.code
    }
}

impl Drop for SourceScope<'_> {
    fn drop(&mut self) {
        self.code.current_source = self.code.source_stack.pop().flatten();
    }
}

impl ByteCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn get(&self, ip: usize) -> Option<&Instruction> {
        self.code.get(ip)
    }

    /// Address the next emitted instruction will get.
    pub fn next_address(&self) -> usize {
        self.code.len()
    }

    /// Address of the most recently emitted instruction.
    pub fn last_address(&self) -> usize {
        self.code.len().saturating_sub(1)
    }

    pub fn current_source_ref(&self) -> Option<&SourceRef> {
        self.current_source.as_ref()
    }

    /// Tags everything emitted through the returned guard with `sref`.
    pub fn enter_source(&mut self, sref: Option<SourceRef>) -> SourceScope<'_> {
        let previous = std::mem::replace(&mut self.current_source, sref);
        self.source_stack.push(previous);
        SourceScope { code: self }
    }

    fn append(&mut self, mut instr: Instruction) -> usize {
        instr.source_ref = self.current_source.clone();
        self.code.push(instr);
        self.code.len() - 1
    }

    // ── Back-patching ─────────────────────────────────────────────────────

    pub fn set_jump_target(&mut self, ip: usize, target: usize) -> Result<(), LuaError> {
        let instr = self
            .code
            .get_mut(ip)
            .ok_or_else(|| LuaError::internal(format!("no instruction at {ip} to patch")))?;
        if !instr.op.is_jump() && instr.op != OpCode::Closure {
            return Err(LuaError::internal(format!(
                "instruction at {ip} is {}, not a jump",
                instr.op
            )));
        }
        instr.num_val = target as i32;
        Ok(())
    }

    /// Emits the `Meta` preamble of a function and returns its address.
    ///
    /// The length is filled in by [`ByteCode::finish_function`].
    pub fn emit_meta(&mut self, name: &str, kind: MetaKind) -> usize {
        self.append(
            Instruction::new(OpCode::Meta)
                .with_num(0)
                .with_num2(kind as i32)
                .with_name(name),
        )
    }

    /// Records how many instructions follow the `Meta` at `meta_ip`.
    pub fn finish_function(&mut self, meta_ip: usize) -> Result<(), LuaError> {
        let len = self.last_address().saturating_sub(meta_ip) as i32;
        match self.code.get_mut(meta_ip) {
            Some(meta) if meta.op == OpCode::Meta => {
                meta.num_val = len;
                Ok(())
            }
            _ => Err(LuaError::internal(format!("no META instruction at {meta_ip}"))),
        }
    }

    // ── Plain emitters ────────────────────────────────────────────────────

    pub fn emit_nop(&mut self, comment: &str) -> usize {
        self.append(Instruction::new(OpCode::Nop).with_name(comment))
    }

    pub fn emit_debug(&mut self, text: &str) -> usize {
        let name: String = text.chars().take(DEBUG_NAME_LIMIT).collect();
        self.append(Instruction::new(OpCode::Debug).with_name(&name))
    }

    pub fn emit_invalid(&mut self, reason: &str) -> usize {
        self.append(Instruction::new(OpCode::Invalid).with_name(reason))
    }

    pub fn emit_pop(&mut self, count: i32) -> usize {
        self.append(Instruction::new(OpCode::Pop).with_num(count))
    }

    pub fn emit_copy(&mut self, stack_offset: i32) -> usize {
        self.append(Instruction::new(OpCode::Copy).with_num(stack_offset))
    }

    pub fn emit_swap(&mut self, first: i32, second: i32) -> usize {
        self.append(Instruction::new(OpCode::Swap).with_num(first).with_num2(second))
    }

    pub fn emit_literal(&mut self, value: Value) -> usize {
        self.append(Instruction::new(OpCode::Literal).with_value(value))
    }

    /// `entry_point` is the address of the function's `Meta`.
    pub fn emit_closure(&mut self, captures: &[SymbolRef], entry_point: usize) -> usize {
        self.append(
            Instruction::new(OpCode::Closure)
                .with_symbols(captures)
                .with_num(entry_point as i32),
        )
    }

    pub fn emit_new_table(&mut self, shared: bool) -> usize {
        self.append(Instruction::new(OpCode::NewTable).with_num(shared as i32))
    }

    pub fn emit_tbl_init_n(&mut self) -> usize {
        self.append(Instruction::new(OpCode::TblInitN))
    }

    pub fn emit_tbl_init_i(&mut self, last_position: bool) -> usize {
        self.append(Instruction::new(OpCode::TblInitI).with_num(last_position as i32))
    }

    pub fn emit_args(&mut self, params: &[SymbolRef]) -> usize {
        self.append(Instruction::new(OpCode::Args).with_symbols(params))
    }

    pub fn emit_call(&mut self, argc: i32, debug_name: Option<&str>) -> usize {
        let mut instr = Instruction::new(OpCode::Call).with_num(argc);
        if let Some(name) = debug_name {
            instr = instr.with_name(name);
        }
        self.append(instr)
    }

    pub fn emit_this_call(&mut self, argc: i32, debug_name: Option<&str>) -> usize {
        let mut instr = Instruction::new(OpCode::ThisCall).with_num(argc);
        if let Some(name) = debug_name {
            instr = instr.with_name(name);
        }
        self.append(instr)
    }

    pub fn emit_ret(&mut self, ret_count: i32) -> usize {
        self.append(Instruction::new(OpCode::Ret).with_num(ret_count))
    }

    /// Emits any jump opcode; pass `-1` as the target to patch it later.
    pub fn emit_jump(&mut self, op: OpCode, target: i32) -> usize {
        debug_assert!(op.is_jump(), "{op} is not a jump");
        self.append(Instruction::new(op).with_num(target))
    }

    pub fn emit_mk_tuple(&mut self, count: i32) -> usize {
        self.append(Instruction::new(OpCode::MkTuple).with_num(count))
    }

    pub fn emit_scalar(&mut self) -> usize {
        self.append(Instruction::new(OpCode::Scalar))
    }

    pub fn emit_incr(&mut self, stack_offset: i32) -> usize {
        self.append(Instruction::new(OpCode::Incr).with_num(stack_offset))
    }

    /// `stage` selects the error message: 1 initial value, 2 step, 3 limit.
    pub fn emit_to_num(&mut self, stage: i32) -> usize {
        self.append(Instruction::new(OpCode::ToNum).with_num(stage))
    }

    pub fn emit_exp_tuple(&mut self, stack_offset: i32) -> usize {
        self.append(Instruction::new(OpCode::ExpTuple).with_num(stack_offset))
    }

    pub fn emit_iter_prep(&mut self) -> usize {
        self.append(Instruction::new(OpCode::IterPrep))
    }

    pub fn emit_iter_upd(&mut self) -> usize {
        self.append(Instruction::new(OpCode::IterUpd))
    }

    /// Emits an operator; comparisons get their result normalization.
    pub fn emit_operator(&mut self, op: OpCode) -> usize {
        let ip = self.append(Instruction::new(op));
        match op {
            OpCode::LessEq => {
                self.append(Instruction::new(OpCode::CNot));
            }
            OpCode::Eq | OpCode::Less => {
                self.append(Instruction::new(OpCode::ToBool));
            }
            _ => {}
        }
        ip
    }

    /// The prologue of `obj:name(...)`: leaves the method below `obj`.
    pub fn emit_method_lookup(&mut self, name: &str) -> usize {
        let first = self.emit_copy(0);
        self.emit_index(Some(Value::string(name)), true, false);
        self.emit_swap(0, 1);
        first
    }

    // ── Scopes ────────────────────────────────────────────────────────────

    pub fn emit_begin_fn(&mut self, frame: &RuntimeScopeFrame) -> usize {
        self.append(
            Instruction::new(OpCode::BeginFn)
                .with_symbols(frame.debug_symbols.as_slice())
                .with_num(frame.count as i32)
                .with_num2(frame.to_first_block),
        )
    }

    pub fn emit_enter(&mut self, block: &RuntimeScopeBlock) -> usize {
        self.append(
            Instruction::new(OpCode::Enter)
                .with_num(block.from)
                .with_num2(block.to_inclusive)
                .with_symbols(block.to_be_closed.as_slice()),
        )
    }

    pub fn emit_leave(&mut self, block: &RuntimeScopeBlock) -> usize {
        self.append(
            Instruction::new(OpCode::Leave)
                .with_num(block.from)
                .with_num2(block.to)
                .with_symbols(block.to_be_closed.as_slice()),
        )
    }

    pub fn emit_exit(&mut self, block: &RuntimeScopeBlock) -> usize {
        self.append(
            Instruction::new(OpCode::Exit)
                .with_num(block.from)
                .with_num2(block.to_inclusive)
                .with_symbols(block.to_be_closed.as_slice()),
        )
    }

    pub fn emit_clean(&mut self, block: &RuntimeScopeBlock) -> usize {
        self.append(
            Instruction::new(OpCode::Clean)
                .with_num(block.to + 1)
                .with_num2(block.to_inclusive)
                .with_symbols(block.nested_closers()),
        )
    }

    // ── Variables ─────────────────────────────────────────────────────────

    /// Pushes the value of `sym`; returns the number of instructions emitted.
    pub fn emit_load(&mut self, sym: &SymbolRef) -> Result<usize, LuaError> {
        match sym {
            SymbolRef::Global { name, env } => {
                self.emit_load(env)?;
                self.append(Instruction::new(OpCode::Index).with_value(Value::String(name.clone())));
                Ok(2)
            }
            SymbolRef::Local { .. } => {
                self.append(Instruction::new(OpCode::Local).with_symbol(sym.clone()));
                Ok(1)
            }
            SymbolRef::Upvalue { .. } => {
                self.append(Instruction::new(OpCode::Upvalue).with_symbol(sym.clone()));
                Ok(1)
            }
            SymbolRef::DefaultEnv => Err(LuaError::internal(format!(
                "unexpected symbol type : {sym}"
            ))),
        }
    }

    /// Stores into `sym` the value found `stack_offset` slots down (element
    /// `tuple_index` if it is a tuple); returns the instruction count.
    pub fn emit_store(
        &mut self,
        sym: &SymbolRef,
        stack_offset: i32,
        tuple_index: i32,
    ) -> Result<usize, LuaError> {
        match sym {
            SymbolRef::Global { name, env } => {
                self.emit_load(env)?;
                self.append(
                    Instruction::new(OpCode::IndexSet)
                        .with_symbol(sym.clone())
                        .with_num(stack_offset)
                        .with_num2(tuple_index)
                        .with_value(Value::String(name.clone())),
                );
                Ok(2)
            }
            SymbolRef::Local { .. } => {
                self.append(
                    Instruction::new(OpCode::StoreLcl)
                        .with_symbol(sym.clone())
                        .with_num(stack_offset)
                        .with_num2(tuple_index),
                );
                Ok(1)
            }
            SymbolRef::Upvalue { .. } => {
                self.append(
                    Instruction::new(OpCode::StoreUpv)
                        .with_symbol(sym.clone())
                        .with_num(stack_offset)
                        .with_num2(tuple_index),
                );
                Ok(1)
            }
            SymbolRef::DefaultEnv => Err(LuaError::internal(format!(
                "unexpected symbol type : {sym}"
            ))),
        }
    }

    /// Indexes the object on the stack. With `key` absent the key is popped
    /// from the stack too.
    pub fn emit_index(&mut self, key: Option<Value>, is_name_index: bool, is_exp_list: bool) -> usize {
        let op = if is_name_index {
            OpCode::IndexN
        } else if is_exp_list {
            OpCode::IndexL
        } else {
            OpCode::Index
        };
        let mut instr = Instruction::new(op);
        instr.value = key;
        self.append(instr)
    }

    pub fn emit_index_set(
        &mut self,
        stack_offset: i32,
        tuple_index: i32,
        key: Option<Value>,
        is_name_index: bool,
        is_exp_list: bool,
    ) -> usize {
        let op = if is_name_index {
            OpCode::IndexSetN
        } else if is_exp_list {
            OpCode::IndexSetL
        } else {
            OpCode::IndexSet
        };
        let mut instr = Instruction::new(op)
            .with_num(stack_offset)
            .with_num2(tuple_index);
        instr.value = key;
        self.append(instr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tidal_core::SymbolAttributes;

    fn ops(bc: &ByteCode) -> Vec<OpCode> {
        bc.code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn globals_go_through_their_environment() {
        let mut bc = ByteCode::new();
        let g = SymbolRef::global("x", SymbolRef::upvalue("_ENV", 0));
        assert_eq!(bc.emit_store(&g, 0, 0).unwrap(), 2);
        assert_eq!(bc.emit_load(&g).unwrap(), 2);
        assert_eq!(
            ops(&bc),
            vec![OpCode::Upvalue, OpCode::IndexSet, OpCode::Upvalue, OpCode::Index]
        );
        assert_eq!(bc.code[1].value, Some(Value::from("x")));
        assert_eq!(bc.code[1].symbol.as_ref(), Some(&g));
        assert_eq!(bc.code[3].value, Some(Value::from("x")));
    }

    #[test]
    fn locals_and_upvalues_take_one_instruction() {
        let mut bc = ByteCode::new();
        let l = SymbolRef::local("a", 3);
        let u = SymbolRef::upvalue("b", 1);
        assert_eq!(bc.emit_store(&l, 1, 2).unwrap(), 1);
        assert_eq!(bc.emit_load(&u).unwrap(), 1);
        assert_eq!(bc.code[0].op, OpCode::StoreLcl);
        assert_eq!((bc.code[0].num_val, bc.code[0].num_val2), (1, 2));
        assert_eq!(bc.code[1].op, OpCode::Upvalue);
    }

    #[test]
    fn default_env_cannot_be_loaded() {
        let mut bc = ByteCode::new();
        assert!(matches!(bc.emit_load(&SymbolRef::DefaultEnv), Err(LuaError::Internal(_))));
        assert!(matches!(
            bc.emit_store(&SymbolRef::DefaultEnv, 0, 0),
            Err(LuaError::Internal(_))
        ));
        assert!(bc.is_empty());
    }

    #[test]
    fn comparisons_are_normalized() {
        let mut bc = ByteCode::new();
        bc.emit_operator(OpCode::LessEq);
        bc.emit_operator(OpCode::Eq);
        bc.emit_operator(OpCode::Less);
        bc.emit_operator(OpCode::Add);
        assert_eq!(
            ops(&bc),
            vec![
                OpCode::LessEq,
                OpCode::CNot,
                OpCode::Eq,
                OpCode::ToBool,
                OpCode::Less,
                OpCode::ToBool,
                OpCode::Add
            ]
        );
    }

    #[test]
    fn index_variants() {
        let mut bc = ByteCode::new();
        bc.emit_index(Some(Value::from("k")), true, false);
        bc.emit_index(None, false, true);
        bc.emit_index(None, false, false);
        bc.emit_index_set(0, 0, Some(Value::from("k")), true, false);
        bc.emit_index_set(0, 0, None, false, true);
        bc.emit_index_set(1, 0, None, false, false);
        assert_eq!(
            ops(&bc),
            vec![
                OpCode::IndexN,
                OpCode::IndexL,
                OpCode::Index,
                OpCode::IndexSetN,
                OpCode::IndexSetL,
                OpCode::IndexSet
            ]
        );
    }

    #[test]
    fn source_scopes_nest_and_restore() {
        let outer = SourceRef::line(0, 1, 0, 10);
        let inner = SourceRef::line(0, 2, 4, 8);
        let mut bc = ByteCode::new();
        bc.emit_nop("untagged");
        {
            let mut a = bc.enter_source(Some(outer.clone()));
            a.emit_nop("outer");
            {
                let mut b = a.enter_source(Some(inner.clone()));
                b.emit_nop("inner");
            }
            a.emit_nop("outer again");
        }
        bc.emit_nop("untagged again");
        let refs: Vec<_> = bc.code.iter().map(|i| i.source_ref.clone()).collect();
        assert_eq!(refs, vec![None, Some(outer.clone()), Some(inner), Some(outer), None]);
        assert!(bc.current_source_ref().is_none());
    }

    #[test]
    fn scope_instructions_carry_ranges() {
        let closer = SymbolRef::local_with("f", 4, SymbolAttributes::TO_BE_CLOSED);
        let block = RuntimeScopeBlock::new(2, 3, 6).with_closers(vec![closer.clone()]);
        let mut bc = ByteCode::new();
        bc.emit_enter(&block);
        bc.emit_leave(&block);
        bc.emit_exit(&block);
        bc.emit_clean(&block);
        let ranges: Vec<_> = bc.code.iter().map(|i| (i.num_val, i.num_val2)).collect();
        assert_eq!(ranges, vec![(2, 6), (2, 3), (2, 6), (4, 6)]);
        assert_eq!(bc.code[3].symbols(), &[closer]);
    }

    #[test]
    fn function_preamble_is_patched() {
        let mut bc = ByteCode::new();
        let skip = bc.emit_jump(OpCode::Jump, -1);
        let meta = bc.emit_meta("f", MetaKind::FunctionEntrypoint);
        bc.emit_begin_fn(&RuntimeScopeFrame::default());
        bc.emit_ret(0);
        bc.finish_function(meta).unwrap();
        bc.set_jump_target(skip, bc.next_address()).unwrap();
        assert_eq!(bc.code[meta].num_val, 2);
        assert_eq!(bc.code[meta].num_val2, MetaKind::FunctionEntrypoint as i32);
        assert_eq!(bc.code[skip].num_val, 4);
        assert!(bc.finish_function(skip).is_err());
        assert!(bc.set_jump_target(meta, 0).is_err());
    }

    #[test]
    fn method_lookup_prologue() {
        let mut bc = ByteCode::new();
        bc.emit_method_lookup("speak");
        assert_eq!(ops(&bc), vec![OpCode::Copy, OpCode::IndexN, OpCode::Swap]);
        assert_eq!((bc.code[2].num_val, bc.code[2].num_val2), (0, 1));
    }

    #[test]
    fn debug_names_are_truncated() {
        let mut bc = ByteCode::new();
        bc.emit_debug(&"x".repeat(40));
        assert_eq!(bc.code[0].name.as_deref().map(str::len), Some(32));
    }
}
