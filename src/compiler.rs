//! Translation of block scripts into WebAssembly functions.
//!
//! Each script becomes one function of type `(i32 thread) -> i32` that can be suspended at loop boundaries and waits.
//! The body is split into numbered segments; a yield saves the number of the segment to resume at in the thread record and returns,
//! and the next call dispatches straight back into that segment through a `br_table` at the top of the function.
//!
//! Custom procedures are inlined into the calling script unless they run in warp mode, in which case they are called as
//! functions of type `(i32 thread, (i32 tag, i64 payload)*) -> i32` that never yield and return 1 if every script was stopped.

use std::collections::{BTreeMap, BTreeSet};

use compact_str::CompactString;
use serde::{Serialize, Deserialize};

use crate::ast::{self, Input, Literal, Opcode};
use crate::assembler::{HostImport, Helper, target_field, stop_others_index, GLOBAL_REDRAW_REQUESTED, FIRST_VAR_GLOBAL, TARGET_RECORD_SIZE, VARS_OFFSET};
use crate::instruction::{Instruction, BlockType, MemArg, ValType, FunctionBody, mem, nesting};
use crate::runtime::{self, Color, PenParam};
use crate::types::*;
use crate::util;

/// The local holding the thread record pointer (the first parameter of every generated function).
const THREAD: u32 = 0;
/// Offset of the first scratch slot in a thread record.
pub(crate) const THREAD_SLOTS_OFFSET: u32 = 8;

#[derive(Debug)]
pub enum CompileError<'a> {
    UnknownOpcode { block: &'a str, opcode: &'a str },
    MissingInput { block: &'a str, opcode: &'a str, input: &'static str },
    MissingField { block: &'a str, opcode: &'a str, field: &'static str },
    BadField { block: &'a str, field: &'static str, value: &'a str },
    MissingBlock { id: &'a str },
    CyclicScript { block: &'a str },
    UnsupportedHat { block: &'a str, opcode: &'a str },
    UnknownVariable { block: &'a str, variable: &'a str },
    NotAReporter { block: &'a str, opcode: &'a str },
    NotAStatement { block: &'a str, opcode: &'a str },
    UnknownList { block: &'a str, list: &'a str },
}

/// Flags that change the code generated for a project.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Route `say` to `debug.log` and `think` to `debug.assert` instead of the speech bubble imports.
    pub debug: bool,
}

/// A script to compile: the hat block that starts it and the target that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Script<'a> {
    pub target: usize,
    pub hat: &'a str,
}

/// Finds every script in the project, in thread table order (targets in declaration order, hats by ascending id).
pub(crate) fn collect_scripts<'a>(project: &'a ast::Project) -> Result<Vec<Script<'a>>, CompileError<'a>> {
    let mut res = vec![];
    for (target_index, target) in project.targets.iter().enumerate() {
        for (id, block) in target.blocks.iter() {
            if !block.top_level { continue }
            match Opcode::parse(&block.opcode) {
                Some(op) if op.shape() == ast::BlockShape::Hat => res.push(Script { target: target_index, hat: id }),
                Some(_) => tracing::trace!(sprite = %target.name, block = %id, "skipping loose blocks"),
                None if ast::looks_like_hat(&block.opcode) => return Err(CompileError::UnsupportedHat { block: id, opcode: &block.opcode }),
                None => return Err(CompileError::UnknownOpcode { block: id, opcode: &block.opcode }),
            }
        }
    }
    Ok(res)
}

/// A custom procedure definition.
#[derive(Clone, Debug)]
pub(crate) struct Procedure<'a> {
    pub target: usize,
    pub proccode: &'a str,
    /// Input names used by calls, in argument order.
    pub arg_ids: &'a [String],
    /// Names used by argument reporters in the body, in argument order.
    pub arg_names: &'a [String],
    pub boolean_args: Vec<bool>,
    pub warp: bool,
    pub body: Option<&'a str>,
}
impl Procedure<'_> {
    /// Parameter types of the procedure's function.
    pub fn params(&self) -> Vec<ValType> {
        let mut res = vec![ValType::I32];
        for _ in self.arg_ids.iter() {
            res.extend([ValType::I32, ValType::I64]);
        }
        res
    }
}

/// Finds every procedure definition in the project, in function table order.
/// A proccode defined more than once in a target keeps its first definition (by block id).
pub(crate) fn collect_procedures<'a>(project: &'a ast::Project) -> Result<Vec<Procedure<'a>>, CompileError<'a>> {
    let mut res: Vec<Procedure<'a>> = vec![];
    for (target_index, target) in project.targets.iter().enumerate() {
        for (id, block) in target.blocks.iter() {
            if block.opcode != Opcode::ProceduresDefinition.name() { continue }
            let prototype_id = match input(id, block, "custom_block")? {
                Input::Block(x) => x.as_str(),
                Input::Literal(_) => return Err(CompileError::BadField { block: id, field: "custom_block", value: "" }),
            };
            let prototype = target.blocks.get(prototype_id).ok_or(CompileError::MissingBlock { id: prototype_id })?;
            let mutation = prototype.mutation.as_ref().ok_or(CompileError::MissingField { block: prototype_id, opcode: &prototype.opcode, field: "mutation" })?;
            if mutation.argumentids.len() != mutation.argumentnames.len() {
                return Err(CompileError::BadField { block: prototype_id, field: "argumentnames", value: &mutation.proccode });
            }
            if res.iter().any(|x| x.target == target_index && x.proccode == mutation.proccode) {
                tracing::debug!(sprite = %target.name, proccode = %mutation.proccode, "procedure defined more than once, keeping the first");
                continue;
            }
            res.push(Procedure {
                target: target_index,
                proccode: &mutation.proccode,
                arg_ids: &mutation.argumentids,
                arg_names: &mutation.argumentnames,
                boolean_args: mutation.boolean_args(),
                warp: mutation.warp,
                body: block.next.as_deref(),
            });
        }
    }
    Ok(res)
}

/// Everything in a project that becomes a function.
pub(crate) struct Program<'a> {
    pub scripts: Vec<Script<'a>>,
    pub procedures: Vec<Procedure<'a>>,
}
impl<'a> Program<'a> {
    pub fn collect(project: &'a ast::Project) -> Result<Self, CompileError<'a>> {
        Ok(Self { scripts: collect_scripts(project)?, procedures: collect_procedures(project)? })
    }
}

/// Every declared list with its owning target, in list id order.
pub(crate) fn declared_lists(project: &ast::Project) -> Vec<(usize, &ast::List)> {
    project.targets.iter().enumerate().flat_map(|(target, t)| t.lists.iter().map(move |list| (target, list))).collect()
}

/// The constant strings referenced by compiled code.
#[derive(Debug, Clone)]
pub(crate) struct StringTable {
    strings: Vec<CompactString>,
    lookup: BTreeMap<CompactString, u32>,
}
impl StringTable {
    pub fn new() -> Self {
        let mut res = Self { strings: vec![], lookup: Default::default() };
        let f = res.intern("false");
        let t = res.intern("true");
        debug_assert_eq!((f, t), (FALSE_STRING, TRUE_STRING));
        res
    }
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&index) = self.lookup.get(value) { return index }
        let index = self.strings.len() as u32;
        self.strings.push(value.into());
        self.lookup.insert(value.into(), index);
        index
    }
    pub fn into_strings(self) -> Vec<CompactString> {
        self.strings
    }
}

/// Where a variable lives at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum VarStorage {
    /// A mutable global of the variable's representation.
    Global(u32),
    /// The address of a dynamic value slot.
    Memory(u32),
}

#[derive(Clone, Debug)]
pub(crate) struct VarInfo<'a> {
    pub target: usize,
    pub def: &'a ast::Variable,
    pub repr: Repr,
    pub storage: VarStorage,
}

pub(crate) fn literal_repr(value: &Literal) -> Repr {
    match value {
        Literal::Bool(_) => Repr::Boolean,
        Literal::Number(x) => Repr::Number(NumberKind::of(*x)),
        Literal::String(_) => Repr::String,
    }
}

/// State shared by every script of a project during one code generation pass.
pub(crate) struct Context<'a> {
    pub project: &'a ast::Project,
    pub options: CompileOptions,
    pub vars: Vec<VarInfo<'a>>,
    lookup: BTreeMap<(usize, &'a str), usize>,
    lists: BTreeMap<(usize, &'a str), u32>,
    procedures: Vec<Procedure<'a>>,
    procedure_lookup: BTreeMap<(usize, &'a str), usize>,
    /// Function index of the first procedure.
    procedure_base: u32,
    stages: Vec<usize>,
    pub targets_offset: u32,
    pub strings: StringTable,
    assigned: Vec<Option<Repr>>,
}
impl<'a> Context<'a> {
    /// Creates a context for the given variable representations, assigning storage to each variable.
    pub fn new(project: &'a ast::Project, options: CompileOptions, mut vars: Vec<VarInfo<'a>>, program: &Program<'a>) -> Self {
        let (mut next_global, mut next_slot) = (FIRST_VAR_GLOBAL, VARS_OFFSET);
        let mut lookup = BTreeMap::new();
        for (i, var) in vars.iter_mut().enumerate() {
            var.storage = match var.repr {
                Repr::Dynamic => {
                    next_slot += dynamic_slot::SIZE;
                    VarStorage::Memory(next_slot - dynamic_slot::SIZE)
                }
                _ => {
                    next_global += 1;
                    VarStorage::Global(next_global - 1)
                }
            };
            lookup.entry((var.target, var.def.id.as_str())).or_insert(i);
        }
        let mut lists = BTreeMap::new();
        for (i, (target, list)) in declared_lists(project).into_iter().enumerate() {
            lists.entry((target, list.id.as_str())).or_insert(i as u32);
        }
        let procedure_lookup = program.procedures.iter().enumerate().map(|(i, x)| ((x.target, x.proccode), i)).collect();
        let procedure_base = stop_others_index(project.targets.len()) + program.scripts.len() as u32;
        let stages = project.targets.iter().enumerate().filter(|x| x.1.is_stage).map(|x| x.0).collect();
        let assigned = vec![None; vars.len()];

        Self {
            project, options, vars, lookup, lists, procedure_lookup, procedure_base, stages,
            procedures: program.procedures.clone(),
            targets_offset: next_slot,
            strings: StringTable::new(),
            assigned,
        }
    }
    /// The variable named by `id` as seen from `target`: its own variables first, then the stage's.
    fn variable(&self, target: usize, id: &'a str) -> Option<usize> {
        self.lookup.get(&(target, id)).or_else(|| self.stages.iter().find_map(|&stage| self.lookup.get(&(stage, id)))).copied()
    }
    /// Like [`Context::variable`], but for lists.
    fn list(&self, target: usize, id: &'a str) -> Option<u32> {
        self.lists.get(&(target, id)).or_else(|| self.stages.iter().find_map(|&stage| self.lists.get(&(stage, id)))).copied()
    }
    fn record_assignment(&mut self, var: usize, repr: Repr) {
        self.assigned[var] = Some(Repr::join_opt(self.assigned[var], repr));
    }
    pub fn target_addr(&self, target: usize, field: u32) -> u32 {
        self.targets_offset + target as u32 * TARGET_RECORD_SIZE + field
    }
    pub fn compile_script(&mut self, script: Script<'a>) -> Result<CompiledScript, CompileError<'a>> {
        let project = self.project;
        let hat = project.targets[script.target].blocks.get(script.hat).ok_or(CompileError::MissingBlock { id: script.hat })?;

        let mut builder = ScriptBuilder::new(self, script.target, None);
        builder.append_stmts(hat.next.as_deref())?;
        Ok(builder.finish())
    }
    /// Compiles the warp mode function of a procedure.
    pub fn compile_procedure(&mut self, index: usize) -> Result<CompiledScript, CompileError<'a>> {
        let procedure = self.procedures[index].clone();

        let mut builder = ScriptBuilder::new(self, procedure.target, Some(procedure.arg_ids.len() as u32));
        builder.frames.push(Frame { procedure: index, args: ArgStorage::Params, exit: None });
        builder.append_stmts(procedure.body)?;
        Ok(builder.finish())
    }
}

/// Determines the representation of every declared variable.
///
/// Each variable starts out with the representation of its initial value, and code generation is repeated,
/// joining in the representation of everything assigned to it, until nothing changes.
/// Joins only move up a lattice of finite height, so this terminates after a handful of passes.
pub(crate) fn infer_variables<'a>(project: &'a ast::Project, program: &Program<'a>, options: CompileOptions) -> Result<Vec<VarInfo<'a>>, CompileError<'a>> {
    let mut vars = vec![];
    for (target, t) in project.targets.iter().enumerate() {
        for def in t.variables.iter() {
            vars.push(VarInfo { target, def, repr: literal_repr(&def.value), storage: VarStorage::Global(0) });
        }
    }

    for pass in 1.. {
        let mut ctx = Context::new(project, options, vars, program);
        for &script in program.scripts.iter() {
            ctx.compile_script(script)?;
        }
        for procedure in 0..program.procedures.len() {
            ctx.compile_procedure(procedure)?;
        }

        let mut changed = false;
        for (var, assigned) in ctx.vars.iter_mut().zip(ctx.assigned) {
            if let Some(assigned) = assigned {
                let repr = var.repr.join(assigned);
                changed |= repr != var.repr;
                var.repr = repr;
            }
        }
        vars = ctx.vars;

        if !changed {
            tracing::debug!(passes = pass, vars = vars.len(), "variable inference converged");
            break;
        }
    }
    for var in vars.iter() {
        tracing::trace!(id = %var.def.id, variable = %var.def.name, repr = ?var.repr, "variable");
    }
    Ok(vars)
}

pub(crate) struct CompiledScript {
    pub function: FunctionBody,
    /// Number of scratch slots the script needs in its thread record (always zero for procedures, which use locals).
    pub slots: u32,
}

#[derive(Debug)]
enum Emit {
    Ins(Instruction<'static>),
    /// Continue execution at the start of another segment.
    /// Becomes a state update and a branch back to the dispatch loop once the number of segments is known.
    Goto { segment: usize, depth: u32 },
}

#[derive(Clone, Copy)]
enum Comparison {
    Less,
    Greater,
    Equal,
}

fn input<'a>(id: &'a str, block: &'a ast::Block, name: &'static str) -> Result<&'a Input, CompileError<'a>> {
    block.inputs.get(name).ok_or(CompileError::MissingInput { block: id, opcode: &block.opcode, input: name })
}
fn field<'a>(id: &'a str, block: &'a ast::Block, name: &'static str) -> Result<&'a str, CompileError<'a>> {
    block.fields.get(name).map(String::as_str).ok_or(CompileError::MissingField { block: id, opcode: &block.opcode, field: name })
}
fn substack<'a>(block: &'a ast::Block, name: &str) -> Option<&'a str> {
    match block.inputs.get(name) {
        Some(Input::Block(id)) => Some(id),
        _ => None,
    }
}
fn slot_arg(slot: u32) -> MemArg {
    mem::f64(THREAD_SLOTS_OFFSET + 8 * slot)
}

/// Where the arguments of a procedure invocation live.
#[derive(Clone, Copy, Debug)]
enum ArgStorage {
    /// Consecutive pairs of thread record slots, each pair holding a dynamic value, starting at this slot.
    Slots(u32),
    /// The parameters of the function being compiled.
    Params,
}

/// A procedure invocation being compiled.
#[derive(Clone, Copy, Debug)]
struct Frame {
    procedure: usize,
    args: ArgStorage,
    /// The segment `stop this script` continues at; warp functions return instead.
    exit: Option<usize>,
}

struct ScriptBuilder<'c, 'a> {
    ctx: &'c mut Context<'a>,
    target: usize,
    /// The number of procedure arguments when compiling a warp function.
    params: Option<u32>,
    /// The local holding the segment to dispatch to.
    state: u32,
    frames: Vec<Frame>,
    segments: Vec<Vec<Emit>>,
    current: usize,
    /// Structured control nesting depth within the current segment.
    depth: u32,
    slots: u32,
    max_slots: u32,
    statements: BTreeSet<&'a str>,
    reporters: Vec<&'a str>,
}
impl<'c, 'a> ScriptBuilder<'c, 'a> {
    fn new(ctx: &'c mut Context<'a>, target: usize, params: Option<u32>) -> Self {
        Self {
            ctx,
            target,
            params,
            state: params.map(|n| 1 + 2 * n).unwrap_or(1),
            frames: vec![],
            segments: vec![vec![]],
            current: 0,
            depth: 0,
            slots: 0,
            max_slots: 0,
            statements: BTreeSet::new(),
            reporters: vec![],
        }
    }
    /// Whether this is a warp function, where nothing yields and scratch slots are locals.
    fn warp(&self) -> bool {
        self.params.is_some()
    }
    fn push(&mut self, ins: Instruction<'static>) {
        match nesting(&ins) {
            1 => self.depth += 1,
            -1 => self.depth -= 1,
            _ => (),
        }
        self.segments[self.current].push(Emit::Ins(ins));
    }
    fn extend<I: IntoIterator<Item = Instruction<'static>>>(&mut self, ins: I) {
        for ins in ins {
            self.push(ins);
        }
    }
    fn call(&mut self, helper: Helper) {
        self.push(Instruction::Call(helper.index()));
    }
    fn call_host(&mut self, import: HostImport) {
        self.push(Instruction::Call(import.index()));
    }
    fn goto(&mut self, segment: usize) {
        self.segments[self.current].push(Emit::Goto { segment, depth: self.depth });
    }
    fn new_segment(&mut self) -> usize {
        self.segments.push(vec![]);
        self.segments.len() - 1
    }
    /// Starts emitting into `segment`. The current segment must already end in a jump or return.
    fn enter(&mut self, segment: usize) {
        debug_assert_eq!(self.depth, 0);
        self.current = segment;
    }
    /// Suspends the thread until the next tick, resuming at `segment`. Warp functions continue there directly.
    fn yield_to(&mut self, segment: usize) {
        if self.warp() {
            self.goto(segment);
            return;
        }
        self.extend([
            Instruction::LocalGet(THREAD),
            Instruction::I32Const(segment as i32 + 1),
            Instruction::I32Store(mem::i32(0)),
            Instruction::I32Const(1),
            Instruction::Return,
        ]);
    }
    fn alloc_slot(&mut self) -> u32 {
        self.slots += 1;
        self.max_slots = self.max_slots.max(self.slots);
        self.slots - 1
    }
    fn free_slot(&mut self) {
        self.slots -= 1;
    }
    fn slot_local(&self, slot: u32) -> u32 {
        self.state + 1 + slot
    }
    /// Emits the address part of a store to a numeric scratch slot, which must come before the value.
    fn begin_store_slot(&mut self) {
        if !self.warp() {
            self.push(Instruction::LocalGet(THREAD));
        }
    }
    fn end_store_slot(&mut self, slot: u32) {
        match self.warp() {
            true => self.push(Instruction::LocalSet(self.slot_local(slot))),
            false => self.push(Instruction::F64Store(slot_arg(slot))),
        }
    }
    fn load_slot(&mut self, slot: u32) {
        match self.warp() {
            true => self.push(Instruction::LocalGet(self.slot_local(slot))),
            false => self.extend([Instruction::LocalGet(THREAD), Instruction::F64Load(slot_arg(slot))]),
        }
    }
    /// Runs `f`, capturing the code it emits instead of appending it.
    /// Only valid for code that does not cross segments, which holds for all reporters.
    fn capture<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, CompileError<'a>>) -> Result<(T, Vec<Emit>), CompileError<'a>> {
        let (segment, depth) = (self.current, self.depth);
        let saved = std::mem::take(&mut self.segments[segment]);
        let res = f(self);
        let code = std::mem::replace(&mut self.segments[segment], saved);
        debug_assert_eq!((self.current, self.depth), (segment, depth));
        Ok((res?, code))
    }
    fn emit_captured(&mut self, code: Vec<Emit>) {
        self.segments[self.current].extend(code);
    }

    fn block(&self, id: &'a str) -> Result<&'a ast::Block, CompileError<'a>> {
        let project: &'a ast::Project = self.ctx.project;
        project.targets[self.target].blocks.get(id).ok_or(CompileError::MissingBlock { id })
    }
    fn target_def(&self) -> &'a ast::Target {
        let project: &'a ast::Project = self.ctx.project;
        &project.targets[self.target]
    }
    fn field_arg(&self, field: u32) -> u32 {
        self.ctx.target_addr(self.target, field)
    }
    fn load_field(&mut self, field: u32) {
        let addr = self.field_arg(field);
        self.extend([Instruction::I32Const(0), Instruction::F64Load(mem::f64(addr))]);
    }
    fn variable(&self, id: &'a str, block: &'a ast::Block) -> Result<usize, CompileError<'a>> {
        let name = field(id, block, "VARIABLE")?;
        self.ctx.variable(self.target, name).ok_or(CompileError::UnknownVariable { block: id, variable: name })
    }
    /// Pushes the id of the list named by the `LIST` field.
    fn append_list(&mut self, id: &'a str, block: &'a ast::Block) -> Result<(), CompileError<'a>> {
        let name = field(id, block, "LIST")?;
        let list = self.ctx.list(self.target, name).ok_or(CompileError::UnknownList { block: id, list: name })?;
        self.push(Instruction::I32Const(list as i32));
        Ok(())
    }

    fn cast(&mut self, from: Repr, to: Repr) {
        match (from, to) {
            (Repr::Number(_), Repr::Number(_)) | (Repr::Boolean, Repr::Boolean) | (Repr::String, Repr::String) | (Repr::Dynamic, Repr::Dynamic) => (),
            (Repr::Boolean, Repr::String) => (), // booleans are their own string index
            (Repr::Number(_), Repr::Boolean) => self.call(Helper::FloatToBool),
            (Repr::Number(_), Repr::String) => self.call_host(HostImport::CastFloatToString),
            (Repr::Number(_), Repr::Dynamic) => self.call(Helper::BoxFloat),
            (Repr::Boolean, Repr::Number(_)) => self.push(Instruction::F64ConvertI32U),
            (Repr::Boolean, Repr::Dynamic) => self.call(Helper::BoxBool),
            (Repr::String, Repr::Number(_)) => self.call_host(HostImport::CastStringToFloat),
            (Repr::String, Repr::Boolean) => self.call_host(HostImport::CastStringToBool),
            (Repr::String, Repr::Dynamic) => self.call(Helper::BoxString),
            (Repr::Dynamic, Repr::Number(_)) => self.call(Helper::DynToFloat),
            (Repr::Dynamic, Repr::Boolean) => self.call(Helper::DynToBool),
            (Repr::Dynamic, Repr::String) => self.call(Helper::DynToString),
        }
    }
    /// Converts the value on top of the stack to a number fit for arithmetic, which is never NaN.
    fn cast_to_number(&mut self, from: Repr) -> NumberKind {
        match from {
            Repr::Number(NumberKind::Any) => {
                self.call(Helper::SanitizeNan);
                NumberKind::NotNan
            }
            Repr::Number(kind) => kind,
            _ => {
                self.cast(from, Repr::ANY_NUMBER);
                NumberKind::NotNan
            }
        }
    }

    fn append_literal(&mut self, value: &'a Literal) -> Repr {
        match value {
            Literal::Bool(x) => self.push(Instruction::I32Const(*x as i32)),
            Literal::Number(x) => self.push(Instruction::F64Const(*x)),
            Literal::String(x) => {
                let index = self.ctx.strings.intern(x);
                self.push(Instruction::I32Const(index as i32));
            }
        }
        literal_repr(value)
    }
    fn append_input(&mut self, id: &'a str, block: &'a ast::Block, name: &'static str) -> Result<Repr, CompileError<'a>> {
        match input(id, block, name)? {
            Input::Literal(value) => Ok(self.append_literal(value)),
            Input::Block(reporter) => self.append_reporter(reporter),
        }
    }
    fn append_input_as(&mut self, id: &'a str, block: &'a ast::Block, name: &'static str, repr: Repr) -> Result<(), CompileError<'a>> {
        let from = self.append_input(id, block, name)?;
        self.cast(from, repr);
        Ok(())
    }
    fn append_number(&mut self, id: &'a str, block: &'a ast::Block, name: &'static str) -> Result<NumberKind, CompileError<'a>> {
        let from = self.append_input(id, block, name)?;
        Ok(self.cast_to_number(from))
    }
    /// Empty boolean slots are allowed and read as false.
    fn append_condition(&mut self, id: &'a str, block: &'a ast::Block, name: &'static str) -> Result<(), CompileError<'a>> {
        if !block.inputs.contains_key(name) {
            self.push(Instruction::I32Const(0));
            return Ok(());
        }
        self.append_input_as(id, block, name, Repr::Boolean)
    }
    fn append_variable(&mut self, var: usize) -> Repr {
        let info = &self.ctx.vars[var];
        match info.storage {
            VarStorage::Global(global) => {
                let repr = info.repr;
                self.push(Instruction::GlobalGet(global));
                repr
            }
            VarStorage::Memory(addr) => {
                self.extend([
                    Instruction::I32Const(0),
                    Instruction::I32Load(mem::i32(addr + dynamic_slot::TAG)),
                    Instruction::I32Const(0),
                    Instruction::I64Load(mem::i64(addr + dynamic_slot::PAYLOAD)),
                ]);
                Repr::Dynamic
            }
        }
    }
    fn append_assign(&mut self, var: usize, value: impl FnOnce(&mut Self) -> Result<Repr, CompileError<'a>>) -> Result<(), CompileError<'a>> {
        let (repr, storage) = (self.ctx.vars[var].repr, self.ctx.vars[var].storage);
        if let VarStorage::Memory(addr) = storage {
            self.push(Instruction::I32Const(addr as i32));
        }
        let from = value(self)?;
        self.ctx.record_assignment(var, from);
        match storage {
            VarStorage::Global(global) => {
                self.cast(from, repr);
                self.push(Instruction::GlobalSet(global));
            }
            VarStorage::Memory(_) => {
                self.cast(from, Repr::Dynamic);
                self.call(Helper::StoreDynamic);
            }
        }
        Ok(())
    }
    /// A numeric menu shadow keeps its exact text unless the text is already the canonical form of the number.
    fn append_numeric_text(&mut self, text: &'a str) -> Repr {
        let value = runtime::parse_number(text);
        if !value.is_nan() && runtime::stringify_number(value) == text.trim() {
            self.push(Instruction::F64Const(value));
            Repr::Number(NumberKind::of(value))
        } else {
            let index = self.ctx.strings.intern(text);
            self.push(Instruction::I32Const(index as i32));
            Repr::String
        }
    }
    fn append_string_field(&mut self, id: &'a str, block: &'a ast::Block, name: &'static str) -> Result<Repr, CompileError<'a>> {
        let index = self.ctx.strings.intern(field(id, block, name)?);
        self.push(Instruction::I32Const(index as i32));
        Ok(Repr::String)
    }

    fn append_reporter(&mut self, id: &'a str) -> Result<Repr, CompileError<'a>> {
        if self.reporters.contains(&id) {
            return Err(CompileError::CyclicScript { block: id });
        }
        let block = self.block(id)?;
        let op = Opcode::parse(&block.opcode).ok_or(CompileError::UnknownOpcode { block: id, opcode: &block.opcode })?;

        self.reporters.push(id);
        let res = self.append_reporter_op(id, block, op);
        self.reporters.pop();
        res
    }
    fn append_reporter_op(&mut self, id: &'a str, block: &'a ast::Block, op: Opcode) -> Result<Repr, CompileError<'a>> {
        Ok(match op {
            Opcode::MathNumber | Opcode::MathPositiveNumber | Opcode::MathWholeNumber | Opcode::MathInteger | Opcode::MathAngle => {
                let text = field(id, block, "NUM")?;
                self.append_numeric_text(text)
            }
            Opcode::Text => self.append_string_field(id, block, "TEXT")?,
            Opcode::LooksCostume => self.append_string_field(id, block, "COSTUME")?,
            Opcode::PenMenuColorParam => self.append_string_field(id, block, "colorParam")?,
            Opcode::ColourPicker => self.append_string_field(id, block, "COLOUR")?,

            Opcode::OperatorAdd | Opcode::OperatorSubtract | Opcode::OperatorMultiply => {
                let a = self.append_number(id, block, "NUM1")?;
                let b = self.append_number(id, block, "NUM2")?;
                self.push(match op {
                    Opcode::OperatorAdd => Instruction::F64Add,
                    Opcode::OperatorSubtract => Instruction::F64Sub,
                    _ => Instruction::F64Mul,
                });
                Repr::Number(a.arithmetic(b))
            }
            Opcode::OperatorDivide => {
                self.append_number(id, block, "NUM1")?;
                self.append_number(id, block, "NUM2")?;
                self.push(Instruction::F64Div);
                Repr::ANY_NUMBER
            }
            Opcode::OperatorMod => {
                self.append_number(id, block, "NUM1")?;
                self.append_number(id, block, "NUM2")?;
                self.call_host(HostImport::MathMod);
                Repr::ANY_NUMBER
            }
            Opcode::OperatorRound => {
                self.append_number(id, block, "NUM")?;
                self.call(Helper::Round);
                Repr::Number(NumberKind::NotNan)
            }
            Opcode::OperatorMathOp => {
                let name = field(id, block, "OPERATOR")?;
                let inline = match name {
                    "abs" => Some(Instruction::F64Abs),
                    "floor" => Some(Instruction::F64Floor),
                    "ceiling" => Some(Instruction::F64Ceil),
                    "sqrt" => Some(Instruction::F64Sqrt),
                    _ => None,
                };
                let import = match name {
                    "sin" => Some(HostImport::MathSin),
                    "cos" => Some(HostImport::MathCos),
                    "tan" => Some(HostImport::MathTan),
                    "asin" => Some(HostImport::MathAsin),
                    "acos" => Some(HostImport::MathAcos),
                    "atan" => Some(HostImport::MathAtan),
                    "ln" => Some(HostImport::MathLn),
                    "log" => Some(HostImport::MathLog10),
                    "e ^" => Some(HostImport::MathExp),
                    "10 ^" => Some(HostImport::MathPow10),
                    _ => None,
                };
                let kind = self.append_number(id, block, "NUM")?;
                match (inline, import) {
                    (Some(Instruction::F64Sqrt), _) => {
                        self.push(Instruction::F64Sqrt);
                        Repr::ANY_NUMBER
                    }
                    (Some(ins), _) => {
                        self.push(ins);
                        Repr::Number(kind)
                    }
                    (None, Some(import)) => {
                        self.call_host(import);
                        Repr::ANY_NUMBER
                    }
                    (None, None) => return Err(CompileError::BadField { block: id, field: "OPERATOR", value: name }),
                }
            }
            Opcode::OperatorRandom => {
                self.append_number(id, block, "FROM")?;
                self.append_number(id, block, "TO")?;
                self.call_host(HostImport::MathRandom);
                Repr::Number(NumberKind::NotNan)
            }
            Opcode::OperatorLt => self.append_comparison(id, block, Comparison::Less)?,
            Opcode::OperatorGt => self.append_comparison(id, block, Comparison::Greater)?,
            Opcode::OperatorEquals => self.append_comparison(id, block, Comparison::Equal)?,
            Opcode::OperatorAnd | Opcode::OperatorOr => {
                self.append_condition(id, block, "OPERAND1")?;
                self.append_condition(id, block, "OPERAND2")?;
                self.push(if op == Opcode::OperatorAnd { Instruction::I32And } else { Instruction::I32Or });
                Repr::Boolean
            }
            Opcode::OperatorNot => {
                self.append_condition(id, block, "OPERAND")?;
                self.push(Instruction::I32Eqz);
                Repr::Boolean
            }
            Opcode::OperatorJoin => {
                self.append_input_as(id, block, "STRING1", Repr::String)?;
                self.append_input_as(id, block, "STRING2", Repr::String)?;
                self.call_host(HostImport::OperatorJoin);
                Repr::String
            }
            Opcode::OperatorLetterOf => {
                self.append_number(id, block, "LETTER")?;
                self.append_input_as(id, block, "STRING", Repr::String)?;
                self.call_host(HostImport::OperatorLetterOf);
                Repr::String
            }
            Opcode::OperatorLength => {
                self.append_input_as(id, block, "STRING", Repr::String)?;
                self.call_host(HostImport::OperatorLength);
                Repr::Number(NumberKind::Whole)
            }
            Opcode::OperatorContains => {
                self.append_input_as(id, block, "STRING1", Repr::String)?;
                self.append_input_as(id, block, "STRING2", Repr::String)?;
                self.call_host(HostImport::OperatorContains);
                Repr::Boolean
            }

            Opcode::DataVariable => {
                let var = self.variable(id, block)?;
                self.append_variable(var)
            }
            Opcode::DataItemOfList => {
                self.append_list(id, block)?;
                self.append_input_as(id, block, "INDEX", Repr::Dynamic)?;
                self.call_host(HostImport::ListItem);
                Repr::Dynamic
            }
            Opcode::DataLengthOfList => {
                self.append_list(id, block)?;
                self.call_host(HostImport::ListLength);
                Repr::Number(NumberKind::Whole)
            }
            Opcode::DataListContents => {
                self.append_list(id, block)?;
                self.call_host(HostImport::ListContents);
                Repr::String
            }

            Opcode::ArgumentReporterStringNumber => self.append_argument(id, block, false)?,
            Opcode::ArgumentReporterBoolean => self.append_argument(id, block, true)?,

            Opcode::MotionXPosition => { self.load_field(target_field::X); Repr::ANY_NUMBER }
            Opcode::MotionYPosition => { self.load_field(target_field::Y); Repr::ANY_NUMBER }
            Opcode::MotionDirection => { self.load_field(target_field::DIRECTION); Repr::ANY_NUMBER }
            Opcode::LooksSize => {
                self.load_field(target_field::SIZE);
                self.call(Helper::Round);
                Repr::ANY_NUMBER
            }
            Opcode::LooksCostumeNumberName => match field(id, block, "NUMBER_NAME")? {
                "number" => {
                    let addr = self.field_arg(target_field::COSTUME);
                    self.extend([
                        Instruction::I32Const(0),
                        Instruction::I32Load(mem::i32(addr)),
                        Instruction::I32Const(1),
                        Instruction::I32Add,
                        Instruction::F64ConvertI32S,
                    ]);
                    Repr::Number(NumberKind::Whole)
                }
                value => return Err(CompileError::BadField { block: id, field: "NUMBER_NAME", value }),
            }

            Opcode::SensingTimer => {
                self.call_host(HostImport::SensingTimer);
                Repr::Number(NumberKind::NotNan)
            }
            Opcode::SensingDaysSince2000 => {
                self.call_host(HostImport::SensingDaysSince2000);
                Repr::Number(NumberKind::NotNan)
            }

            _ => return Err(CompileError::NotAReporter { block: id, opcode: &block.opcode }),
        })
    }
    /// Reads an argument of the innermost procedure invocation.
    /// Outside of a procedure, or for an unknown name, string arguments read as 0 and boolean ones as false.
    fn append_argument(&mut self, id: &'a str, block: &'a ast::Block, boolean: bool) -> Result<Repr, CompileError<'a>> {
        let name = field(id, block, "VALUE")?;
        let found = self.frames.last().and_then(|frame| {
            let procedure = &self.ctx.procedures[frame.procedure];
            procedure.arg_names.iter().position(|x| x == name).map(|i| (frame.args, i as u32))
        });
        Ok(match found {
            Some((ArgStorage::Params, i)) => {
                self.extend([Instruction::LocalGet(1 + 2 * i), Instruction::LocalGet(2 + 2 * i)]);
                Repr::Dynamic
            }
            Some((ArgStorage::Slots(first), i)) => {
                let offset = THREAD_SLOTS_OFFSET + 8 * (first + 2 * i);
                self.extend([
                    Instruction::LocalGet(THREAD),
                    Instruction::I32Load(mem::i32(offset + dynamic_slot::TAG)),
                    Instruction::LocalGet(THREAD),
                    Instruction::I64Load(mem::i64(offset + dynamic_slot::PAYLOAD)),
                ]);
                Repr::Dynamic
            }
            None if boolean => {
                self.push(Instruction::I32Const(0));
                Repr::Boolean
            }
            None => {
                self.push(Instruction::F64Const(0.0));
                Repr::Number(NumberKind::Whole)
            }
        })
    }
    fn append_comparison(&mut self, id: &'a str, block: &'a ast::Block, comparison: Comparison) -> Result<Repr, CompileError<'a>> {
        let (a, code_a) = self.capture(|s| s.append_input(id, block, "OPERAND1"))?;
        let (b, code_b) = self.capture(|s| s.append_input(id, block, "OPERAND2"))?;

        // booleans compare like the numbers 0 and 1
        let numeric = |x: Repr| match x {
            Repr::Boolean => Some(NumberKind::Whole),
            Repr::Number(kind) => Some(kind),
            _ => None,
        };

        match (numeric(a), numeric(b)) {
            (Some(ka), Some(kb)) => {
                self.emit_captured(code_a);
                self.cast(a, Repr::ANY_NUMBER);
                self.emit_captured(code_b);
                self.cast(b, Repr::ANY_NUMBER);
                if ka != NumberKind::Any && kb != NumberKind::Any {
                    self.push(match comparison {
                        Comparison::Less => Instruction::F64Lt,
                        Comparison::Greater => Instruction::F64Gt,
                        Comparison::Equal => Instruction::F64Eq,
                    });
                    return Ok(Repr::Boolean);
                }
                self.call(Helper::CompareNumbers);
            }
            _ => {
                self.emit_captured(code_a);
                self.cast(a, Repr::Dynamic);
                self.emit_captured(code_b);
                self.cast(b, Repr::Dynamic);
                self.call_host(HostImport::OperatorCompare);
            }
        }
        self.extend([
            Instruction::I32Const(0),
            match comparison {
                Comparison::Less => Instruction::I32LtS,
                Comparison::Greater => Instruction::I32GtS,
                Comparison::Equal => Instruction::I32Eq,
            },
        ]);
        Ok(Repr::Boolean)
    }

    /// Checks whether a statement chain contains anything that can yield, in which case it must be lowered to segments.
    fn contains_yield(&self, first: Option<&'a str>, seen: &mut BTreeSet<&'a str>) -> Result<bool, CompileError<'a>> {
        let mut next = first;
        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(CompileError::CyclicScript { block: id });
            }
            let block = self.block(id)?;
            match Opcode::parse(&block.opcode) {
                Some(Opcode::ControlRepeat | Opcode::ControlForever | Opcode::ControlWait | Opcode::ControlWaitUntil | Opcode::ControlRepeatUntil) => return Ok(true),
                // inlined bodies need an exit segment
                Some(Opcode::ProceduresCall) if !self.warp() => return Ok(true),
                Some(Opcode::ControlIf | Opcode::ControlIfElse) => {
                    for name in ["SUBSTACK", "SUBSTACK2"] {
                        if self.contains_yield(substack(block, name), seen)? {
                            return Ok(true);
                        }
                    }
                }
                _ => (),
            }
            next = block.next.as_deref();
        }
        Ok(false)
    }

    fn append_stmts(&mut self, first: Option<&'a str>) -> Result<(), CompileError<'a>> {
        let mut next = first;
        while let Some(id) = next {
            if !self.statements.insert(id) {
                return Err(CompileError::CyclicScript { block: id });
            }
            let block = self.block(id)?;
            self.append_stmt(id, block)?;
            next = block.next.as_deref();
        }
        Ok(())
    }
    fn append_stmt(&mut self, id: &'a str, block: &'a ast::Block) -> Result<(), CompileError<'a>> {
        let op = Opcode::parse(&block.opcode).ok_or(CompileError::UnknownOpcode { block: id, opcode: &block.opcode })?;
        let target = self.target as i32;

        match op {
            Opcode::LooksSay | Opcode::LooksThink => {
                if self.ctx.options.debug {
                    self.append_input_as(id, block, "MESSAGE", Repr::Dynamic)?;
                    self.call_host(if op == Opcode::LooksSay { HostImport::DebugLog } else { HostImport::DebugAssert });
                } else {
                    self.push(Instruction::I32Const(target));
                    self.append_input_as(id, block, "MESSAGE", Repr::Dynamic)?;
                    self.call_host(if op == Opcode::LooksSay { HostImport::LooksSay } else { HostImport::LooksThink });
                }
            }
            Opcode::LooksShow | Opcode::LooksHide => {
                self.extend([Instruction::I32Const(target), Instruction::I32Const((op == Opcode::LooksShow) as i32)]);
                self.call(Helper::SetVisible);
            }
            Opcode::LooksSetSizeTo => {
                self.push(Instruction::I32Const(target));
                self.append_number(id, block, "SIZE")?;
                self.call(Helper::SetSize);
            }
            Opcode::LooksChangeSizeBy => {
                self.push(Instruction::I32Const(target));
                self.load_field(target_field::SIZE);
                self.cast_to_number(Repr::ANY_NUMBER);
                self.append_number(id, block, "CHANGE")?;
                self.push(Instruction::F64Add);
                self.call(Helper::SetSize);
            }
            Opcode::LooksSwitchCostumeTo => self.append_switch_costume(id, block)?,
            Opcode::LooksNextCostume => {
                let count = self.target_def().costumes.len() as i32;
                if count > 0 {
                    let addr = self.field_arg(target_field::COSTUME);
                    self.extend([
                        Instruction::I32Const(target),
                        Instruction::I32Const(0),
                        Instruction::I32Load(mem::i32(addr)),
                        Instruction::I32Const(1),
                        Instruction::I32Add,
                        Instruction::I32Const(count),
                        Instruction::I32RemS,
                    ]);
                    self.call(Helper::SetCostume);
                }
            }

            Opcode::MotionGoToXY => {
                self.push(Instruction::I32Const(target));
                self.append_number(id, block, "X")?;
                self.append_number(id, block, "Y")?;
                self.call(Helper::MoveTo);
            }
            Opcode::MotionSetX => {
                self.push(Instruction::I32Const(target));
                self.append_number(id, block, "X")?;
                self.load_field(target_field::Y);
                self.call(Helper::MoveTo);
            }
            Opcode::MotionSetY => {
                self.push(Instruction::I32Const(target));
                self.load_field(target_field::X);
                self.append_number(id, block, "Y")?;
                self.call(Helper::MoveTo);
            }
            Opcode::MotionChangeXBy => {
                self.push(Instruction::I32Const(target));
                self.load_field(target_field::X);
                self.cast_to_number(Repr::ANY_NUMBER);
                self.append_number(id, block, "DX")?;
                self.push(Instruction::F64Add);
                self.load_field(target_field::Y);
                self.call(Helper::MoveTo);
            }
            Opcode::MotionChangeYBy => {
                self.push(Instruction::I32Const(target));
                self.load_field(target_field::X);
                self.load_field(target_field::Y);
                self.cast_to_number(Repr::ANY_NUMBER);
                self.append_number(id, block, "DY")?;
                self.push(Instruction::F64Add);
                self.call(Helper::MoveTo);
            }
            Opcode::MotionPointInDirection => {
                self.push(Instruction::I32Const(target));
                self.append_number(id, block, "DIRECTION")?;
                self.call(Helper::SetDirection);
            }
            Opcode::MotionTurnRight | Opcode::MotionTurnLeft => {
                self.push(Instruction::I32Const(target));
                self.load_field(target_field::DIRECTION);
                self.cast_to_number(Repr::ANY_NUMBER);
                self.append_number(id, block, "DEGREES")?;
                self.push(if op == Opcode::MotionTurnRight { Instruction::F64Add } else { Instruction::F64Sub });
                self.call(Helper::SetDirection);
            }

            Opcode::PenClear => {
                self.call_host(HostImport::PenClear);
                self.extend([Instruction::I32Const(1), Instruction::GlobalSet(GLOBAL_REDRAW_REQUESTED)]);
            }
            Opcode::PenDown => {
                let addr = self.field_arg(target_field::PEN_DOWN);
                self.extend([Instruction::I32Const(0), Instruction::I32Const(1), Instruction::I32Store8(mem::i8(addr))]);
                self.push(Instruction::I32Const(target));
                self.call_host(HostImport::PenDown);
                self.push(Instruction::I32Const(target));
                self.load_field(target_field::X);
                self.load_field(target_field::Y);
                self.call_host(HostImport::PenPoint);
                self.extend([Instruction::I32Const(1), Instruction::GlobalSet(GLOBAL_REDRAW_REQUESTED)]);
            }
            Opcode::PenUp => {
                let addr = self.field_arg(target_field::PEN_DOWN);
                self.extend([Instruction::I32Const(0), Instruction::I32Const(0), Instruction::I32Store8(mem::i8(addr))]);
                self.push(Instruction::I32Const(target));
                self.call_host(HostImport::PenUp);
            }
            Opcode::PenSetColorParamTo | Opcode::PenChangeColorParamBy => {
                let param = self.pen_param(id, block)?;
                let addr = self.field_arg(target_field::PEN_COLOR + 4 * param as u32);
                self.extend([Instruction::I32Const(0), Instruction::I32Const(target), Instruction::I32Const(param as i32)]);
                if op == Opcode::PenChangeColorParamBy {
                    self.extend([Instruction::I32Const(0), Instruction::F32Load(mem::f32(addr)), Instruction::F64PromoteF32]);
                    self.append_number(id, block, "VALUE")?;
                    self.push(Instruction::F64Add);
                } else {
                    self.append_number(id, block, "VALUE")?;
                }
                self.call_host(HostImport::PenSetColorParam);
                self.extend([Instruction::F32DemoteF64, Instruction::F32Store(mem::f32(addr))]);
            }
            Opcode::PenSetSizeTo | Opcode::PenChangeSizeBy => {
                let addr = self.field_arg(target_field::PEN_SIZE);
                self.push(Instruction::I32Const(0));
                if op == Opcode::PenChangeSizeBy {
                    self.load_field(target_field::PEN_SIZE);
                    self.append_number(id, block, "SIZE")?;
                    self.push(Instruction::F64Add);
                } else {
                    self.append_number(id, block, "SIZE")?;
                }
                self.extend([
                    Instruction::F64Const(1.0),
                    Instruction::F64Max,
                    Instruction::F64Const(1200.0),
                    Instruction::F64Min,
                    Instruction::F64Store(mem::f64(addr)),
                ]);
            }
            Opcode::PenSetColorToColor => {
                let text = match input(id, block, "COLOR")? {
                    Input::Literal(Literal::String(x)) => x.as_str(),
                    Input::Block(reporter) => {
                        let shadow = self.block(reporter)?;
                        if shadow.opcode != Opcode::ColourPicker.name() {
                            return Err(CompileError::BadField { block: id, field: "COLOR", value: &shadow.opcode });
                        }
                        field(reporter, shadow, "COLOUR")?
                    }
                    Input::Literal(_) => return Err(CompileError::BadField { block: id, field: "COLOR", value: "" }),
                };
                let color = Color::from_hex(text).ok_or(CompileError::BadField { block: id, field: "COLOUR", value: text })?;
                let (h, s, v, a) = color.to_hsva();
                for (i, value) in [h / 3.6, s * 100.0, v * 100.0, (1.0 - a) * 100.0].into_iter().enumerate() {
                    let addr = self.field_arg(target_field::PEN_COLOR + 4 * i as u32);
                    self.extend([
                        Instruction::I32Const(0),
                        Instruction::F64Const(value as f64),
                        Instruction::F32DemoteF64,
                        Instruction::F32Store(mem::f32(addr)),
                    ]);
                }
            }

            Opcode::DataSetVariableTo => {
                let var = self.variable(id, block)?;
                self.append_assign(var, |s| s.append_input(id, block, "VALUE"))?;
            }
            Opcode::DataChangeVariableBy => {
                let var = self.variable(id, block)?;
                self.append_assign(var, |s| {
                    let current = s.append_variable(var);
                    let a = s.cast_to_number(current);
                    let b = s.append_number(id, block, "VALUE")?;
                    s.push(Instruction::F64Add);
                    Ok(Repr::Number(a.arithmetic(b)))
                })?;
            }

            Opcode::DataAddToList => {
                self.append_list(id, block)?;
                self.append_input_as(id, block, "ITEM", Repr::Dynamic)?;
                self.call_host(HostImport::ListAdd);
            }
            Opcode::DataDeleteOfList => {
                self.append_list(id, block)?;
                self.append_input_as(id, block, "INDEX", Repr::Dynamic)?;
                self.call_host(HostImport::ListDelete);
            }
            Opcode::DataDeleteAllOfList => {
                self.append_list(id, block)?;
                self.call_host(HostImport::ListDeleteAll);
            }
            Opcode::DataInsertAtList | Opcode::DataReplaceItemOfList => {
                self.append_list(id, block)?;
                self.append_input_as(id, block, "INDEX", Repr::Dynamic)?;
                self.append_input_as(id, block, "ITEM", Repr::Dynamic)?;
                self.call_host(if op == Opcode::DataInsertAtList { HostImport::ListInsert } else { HostImport::ListReplace });
            }

            Opcode::ProceduresCall => self.append_call(id, block)?,

            Opcode::SensingResetTimer => self.call_host(HostImport::SensingResetTimer),

            Opcode::ControlIf | Opcode::ControlIfElse => {
                let then = substack(block, "SUBSTACK");
                let otherwise = if op == Opcode::ControlIfElse { substack(block, "SUBSTACK2") } else { None };
                let yields = self.contains_yield(then, &mut BTreeSet::new())? || self.contains_yield(otherwise, &mut BTreeSet::new())?;

                self.append_condition(id, block, "CONDITION")?;
                if !yields {
                    self.push(Instruction::If(BlockType::Empty));
                    self.append_stmts(then)?;
                    if op == Opcode::ControlIfElse {
                        self.push(Instruction::Else);
                        self.append_stmts(otherwise)?;
                    }
                    self.push(Instruction::End);
                } else {
                    let after = self.new_segment();
                    let else_segment = if op == Opcode::ControlIfElse { Some(self.new_segment()) } else { None };

                    self.extend([Instruction::I32Eqz, Instruction::If(BlockType::Empty)]);
                    self.goto(else_segment.unwrap_or(after));
                    self.push(Instruction::End);
                    self.append_stmts(then)?;
                    self.goto(after);

                    if let Some(else_segment) = else_segment {
                        self.enter(else_segment);
                        self.append_stmts(otherwise)?;
                        self.goto(after);
                    }
                    self.enter(after);
                }
            }
            Opcode::ControlRepeat => {
                let slot = self.alloc_slot();
                self.begin_store_slot();
                self.append_number(id, block, "TIMES")?;
                self.call(Helper::Round);
                self.end_store_slot(slot);

                let (check, after) = (self.new_segment(), self.new_segment());
                self.goto(check);
                self.enter(check);
                self.load_slot(slot);
                self.extend([Instruction::F64Const(0.5), Instruction::F64Lt, Instruction::If(BlockType::Empty)]);
                self.goto(after);
                self.push(Instruction::End);
                self.begin_store_slot();
                self.load_slot(slot);
                self.extend([Instruction::F64Const(1.0), Instruction::F64Sub]);
                self.end_store_slot(slot);
                self.append_stmts(substack(block, "SUBSTACK"))?;
                self.yield_to(check);
                self.enter(after);
                self.free_slot();
            }
            Opcode::ControlForever => {
                let (head, after) = (self.new_segment(), self.new_segment());
                self.goto(head);
                self.enter(head);
                self.append_stmts(substack(block, "SUBSTACK"))?;
                self.yield_to(head);
                self.enter(after);
            }
            Opcode::ControlRepeatUntil => {
                let (head, after) = (self.new_segment(), self.new_segment());
                self.goto(head);
                self.enter(head);
                self.append_condition(id, block, "CONDITION")?;
                self.push(Instruction::If(BlockType::Empty));
                self.goto(after);
                self.push(Instruction::End);
                self.append_stmts(substack(block, "SUBSTACK"))?;
                self.yield_to(head);
                self.enter(after);
            }
            Opcode::ControlWaitUntil => {
                let head = self.new_segment();
                self.goto(head);
                self.enter(head);
                self.append_condition(id, block, "CONDITION")?;
                self.extend([Instruction::I32Eqz, Instruction::If(BlockType::Empty)]);
                self.yield_to(head);
                self.push(Instruction::End);
            }
            Opcode::ControlWait => {
                let slot = self.alloc_slot();
                self.begin_store_slot();
                self.call_host(HostImport::RuntimeClock);
                self.append_number(id, block, "DURATION")?;
                self.push(Instruction::F64Add);
                self.end_store_slot(slot);

                let resume = self.new_segment();
                self.yield_to(resume);
                self.enter(resume);
                self.call_host(HostImport::RuntimeClock);
                self.load_slot(slot);
                self.extend([Instruction::F64Lt, Instruction::If(BlockType::Empty)]);
                self.yield_to(resume);
                self.push(Instruction::End);
                self.free_slot();
            }
            Opcode::ControlStop => match field(id, block, "STOP_OPTION")? {
                "all" => {
                    self.call(Helper::StopAll);
                    self.extend([Instruction::I32Const(self.warp() as i32), Instruction::Return]);
                }
                // inside a procedure this only leaves the procedure
                "this script" => match self.frames.last().and_then(|x| x.exit) {
                    Some(exit) => self.goto(exit),
                    None => self.extend([Instruction::I32Const(0), Instruction::Return]),
                }
                "other scripts in sprite" | "other scripts in stage" => {
                    self.extend([Instruction::LocalGet(THREAD), Instruction::Call(stop_others_index(self.target))]);
                }
                value => return Err(CompileError::BadField { block: id, field: "STOP_OPTION", value }),
            }

            _ => return Err(CompileError::NotAStatement { block: id, opcode: &block.opcode }),
        }
        Ok(())
    }
    fn append_call(&mut self, id: &'a str, block: &'a ast::Block) -> Result<(), CompileError<'a>> {
        let mutation = block.mutation.as_ref().ok_or(CompileError::MissingField { block: id, opcode: &block.opcode, field: "mutation" })?;
        let Some(&index) = self.ctx.procedure_lookup.get(&(self.target, mutation.proccode.as_str())) else {
            tracing::debug!(block = id, proccode = %mutation.proccode, "calling an undefined procedure does nothing");
            return Ok(());
        };
        let procedure = self.ctx.procedures[index].clone();
        let args = procedure.arg_ids.len() as u32;

        let recursive = self.frames.iter().any(|x| x.procedure == index);
        if procedure.warp || self.warp() || recursive {
            if recursive && !self.warp() {
                tracing::debug!(block = id, proccode = procedure.proccode, "recursive call runs without yielding");
            }
            self.push(Instruction::LocalGet(THREAD));
            for arg in 0..procedure.arg_ids.len() {
                self.append_call_arg(block, &procedure, arg)?;
            }
            self.extend([
                Instruction::Call(self.ctx.procedure_base + index as u32),
                Instruction::If(BlockType::Empty),
                    Instruction::I32Const(self.warp() as i32),
                    Instruction::Return,
                Instruction::End,
            ]);
            return Ok(());
        }

        let first = self.slots;
        for _ in 0..2 * args {
            self.alloc_slot();
        }
        for arg in 0..args {
            let offset = THREAD_SLOTS_OFFSET + 8 * (first + 2 * arg);
            self.extend([Instruction::LocalGet(THREAD), Instruction::I32Const(offset as i32), Instruction::I32Add]);
            self.append_call_arg(block, &procedure, arg as usize)?;
            self.call(Helper::StoreDynamic);
        }

        // the body may already have been inlined elsewhere in this script
        let exit = self.new_segment();
        let statements = std::mem::take(&mut self.statements);
        self.frames.push(Frame { procedure: index, args: ArgStorage::Slots(first), exit: Some(exit) });
        let res = self.append_stmts(procedure.body);
        self.frames.pop();
        self.statements = statements;
        res?;

        self.goto(exit);
        self.enter(exit);
        for _ in 0..2 * args {
            self.free_slot();
        }
        Ok(())
    }
    /// Pushes one argument of a call as a dynamic value. Missing inputs are empty strings, or false for boolean arguments.
    fn append_call_arg(&mut self, block: &'a ast::Block, procedure: &Procedure<'a>, arg: usize) -> Result<(), CompileError<'a>> {
        let from = match block.inputs.get(procedure.arg_ids[arg].as_str()) {
            Some(Input::Literal(value)) => self.append_literal(value),
            Some(Input::Block(reporter)) => self.append_reporter(reporter)?,
            None if procedure.boolean_args.get(arg).copied().unwrap_or(false) => {
                self.push(Instruction::I32Const(0));
                Repr::Boolean
            }
            None => {
                let index = self.ctx.strings.intern("");
                self.push(Instruction::I32Const(index as i32));
                Repr::String
            }
        };
        self.cast(from, Repr::Dynamic);
        Ok(())
    }
    fn pen_param(&self, id: &'a str, block: &'a ast::Block) -> Result<PenParam, CompileError<'a>> {
        let name = match input(id, block, "COLOR_PARAM")? {
            Input::Literal(Literal::String(x)) => x.as_str(),
            Input::Block(reporter) => {
                let menu = self.block(reporter)?;
                if menu.opcode != Opcode::PenMenuColorParam.name() {
                    return Err(CompileError::BadField { block: id, field: "COLOR_PARAM", value: &menu.opcode });
                }
                field(reporter, menu, "colorParam")?
            }
            Input::Literal(_) => return Err(CompileError::BadField { block: id, field: "COLOR_PARAM", value: "" }),
        };
        PenParam::from_menu(name).ok_or(CompileError::BadField { block: id, field: "colorParam", value: name })
    }
    fn append_switch_costume(&mut self, id: &'a str, block: &'a ast::Block) -> Result<(), CompileError<'a>> {
        let costumes = &self.target_def().costumes;
        if costumes.is_empty() { return Ok(()) }
        let count = costumes.len() as i32;
        let target = self.target as i32;
        let current = self.field_arg(target_field::COSTUME);

        let wrap = |x: f64| util::modulus(runtime::round(x) - 1.0, count as f64) as i32;
        let name = match input(id, block, "COSTUME")? {
            Input::Literal(Literal::String(x)) => Some(x.as_str()),
            Input::Literal(Literal::Number(x)) => {
                self.extend([Instruction::I32Const(target), Instruction::I32Const(wrap(*x))]);
                self.call(Helper::SetCostume);
                return Ok(());
            }
            Input::Block(reporter) => {
                let menu = self.block(reporter)?;
                if menu.opcode == Opcode::LooksCostume.name() { Some(field(reporter, menu, "COSTUME")?) } else { None }
            }
            Input::Literal(Literal::Bool(_)) => None,
        };

        match name {
            Some(name) => {
                let index = match costumes.iter().position(|x| x.name == name) {
                    Some(index) => index as i32,
                    None => match name {
                        "next costume" | "previous costume" => {
                            let step = if name == "next costume" { 1 } else { count - 1 };
                            self.extend([
                                Instruction::I32Const(target),
                                Instruction::I32Const(0),
                                Instruction::I32Load(mem::i32(current)),
                                Instruction::I32Const(step),
                                Instruction::I32Add,
                                Instruction::I32Const(count),
                                Instruction::I32RemS,
                            ]);
                            self.call(Helper::SetCostume);
                            return Ok(());
                        }
                        _ => {
                            let value = runtime::parse_number(name);
                            if value.is_nan() || name.trim().is_empty() {
                                tracing::debug!(block = id, costume = name, "switching to unknown costume does nothing");
                                return Ok(());
                            }
                            wrap(value)
                        }
                    }
                };
                self.extend([Instruction::I32Const(target), Instruction::I32Const(index)]);
                self.call(Helper::SetCostume);
            }
            None => {
                self.push(Instruction::I32Const(target));
                self.append_number(id, block, "COSTUME")?;
                self.call(Helper::Round);
                self.extend([Instruction::F64Const(1.0), Instruction::F64Sub, Instruction::F64Const(count as f64)]);
                self.call_host(HostImport::MathMod);
                self.push(Instruction::I32TruncSatF64S);
                self.call(Helper::SetCostume);
            }
        }
        Ok(())
    }

    /// Completes the function and lays out the segment dispatch.
    /// Scripts resume at the segment saved in their thread record, while warp functions always start at the first one.
    fn finish(mut self) -> CompiledScript {
        self.extend([Instruction::I32Const(0), Instruction::Return]);
        let state = self.state;
        let n = self.segments.len();

        let mut body = Vec::with_capacity(self.segments.iter().map(Vec::len).sum::<usize>() + 3 * n + 8);
        if !self.warp() {
            body.extend([
                Instruction::LocalGet(THREAD),
                Instruction::I32Load(mem::i32(0)),
                Instruction::I32Const(1),
                Instruction::I32Sub,
                Instruction::LocalSet(state),
            ]);
        }
        body.push(Instruction::Loop(BlockType::Empty));
        body.extend((0..n).map(|_| Instruction::Block(BlockType::Empty)));
        body.push(Instruction::LocalGet(state));
        body.push(Instruction::BrTable((0..n as u32).collect::<Vec<_>>().into(), 0));

        for (k, segment) in self.segments.into_iter().enumerate() {
            body.push(Instruction::End);
            for emit in segment {
                match emit {
                    Emit::Ins(ins) => body.push(ins),
                    Emit::Goto { segment, depth } => body.extend([
                        Instruction::I32Const(segment as i32),
                        Instruction::LocalSet(state),
                        Instruction::Br((n - 1 - k) as u32 + depth),
                    ]),
                }
            }
        }
        body.push(Instruction::End);
        body.push(Instruction::Unreachable);

        let (locals, slots) = match self.params {
            Some(_) => (std::iter::once(ValType::I32).chain((0..self.max_slots).map(|_| ValType::F64)).collect(), 0),
            None => (vec![ValType::I32], self.max_slots),
        };
        CompiledScript { function: FunctionBody::new(locals, body), slots }
    }
}

#[cfg(test)]
fn single_script(blocks: serde_json::Value) -> ast::Project {
    serde_json::from_value(serde_json::json!({
        "targets": [{ "name": "Stage", "is_stage": true, "variables": [{ "id": "g", "name": "global", "value": 0 }] }, {
            "name": "Sprite1",
            "variables": [{ "id": "s", "name": "text", "value": "hello" }],
            "costumes": [{ "name": "a" }, { "name": "b" }],
            "blocks": blocks,
        }]
    })).unwrap()
}

#[test]
fn test_segment_dispatch() {
    let project = single_script(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "loop", "top_level": true },
        "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 3 }, "SUBSTACK": { "block": "body" } } },
        "body": { "opcode": "looks_show" },
    }));
    let program = Program::collect(&project).unwrap();
    assert_eq!(program.scripts, [Script { target: 1, hat: "hat" }]);

    let vars = infer_variables(&project, &program, CompileOptions::default()).unwrap();
    let mut ctx = Context::new(&project, CompileOptions::default(), vars, &program);
    let script = ctx.compile_script(program.scripts[0]).unwrap();
    assert_eq!(script.slots, 1);

    let body = &script.function.body;
    assert_eq!(body.iter().map(nesting).sum::<i32>(), 0);
    let table = body.iter().find_map(|x| match x { Instruction::BrTable(targets, _) => Some(targets.to_vec()), _ => None }).unwrap();
    assert_eq!(table, [0, 1, 2]);
    assert_eq!(body.iter().filter(|x| matches!(x, Instruction::Block(BlockType::Empty))).count(), 3);
    assert!(matches!(body.last(), Some(Instruction::Unreachable)));
    assert!(body.iter().any(|x| matches!(x, Instruction::I32Const(2))), "yield back to the loop check");
}

#[test]
fn test_procedures() {
    let project = single_script(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "call1", "top_level": true },
        "call1": {
            "opcode": "procedures_call", "next": "call2",
            "inputs": { "arg_n": { "literal": 3 } },
            "mutation": { "proccode": "spin %n times %b", "argumentids": ["arg_n", "arg_b"] },
        },
        "call2": { "opcode": "procedures_call", "mutation": { "proccode": "fast %s" } },
        "def": { "opcode": "procedures_definition", "next": "loop", "top_level": true, "inputs": { "custom_block": { "block": "proto" } } },
        "proto": {
            "opcode": "procedures_prototype",
            "mutation": { "proccode": "spin %n times %b", "argumentids": ["arg_n", "arg_b"], "argumentnames": ["n", "b"] },
        },
        "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "block": "n" }, "SUBSTACK": { "block": "turn" } } },
        "n": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "n" } },
        "turn": { "opcode": "motion_turnright", "inputs": { "DEGREES": { "literal": 15 } } },
        "def2": { "opcode": "procedures_definition", "next": "wait", "top_level": true, "inputs": { "custom_block": { "block": "proto2" } } },
        "proto2": {
            "opcode": "procedures_prototype",
            "mutation": { "proccode": "fast %s", "argumentids": ["a"], "argumentnames": ["text"], "warp": true },
        },
        "wait": { "opcode": "control_wait", "inputs": { "DURATION": { "literal": 0 } } },
    }));
    let program = Program::collect(&project).unwrap();
    assert_eq!(program.scripts.len(), 1);
    assert_eq!(program.procedures.iter().map(|x| (x.proccode, x.warp, x.boolean_args.clone())).collect::<Vec<_>>(), [
        ("spin %n times %b", false, vec![false, true]),
        ("fast %s", true, vec![false]),
    ]);

    let vars = infer_variables(&project, &program, CompileOptions::default()).unwrap();
    let mut ctx = Context::new(&project, CompileOptions::default(), vars, &program);
    let first_procedure = stop_others_index(2) + 1;

    // the non-warp procedure is inlined: two slots for each argument, then the loop counter
    let script = ctx.compile_script(program.scripts[0]).unwrap();
    assert_eq!(script.slots, 5);
    let calls = script.function.body.iter().filter_map(|x| match x { Instruction::Call(f) => Some(*f), _ => None }).collect::<Vec<_>>();
    assert!(!calls.contains(&first_procedure));
    assert!(calls.contains(&(first_procedure + 1)));
    assert!(calls.contains(&Helper::StoreDynamic.index()));

    // warp functions keep the wait counter in a local after the state local
    let warp = ctx.compile_procedure(1).unwrap();
    assert_eq!(warp.slots, 0);
    assert_eq!(warp.function.locals, [ValType::I32, ValType::F64]);
    assert!(!warp.function.body.iter().any(|x| matches!(x, Instruction::I32Store(_))), "warp functions never save a resume point");
    assert!(warp.function.body.iter().any(|x| matches!(x, Instruction::LocalSet(4))));
}

#[test]
fn test_lists() {
    let project: ast::Project = serde_json::from_value(serde_json::json!({
        "targets": [{ "name": "Stage", "is_stage": true, "lists": [{ "id": "shared", "name": "shared", "value": [1, "a"] }] }, {
            "name": "Sprite1",
            "lists": [{ "id": "own", "name": "own" }],
            "blocks": {
                "hat": { "opcode": "event_whenflagclicked", "next": "add", "top_level": true },
                "add": { "opcode": "data_addtolist", "fields": { "LIST": "own" }, "inputs": { "ITEM": { "block": "len" } }, "next": "say" },
                "len": { "opcode": "data_lengthoflist", "fields": { "LIST": "shared" } },
                "say": { "opcode": "looks_say", "inputs": { "MESSAGE": { "block": "item" } } },
                "item": { "opcode": "data_itemoflist", "fields": { "LIST": "own" }, "inputs": { "INDEX": { "literal": "last" } } },
            },
        }],
    })).unwrap();
    assert_eq!(declared_lists(&project).iter().map(|x| (x.0, x.1.id.as_str())).collect::<Vec<_>>(), [(0, "shared"), (1, "own")]);

    let program = Program::collect(&project).unwrap();
    let vars = infer_variables(&project, &program, CompileOptions::default()).unwrap();
    let mut ctx = Context::new(&project, CompileOptions::default(), vars, &program);
    let body = ctx.compile_script(program.scripts[0]).unwrap().function.body;
    let calls = body.iter().filter_map(|x| match x { Instruction::Call(f) => Some(*f), _ => None }).collect::<Vec<_>>();
    assert_eq!(calls[..3], [HostImport::ListLength.index(), Helper::BoxFloat.index(), HostImport::ListAdd.index()]);
    assert!(calls.contains(&HostImport::ListItem.index()));
    assert!(body.iter().any(|x| matches!(x, Instruction::I32Const(1))), "sprite list id");
}

#[test]
fn test_variable_inference() {
    let project = single_script(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "a", "top_level": true },
        "a": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } }, "next": "b" },
        "b": { "opcode": "data_setvariableto", "fields": { "VARIABLE": "s" }, "inputs": { "VALUE": { "block": "v" } } },
        "v": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },
    }));
    let program = Program::collect(&project).unwrap();
    let vars = infer_variables(&project, &program, CompileOptions::default()).unwrap();
    assert_eq!(vars.iter().map(|x| (x.def.id.as_str(), x.repr)).collect::<Vec<_>>(), [
        ("g", Repr::Number(NumberKind::NotNan)),
        ("s", Repr::Dynamic),
    ]);

    let ctx = Context::new(&project, CompileOptions::default(), vars, &program);
    assert_eq!(ctx.vars[0].storage, VarStorage::Global(FIRST_VAR_GLOBAL));
    assert_eq!(ctx.vars[1].storage, VarStorage::Memory(VARS_OFFSET));
    assert_eq!(ctx.targets_offset, VARS_OFFSET + dynamic_slot::SIZE);
}

#[test]
fn test_compile_errors() {
    fn first_error(blocks: serde_json::Value) -> String {
        let project = single_script(blocks);
        let res = Program::collect(&project).and_then(|program| {
            let vars = infer_variables(&project, &program, CompileOptions::default())?;
            let mut ctx = Context::new(&project, CompileOptions::default(), vars, &program);
            for &script in program.scripts.iter() {
                ctx.compile_script(script)?;
            }
            Ok(())
        });
        format!("{:?}", res.unwrap_err())
    }

    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenkeypressed", "top_level": true },
    })), r#"UnsupportedHat { block: "hat", opcode: "event_whenkeypressed" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "looks_glide" },
    })), r#"UnknownOpcode { block: "x", opcode: "looks_glide" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
    })), r#"MissingBlock { id: "x" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "looks_show", "next": "y" },
        "y": { "opcode": "looks_hide", "next": "x" },
    })), r#"CyclicScript { block: "x" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "looks_say" },
    })), r#"MissingInput { block: "x", opcode: "looks_say", input: "MESSAGE" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "data_setvariableto", "fields": { "VARIABLE": "nope" }, "inputs": { "VALUE": { "literal": 1 } } },
    })), r#"UnknownVariable { block: "x", variable: "nope" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "looks_say", "inputs": { "MESSAGE": { "block": "y" } } },
        "y": { "opcode": "looks_show" },
    })), r#"NotAReporter { block: "y", opcode: "looks_show" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "operator_add", "inputs": { "NUM1": { "literal": 1 }, "NUM2": { "literal": 1 } } },
    })), r#"NotAStatement { block: "x", opcode: "operator_add" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "control_stop", "fields": { "STOP_OPTION": "everything" } },
    })), r#"BadField { block: "x", field: "STOP_OPTION", value: "everything" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "control_stop" },
    })), r#"MissingField { block: "x", opcode: "control_stop", field: "STOP_OPTION" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "looks_say", "inputs": { "MESSAGE": { "block": "y" } } },
        "y": { "opcode": "operator_not", "inputs": { "OPERAND": { "block": "y" } } },
    })), r#"CyclicScript { block: "y" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "data_deletealloflist", "fields": { "LIST": "nope" } },
    })), r#"UnknownList { block: "x", list: "nope" }"#);
    assert_eq!(first_error(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "procedures_call" },
    })), r#"MissingField { block: "x", opcode: "procedures_call", field: "mutation" }"#);
    assert_eq!(first_error(serde_json::json!({
        "def": { "opcode": "procedures_definition", "top_level": true, "inputs": { "custom_block": { "block": "proto" } } },
        "proto": { "opcode": "procedures_prototype", "mutation": { "proccode": "f %s", "argumentids": ["a"] } },
    })), r#"BadField { block: "proto", field: "argumentnames", value: "f %s" }"#);
}

#[test]
fn test_string_table() {
    let mut strings = StringTable::new();
    assert_eq!(strings.intern("hello"), 2);
    assert_eq!(strings.intern("true"), TRUE_STRING);
    assert_eq!(strings.intern("hello"), 2);
    assert_eq!(strings.intern(""), 3);
    assert_eq!(strings.into_strings(), ["false", "true", "hello", ""]);
}
