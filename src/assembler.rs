//! Assembly of compiled scripts into a complete module.
//!
//! Linear memory is laid out as follows, with every offset fixed at compile time:
//!
//! | region          | contents                                                     |
//! |-----------------|--------------------------------------------------------------|
//! | null guard      | 8 unused bytes                                               |
//! | variables       | one 16 byte slot per dynamic variable                        |
//! | targets         | one [`TargetRecord`] per target, in declaration order        |
//! | threads         | one record per script: resume position, then scratch slots   |
//! | strings         | `(ptr, len)` descriptors for each constant, then UTF-8 bytes |
//!
//! Lists are not in linear memory at all: they live on the host and are reached through the `data` imports.
//!
//! Function indices are laid out as imports, then [`Helper`]s, then one `stop_others` function per target,
//! then one function per script, one per custom procedure, and finally the `tick` and `flag_clicked` entry points.

use std::borrow::Cow;
use std::io::{self, Write};

use compact_str::CompactString;
use num_traits::FromPrimitive;
use wasm_encoder::{CodeSection, ConstExpr, CustomSection, DataSection, EntityType, ExportKind, ExportSection};
use wasm_encoder::{FunctionSection, GlobalSection, GlobalType, ImportSection, MemorySection, MemoryType, Module};
use wasmparser::{BinaryReader, Parser, Payload};

use crate::ast::{self, Literal};
use crate::compiler::{self, CompileError, CompileOptions, Context, Program, StringTable, VarStorage};
use crate::encode::*;
use crate::instruction::{Instruction, BlockType, ValType, FunctionBody, mem};
use crate::runtime::{InstantiationError, ModuleValidationError, Value};
use crate::sections::*;
use crate::types::*;

const BYTES_PER_LINE: usize = 10;

pub const NULL_GUARD: u32 = 8;
pub const VARS_OFFSET: u32 = NULL_GUARD;
pub const TARGET_RECORD_SIZE: u32 = 64;
pub const PAGE_SIZE: u32 = 65536;

pub const GLOBAL_ACTIVE_THREADS: u32 = 0;
pub const GLOBAL_REDRAW_REQUESTED: u32 = 1;
pub const GLOBAL_STRINGS_OFFSET: u32 = 2;
pub const GLOBAL_TARGETS_OFFSET: u32 = 3;
pub const GLOBAL_THREADS_OFFSET: u32 = 4;
pub const FIRST_VAR_GLOBAL: u32 = 5;

/// Byte offsets of the fields of a [`TargetRecord`].
pub mod target_field {
    pub const X: u32 = 0;
    pub const Y: u32 = 8;
    pub const DIRECTION: u32 = 16;
    pub const SIZE: u32 = 24;
    pub const PEN_SIZE: u32 = 32;
    /// The four pen color parameters as `f32`s, indexed by [`PenParam`](crate::runtime::PenParam).
    pub const PEN_COLOR: u32 = 40;
    pub const COSTUME: u32 = 56;
    pub const VISIBLE: u32 = 60;
    pub const PEN_DOWN: u32 = 61;
}

/// Names of the custom sections carrying the metadata needed to run a module.
pub mod custom_sections {
    pub const STRINGS: &'static str = "blockwasm.strings";
    pub const TARGETS: &'static str = "blockwasm.targets";
    pub const THREADS: &'static str = "blockwasm.threads";
    pub const LISTS: &'static str = "blockwasm.lists";
    pub const FINGERPRINT: &'static str = "blockwasm.fingerprint";
}

/// The per-target state shared between compiled code and the host.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TargetRecord {
    pub x: f64,
    pub y: f64,
    pub direction: f64,
    pub size: f64,
    pub pen_size: f64,
    /// Color, saturation, brightness, and transparency, each on a 0-100 scale.
    pub pen: [f32; 4],
    pub costume: i32,
    pub visible: bool,
    pub pen_down: bool,
}
impl TargetRecord {
    pub fn new(target: &ast::Target) -> Self {
        let costume = target.current_costume.min(target.costumes.len().saturating_sub(1));
        Self {
            x: target.x,
            y: target.y,
            direction: target.direction,
            size: target.size,
            pen_size: 1.0,
            pen: [66.66, 100.0, 100.0, 0.0],
            costume: costume as i32,
            visible: target.visible,
            pen_down: false,
        }
    }
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        for v in [self.x, self.y, self.direction, self.size, self.pen_size] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in self.pen {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.costume.to_le_bytes());
        out.extend_from_slice(&[self.visible as u8, self.pen_down as u8]);
        out.resize(start + TARGET_RECORD_SIZE as usize, 0);
    }
    /// Reads a record back from the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let f64_at = |pos: u32| Some(f64::from_le_bytes(bytes.get(pos as usize..pos as usize + 8)?.try_into().ok()?));
        let f32_at = |pos: u32| Some(f32::from_le_bytes(bytes.get(pos as usize..pos as usize + 4)?.try_into().ok()?));
        let byte_at = |pos: u32| bytes.get(pos as usize).copied();

        let p = target_field::PEN_COLOR;
        Some(Self {
            x: f64_at(target_field::X)?,
            y: f64_at(target_field::Y)?,
            direction: f64_at(target_field::DIRECTION)?,
            size: f64_at(target_field::SIZE)?,
            pen_size: f64_at(target_field::PEN_SIZE)?,
            pen: [f32_at(p)?, f32_at(p + 4)?, f32_at(p + 8)?, f32_at(p + 12)?],
            costume: i32::from_le_bytes(bytes.get(target_field::COSTUME as usize..target_field::COSTUME as usize + 4)?.try_into().ok()?),
            visible: byte_at(target_field::VISIBLE)? != 0,
            pen_down: byte_at(target_field::PEN_DOWN)? != 0,
        })
    }
}

macro_rules! host_imports {
    ($($variant:ident => ($module:literal, $name:literal) : [$($param:ident),*] -> [$($result:ident),*]),*$(,)?) => {
        /// The host functions imported by every module, in import order.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum HostImport {
            $($variant),*
        }
        impl HostImport {
            pub const ALL: &'static [HostImport] = &[$(HostImport::$variant),*];

            pub fn module(self) -> &'static str {
                match self { $(HostImport::$variant => $module),* }
            }
            pub fn name(self) -> &'static str {
                match self { $(HostImport::$variant => $name),* }
            }
            pub fn ty(self) -> FuncType {
                match self { $(HostImport::$variant => FuncType::new(&[$(ValType::$param),*], &[$(ValType::$result),*])),* }
            }
        }
    };
}
host_imports! {
    DebugLog => ("debug", "log") : [I32, I64] -> [],
    DebugAssert => ("debug", "assert") : [I32, I64] -> [],
    LooksSay => ("looks", "say") : [I32, I32, I64] -> [],
    LooksThink => ("looks", "think") : [I32, I32, I64] -> [],
    MathSin => ("math", "sin") : [F64] -> [F64],
    MathCos => ("math", "cos") : [F64] -> [F64],
    MathTan => ("math", "tan") : [F64] -> [F64],
    MathAsin => ("math", "asin") : [F64] -> [F64],
    MathAcos => ("math", "acos") : [F64] -> [F64],
    MathAtan => ("math", "atan") : [F64] -> [F64],
    MathLn => ("math", "ln") : [F64] -> [F64],
    MathLog10 => ("math", "log10") : [F64] -> [F64],
    MathExp => ("math", "exp") : [F64] -> [F64],
    MathPow10 => ("math", "pow10") : [F64] -> [F64],
    MathMod => ("math", "mod") : [F64, F64] -> [F64],
    MathRandom => ("math", "random") : [F64, F64] -> [F64],
    CastStringToFloat => ("cast", "string2float") : [I32] -> [F64],
    CastStringToBool => ("cast", "string2bool") : [I32] -> [I32],
    CastFloatToString => ("cast", "float2string") : [F64] -> [I32],
    OperatorCompare => ("operator", "compare") : [I32, I64, I32, I64] -> [I32],
    OperatorJoin => ("operator", "join") : [I32, I32] -> [I32],
    OperatorLetterOf => ("operator", "letter_of") : [F64, I32] -> [I32],
    OperatorLength => ("operator", "length") : [I32] -> [F64],
    OperatorContains => ("operator", "contains") : [I32, I32] -> [I32],
    PenClear => ("pen", "clear") : [] -> [],
    PenDown => ("pen", "down") : [I32] -> [],
    PenUp => ("pen", "up") : [I32] -> [],
    PenLine => ("pen", "line") : [I32, F64, F64, F64, F64] -> [],
    PenPoint => ("pen", "point") : [I32, F64, F64] -> [],
    PenSetColorParam => ("pen", "set_color_param") : [I32, I32, F64] -> [F64],
    SpritePositionChanged => ("sprite", "position_changed") : [I32] -> [],
    SpriteSizeChanged => ("sprite", "size_changed") : [I32] -> [],
    SpriteCostumeChanged => ("sprite", "costume_changed") : [I32] -> [],
    SpriteRotationChanged => ("sprite", "rotation_changed") : [I32] -> [],
    SpriteVisibilityChanged => ("sprite", "visibility_changed") : [I32] -> [],
    SensingTimer => ("sensing", "timer") : [] -> [F64],
    SensingResetTimer => ("sensing", "reset_timer") : [] -> [],
    SensingDaysSince2000 => ("sensing", "days_since_2000") : [] -> [F64],
    RuntimeClock => ("runtime", "clock") : [] -> [F64],
    ListAdd => ("data", "list_add") : [I32, I32, I64] -> [],
    ListDelete => ("data", "list_delete") : [I32, I32, I64] -> [],
    ListDeleteAll => ("data", "list_delete_all") : [I32] -> [],
    ListInsert => ("data", "list_insert") : [I32, I32, I64, I32, I64] -> [],
    ListReplace => ("data", "list_replace") : [I32, I32, I64, I32, I64] -> [],
    ListItem => ("data", "list_item") : [I32, I32, I64] -> [I32, I64],
    ListLength => ("data", "list_length") : [I32] -> [F64],
    ListContents => ("data", "list_contents") : [I32] -> [I32],
}
impl HostImport {
    pub fn index(self) -> u32 {
        self as u32
    }
}

const IMPORT_COUNT: u32 = HostImport::ALL.len() as u32;

/// Functions emitted into every module and called from compiled scripts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Helper {
    BoxFloat,
    BoxBool,
    BoxString,
    DynToFloat,
    DynToBool,
    DynToString,
    FloatToBool,
    StoreDynamic,
    SanitizeNan,
    Round,
    CompareNumbers,
    MoveTo,
    SetDirection,
    SetSize,
    SetVisible,
    SetCostume,
    StopAll,
}
impl Helper {
    pub const ALL: &'static [Helper] = &[
        Helper::BoxFloat, Helper::BoxBool, Helper::BoxString, Helper::DynToFloat, Helper::DynToBool, Helper::DynToString,
        Helper::FloatToBool, Helper::StoreDynamic, Helper::SanitizeNan, Helper::Round, Helper::CompareNumbers,
        Helper::MoveTo, Helper::SetDirection, Helper::SetSize, Helper::SetVisible, Helper::SetCostume, Helper::StopAll,
    ];

    pub fn index(self) -> u32 {
        IMPORT_COUNT + self as u32
    }
    fn ty(self) -> FuncType {
        use ValType::*;
        match self {
            Helper::BoxFloat => FuncType::new(&[F64], &[I32, I64]),
            Helper::BoxBool | Helper::BoxString => FuncType::new(&[I32], &[I32, I64]),
            Helper::DynToFloat => FuncType::new(&[I32, I64], &[F64]),
            Helper::DynToBool | Helper::DynToString => FuncType::new(&[I32, I64], &[I32]),
            Helper::FloatToBool => FuncType::new(&[F64], &[I32]),
            Helper::StoreDynamic => FuncType::new(&[I32, I32, I64], &[]),
            Helper::SanitizeNan | Helper::Round => FuncType::new(&[F64], &[F64]),
            Helper::CompareNumbers => FuncType::new(&[F64, F64], &[I32]),
            Helper::MoveTo => FuncType::new(&[I32, F64, F64], &[]),
            Helper::SetDirection | Helper::SetSize => FuncType::new(&[I32, F64], &[]),
            Helper::SetVisible | Helper::SetCostume => FuncType::new(&[I32, I32], &[]),
            Helper::StopAll => FuncType::new(&[], &[]),
        }
    }
    fn body(self, layout: &Layout) -> FunctionBody {
        use Instruction::*;

        // computes the address of the target record for the target in local 0 into local `dest`
        let record = |dest: u32| [
            LocalGet(0), I32Const(TARGET_RECORD_SIZE as i32), I32Mul, I32Const(layout.targets_offset as i32), I32Add, LocalSet(dest),
        ];
        let redraw_if_visible = |rec: u32| [
            LocalGet(rec), I32Load8U(mem::i8(target_field::VISIBLE)),
            If(BlockType::Empty), I32Const(1), GlobalSet(GLOBAL_REDRAW_REQUESTED), End,
        ];
        let tag = |x: ValueTag| I32Const(x as i32);

        let (locals, body) = match self {
            Helper::BoxFloat => (vec![], vec![tag(ValueTag::Number), LocalGet(0), I64ReinterpretF64]),
            Helper::BoxBool => (vec![], vec![tag(ValueTag::Boolean), LocalGet(0), I64ExtendI32U]),
            Helper::BoxString => (vec![], vec![tag(ValueTag::String), LocalGet(0), I64ExtendI32U]),
            Helper::DynToFloat => (vec![], vec![
                LocalGet(0), tag(ValueTag::Number), I32Eq, If(BlockType::Result(ValType::F64)),
                    LocalGet(1), F64ReinterpretI64, Call(Helper::SanitizeNan.index()),
                Else,
                    LocalGet(0), tag(ValueTag::Boolean), I32Eq, If(BlockType::Result(ValType::F64)),
                        LocalGet(1), I32WrapI64, F64ConvertI32U,
                    Else,
                        LocalGet(1), I32WrapI64, Call(HostImport::CastStringToFloat.index()),
                    End,
                End,
            ]),
            Helper::DynToBool => (vec![], vec![
                LocalGet(0), tag(ValueTag::Number), I32Eq, If(BlockType::Result(ValType::I32)),
                    LocalGet(1), F64ReinterpretI64, Call(Helper::FloatToBool.index()),
                Else,
                    LocalGet(0), tag(ValueTag::Boolean), I32Eq, If(BlockType::Result(ValType::I32)),
                        LocalGet(1), I32WrapI64,
                    Else,
                        LocalGet(1), I32WrapI64, Call(HostImport::CastStringToBool.index()),
                    End,
                End,
            ]),
            // booleans are their own string index, so only numbers need converting
            Helper::DynToString => (vec![], vec![
                LocalGet(0), tag(ValueTag::Number), I32Eq, If(BlockType::Result(ValType::I32)),
                    LocalGet(1), F64ReinterpretI64, Call(HostImport::CastFloatToString.index()),
                Else,
                    LocalGet(1), I32WrapI64,
                End,
            ]),
            Helper::FloatToBool => (vec![], vec![
                LocalGet(0), F64Const(0.0), F64Ne, LocalGet(0), LocalGet(0), F64Eq, I32And,
            ]),
            Helper::StoreDynamic => (vec![], vec![
                LocalGet(0), LocalGet(1), I32Store(mem::i32(dynamic_slot::TAG)),
                LocalGet(0), LocalGet(2), I64Store(mem::i64(dynamic_slot::PAYLOAD)),
            ]),
            Helper::SanitizeNan => (vec![], vec![
                LocalGet(0), F64Const(0.0), LocalGet(0), LocalGet(0), F64Eq, Select,
            ]),
            Helper::Round => (vec![ValType::F64], vec![
                LocalGet(0), F64Floor, LocalSet(1),
                LocalGet(1), F64Const(1.0), F64Add,
                LocalGet(1),
                LocalGet(0), LocalGet(1), F64Sub, F64Const(0.5), F64Ge,
                Select,
            ]),
            Helper::CompareNumbers => (vec![], vec![
                LocalGet(0), LocalGet(0), F64Ne, LocalGet(1), LocalGet(1), F64Ne, I32Or, If(BlockType::Result(ValType::I32)),
                    LocalGet(0), Call(Helper::BoxFloat.index()), LocalGet(1), Call(Helper::BoxFloat.index()), Call(HostImport::OperatorCompare.index()),
                Else,
                    LocalGet(0), LocalGet(1), F64Gt, LocalGet(0), LocalGet(1), F64Lt, I32Sub,
                End,
            ]),
            Helper::MoveTo => {
                let mut body = record(3).to_vec();
                body.extend([
                    LocalGet(3), I32Load8U(mem::i8(target_field::PEN_DOWN)), If(BlockType::Empty),
                        LocalGet(0), LocalGet(3), F64Load(mem::f64(target_field::X)), LocalGet(3), F64Load(mem::f64(target_field::Y)),
                        LocalGet(1), LocalGet(2), Call(HostImport::PenLine.index()),
                    End,
                    LocalGet(3), LocalGet(1), F64Store(mem::f64(target_field::X)),
                    LocalGet(3), LocalGet(2), F64Store(mem::f64(target_field::Y)),
                    LocalGet(0), Call(HostImport::SpritePositionChanged.index()),
                    LocalGet(3), I32Load8U(mem::i8(target_field::VISIBLE)), LocalGet(3), I32Load8U(mem::i8(target_field::PEN_DOWN)), I32Or,
                    If(BlockType::Empty), I32Const(1), GlobalSet(GLOBAL_REDRAW_REQUESTED), End,
                ]);
                (vec![ValType::I32], body)
            }
            Helper::SetDirection => {
                let mut body = record(2).to_vec();
                // wraps into (-180, 180], ignoring infinite directions
                body.extend([
                    LocalGet(1), LocalGet(1), F64Sub, F64Const(0.0), F64Eq, If(BlockType::Empty),
                        LocalGet(2),
                        LocalGet(1), LocalGet(1), F64Const(179.0), F64Add, F64Const(360.0), F64Div, F64Floor, F64Const(360.0), F64Mul, F64Sub,
                        F64Store(mem::f64(target_field::DIRECTION)),
                        LocalGet(0), Call(HostImport::SpriteRotationChanged.index()),
                ]);
                body.extend(redraw_if_visible(2));
                body.push(End);
                (vec![ValType::I32], body)
            }
            Helper::SetSize => {
                let mut body = record(2).to_vec();
                body.extend([
                    LocalGet(2), LocalGet(1), F64Const(0.0), F64Max, F64Store(mem::f64(target_field::SIZE)),
                    LocalGet(0), Call(HostImport::SpriteSizeChanged.index()),
                ]);
                body.extend(redraw_if_visible(2));
                (vec![ValType::I32], body)
            }
            Helper::SetVisible => {
                let mut body = record(2).to_vec();
                body.extend([
                    LocalGet(2), LocalGet(1), I32Store8(mem::i8(target_field::VISIBLE)),
                    LocalGet(0), Call(HostImport::SpriteVisibilityChanged.index()),
                    I32Const(1), GlobalSet(GLOBAL_REDRAW_REQUESTED),
                ]);
                (vec![ValType::I32], body)
            }
            Helper::SetCostume => {
                let mut body = record(2).to_vec();
                body.extend([
                    LocalGet(2), LocalGet(1), I32Store(mem::i32(target_field::COSTUME)),
                    LocalGet(0), Call(HostImport::SpriteCostumeChanged.index()),
                ]);
                body.extend(redraw_if_visible(2));
                (vec![ValType::I32], body)
            }
            Helper::StopAll => {
                let mut body = vec![];
                for thread in 0..layout.thread_count {
                    body.extend([I32Const(0), I32Const(0), I32Store(mem::i32(layout.thread_addr(thread)))]);
                }
                body.extend([I32Const(0), GlobalSet(GLOBAL_ACTIVE_THREADS)]);
                (vec![], body)
            }
        };
        FunctionBody::new(locals, body)
    }
}

const HELPER_COUNT: u32 = Helper::ALL.len() as u32;

/// Index of the function that stops every script of `target` except the calling one.
pub fn stop_others_index(target: usize) -> u32 {
    IMPORT_COUNT + HELPER_COUNT + target as u32
}

/// Final memory layout of a module.
#[derive(Clone, Copy, Debug)]
struct Layout {
    targets_offset: u32,
    threads_offset: u32,
    thread_record_size: u32,
    thread_count: usize,
    strings_offset: u32,
    memory_size: u32,
}
impl Layout {
    fn thread_addr(&self, thread: usize) -> u32 {
        self.threads_offset + thread as u32 * self.thread_record_size
    }
    fn pages(&self) -> u32 {
        (crate::util::align_up(self.memory_size, PAGE_SIZE) / PAGE_SIZE).max(1)
    }
}

/// A list declared by some target, along with its initial items.
#[derive(Debug, Clone, PartialEq)]
pub struct ListRecord {
    pub id: CompactString,
    pub name: CompactString,
    pub items: Vec<Value>,
}

/// How an initial list item is stored in the lists section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
enum ItemKind {
    Whole,
    Number,
    String,
    Bool,
}

fn encode_strings<S: AsRef<str>>(strings: &[S]) -> Vec<u8> {
    let mut res = vec![];
    encode_unsigned_varint(strings.len() as u64, &mut res);
    for s in strings {
        encode_utf8_string(s.as_ref(), &mut res);
    }
    res
}
fn encode_indices(indices: &[usize]) -> Vec<u8> {
    let mut res = vec![];
    encode_unsigned_varint(indices.len() as u64, &mut res);
    for &index in indices {
        encode_unsigned_varint(index as u64, &mut res);
    }
    res
}
fn encode_item(item: &Value) -> Vec<u8> {
    let mut res = vec![];
    match item {
        // the short form cannot carry a sign on zero
        Value::Number(x) if x.fract() == 0.0 && x.abs() < 9007199254740992.0 && !(*x == 0.0 && x.is_sign_negative()) => {
            res.push(ItemKind::Whole as u8);
            encode_signed_varint(*x as i64, &mut res);
        }
        Value::Number(x) => {
            res.push(ItemKind::Number as u8);
            encode_unsigned_varint(x.to_bits(), &mut res);
        }
        Value::String(x) => {
            res.push(ItemKind::String as u8);
            encode_utf8_string(x, &mut res);
        }
        Value::Bool(x) => res.extend([ItemKind::Bool as u8, *x as u8]),
    }
    res
}
fn encode_lists(lists: &[ListRecord]) -> Vec<u8> {
    let mut res = vec![];
    encode_unsigned_varint(lists.len() as u64, &mut res);
    for list in lists {
        encode_utf8_string(&list.id, &mut res);
        encode_utf8_string(&list.name, &mut res);
        encode_vector(&list.items.iter().map(encode_item).collect::<Vec<_>>(), &mut res);
    }
    res
}

fn read_strings(mut reader: BinaryReader) -> Result<Vec<CompactString>, InstantiationError> {
    let count = reader.read_var_u32()?;
    let mut res = Vec::with_capacity((count as usize).min(reader.bytes_remaining()));
    for _ in 0..count {
        res.push(reader.read_string()?.into());
    }
    Ok(res)
}
fn read_indices(mut reader: BinaryReader) -> Result<Vec<usize>, InstantiationError> {
    let count = reader.read_var_u32()?;
    let mut res = Vec::with_capacity((count as usize).min(reader.bytes_remaining()));
    for _ in 0..count {
        res.push(reader.read_var_u32()? as usize);
    }
    Ok(res)
}
fn read_lists(mut reader: BinaryReader) -> Result<Vec<ListRecord>, InstantiationError> {
    let count = reader.read_var_u32()?;
    let mut res = Vec::with_capacity((count as usize).min(reader.bytes_remaining()));
    for _ in 0..count {
        let id = reader.read_string()?.into();
        let name = reader.read_string()?.into();
        let item_count = reader.read_var_u32()?;
        let mut items = Vec::with_capacity((item_count as usize).min(reader.bytes_remaining()));
        for _ in 0..item_count {
            let pos = reader.original_position();
            items.push(match ItemKind::from_u8(reader.read_u8()?) {
                Some(ItemKind::Whole) => Value::Number(reader.read_var_i64()? as f64),
                Some(ItemKind::Number) => Value::Number(f64::from_bits(reader.read_var_u64()?)),
                Some(ItemKind::String) => Value::String(reader.read_string()?.into()),
                Some(ItemKind::Bool) => Value::Bool(reader.read_u8()? != 0),
                None => return Err(InstantiationError::BadMetadata { section: custom_sections::LISTS, pos }),
            });
        }
        res.push(ListRecord { id, name, items });
    }
    Ok(res)
}

/// The initializer and type of a global variable, which always has the representation of its literal initial value's class.
fn global_init(value: &Literal, strings: &mut StringTable) -> (ValType, ConstExpr) {
    match value {
        Literal::Number(x) => (ValType::F64, ConstExpr::f64_const(*x)),
        Literal::Bool(x) => (ValType::I32, ConstExpr::i32_const(*x as i32)),
        Literal::String(x) => (ValType::I32, ConstExpr::i32_const(strings.intern(x) as i32)),
    }
}
fn encode_dynamic(value: &Literal, strings: &mut StringTable, out: &mut Vec<u8>) {
    let (tag, payload) = match value {
        Literal::Number(x) => (ValueTag::Number, x.to_bits() as i64),
        Literal::Bool(x) => (ValueTag::Boolean, *x as i64),
        Literal::String(x) => (ValueTag::String, strings.intern(x) as i64),
    };
    out.extend_from_slice(&(tag as u32).to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&payload.to_le_bytes());
}

fn stop_others_body(scripts: &[compiler::Script], target: usize, layout: &Layout) -> FunctionBody {
    use Instruction::*;

    let mut body = vec![];
    for (thread, script) in scripts.iter().enumerate() {
        if script.target != target { continue }
        let addr = layout.thread_addr(thread);
        body.extend([
            LocalGet(0), I32Const(addr as i32), I32Ne,
            I32Const(0), I32Load(mem::i32(addr)), I32Const(0), I32Ne,
            I32And,
            If(BlockType::Empty),
                I32Const(0), I32Const(0), I32Store(mem::i32(addr)),
                GlobalGet(GLOBAL_ACTIVE_THREADS), I32Const(1), I32Sub, GlobalSet(GLOBAL_ACTIVE_THREADS),
            End,
        ]);
    }
    FunctionBody::new(vec![], body)
}

/// Builds the `tick` and `flag_clicked` entry points.
fn entry_bodies(thread_count: usize, first_script: u32, layout: &Layout) -> [FunctionBody; 2] {
    use Instruction::*;

    let mut tick = vec![];
    let mut flag_clicked = vec![];
    for thread in 0..thread_count {
        let addr = layout.thread_addr(thread);
        let pos = mem::i32(addr);
        tick.extend([
            I32Const(0), I32Load(pos), If(BlockType::Empty),
                I32Const(addr as i32), Call(first_script + thread as u32), I32Eqz,
                I32Const(0), I32Load(pos), I32Const(0), I32Ne,
                I32And,
                If(BlockType::Empty),
                    I32Const(0), I32Const(0), I32Store(pos),
                    GlobalGet(GLOBAL_ACTIVE_THREADS), I32Const(1), I32Sub, GlobalSet(GLOBAL_ACTIVE_THREADS),
                End,
            End,
        ]);
        flag_clicked.extend([
            I32Const(0), I32Load(pos), I32Eqz, If(BlockType::Empty),
                GlobalGet(GLOBAL_ACTIVE_THREADS), I32Const(1), I32Add, GlobalSet(GLOBAL_ACTIVE_THREADS),
            End,
            I32Const(0), I32Const(1), I32Store(pos),
        ]);
    }
    [FunctionBody::new(vec![], tick), FunctionBody::new(vec![], flag_clicked)]
}

/// A compiled module along with the metadata needed to run it.
///
/// The metadata is also embedded in the module as custom sections, so [`CompiledProject::from_wasm`] can recover it from the bytes alone.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProject {
    pub wasm: Vec<u8>,
    pub target_names: Vec<CompactString>,
    /// The constant string table.
    pub strings: Vec<CompactString>,
    /// The owning target of each thread, in thread table order.
    pub threads: Vec<usize>,
    /// Every declared list, in list id order.
    pub lists: Vec<ListRecord>,
}
impl CompiledProject {
    /// Compiles a project into a module.
    pub fn compile<'a>(project: &'a ast::Project, options: CompileOptions) -> Result<Self, CompileError<'a>> {
        let program = Program::collect(project)?;
        let vars = compiler::infer_variables(project, &program, options)?;
        let mut ctx = Context::new(project, options, vars, &program);

        let mut types = TypeTable::default();
        let mut imports = ImportSection::new();
        for &import in HostImport::ALL {
            imports.import(import.module(), import.name(), EntityType::Function(types.index(import.ty())));
        }

        let global_type = |val_type: ValType, mutable: bool| GlobalType { val_type, mutable, shared: false };
        let mut globals = vec![
            (global_type(ValType::I32, true), ConstExpr::i32_const(0)),
            (global_type(ValType::I32, true), ConstExpr::i32_const(0)),
        ];
        let mut var_exports = vec![];
        let mut exported_vars = std::collections::BTreeSet::new();
        let mut data = vec![];
        for var in ctx.vars.clone().iter() {
            match var.storage {
                VarStorage::Global(index) => {
                    let (ty, init) = global_init(&var.def.value, &mut ctx.strings);
                    debug_assert_eq!(index as usize, globals.len() + 3);
                    globals.push((global_type(ty, true), init));
                    // every global is exported so the host can find the strings they reference
                    let name = match exported_vars.insert(var.def.id.as_str()) {
                        true => format!("var:{}", var.def.id),
                        false => format!("var:{}#{index}", var.def.id),
                    };
                    var_exports.push((name, index));
                }
                VarStorage::Memory(addr) => {
                    debug_assert_eq!(addr as usize, VARS_OFFSET as usize + data.len());
                    encode_dynamic(&var.def.value, &mut ctx.strings, &mut data);
                }
            }
        }
        for target in project.targets.iter() {
            TargetRecord::new(target).encode(&mut data);
        }

        let mut script_functions = Vec::with_capacity(program.scripts.len());
        let mut max_slots = 0;
        for &script in program.scripts.iter() {
            let compiled = ctx.compile_script(script)?;
            max_slots = max_slots.max(compiled.slots);
            script_functions.push(compiled.function);
        }
        let mut procedure_functions = Vec::with_capacity(program.procedures.len());
        for (index, procedure) in program.procedures.iter().enumerate() {
            let compiled = ctx.compile_procedure(index)?;
            procedure_functions.push((FuncType::new(&procedure.params(), &[ValType::I32]), compiled.function));
        }

        let targets_offset = ctx.targets_offset;
        let strings = ctx.strings.into_strings();
        let threads_offset = targets_offset + project.targets.len() as u32 * TARGET_RECORD_SIZE;
        let thread_record_size = compiler::THREAD_SLOTS_OFFSET + 8 * max_slots;
        let strings_offset = threads_offset + thread_record_size * program.scripts.len() as u32;
        let strings_size = strings.iter().map(|x| 8 + x.len() as u32).sum::<u32>();
        let layout = Layout {
            targets_offset, threads_offset, thread_record_size, strings_offset,
            thread_count: program.scripts.len(),
            memory_size: strings_offset + strings_size,
        };
        tracing::debug!(?layout, scripts = program.scripts.len(), procedures = program.procedures.len(), strings = strings.len(), "memory layout");

        globals.splice(2..2, [
            (global_type(ValType::I32, false), ConstExpr::i32_const(strings_offset as i32)),
            (global_type(ValType::I32, false), ConstExpr::i32_const(targets_offset as i32)),
            (global_type(ValType::I32, false), ConstExpr::i32_const(threads_offset as i32)),
        ]);

        let mut functions = vec![];
        for &helper in Helper::ALL {
            functions.push((types.index(helper.ty()), helper.body(&layout)));
        }
        for target in 0..project.targets.len() {
            functions.push((types.index(FuncType::new(&[ValType::I32], &[])), stop_others_body(&program.scripts, target, &layout)));
        }
        let first_script = IMPORT_COUNT + HELPER_COUNT + project.targets.len() as u32;
        for function in script_functions {
            functions.push((types.index(FuncType::new(&[ValType::I32], &[ValType::I32])), function));
        }
        for (ty, function) in procedure_functions {
            functions.push((types.index(ty), function));
        }
        let tick_index = first_script + (program.scripts.len() + program.procedures.len()) as u32;
        let entry_type = types.index(FuncType::new(&[], &[]));
        for body in entry_bodies(program.scripts.len(), first_script, &layout) {
            functions.push((entry_type, body));
        }

        let mut function_section = FunctionSection::new();
        let mut code_section = CodeSection::new();
        for (ty, body) in functions.iter() {
            function_section.function(*ty);
            code_section.function(&body.encode());
        }

        let mut memory_section = MemorySection::new();
        memory_section.memory(MemoryType { minimum: layout.pages() as u64, maximum: None, memory64: false, shared: false, page_size_log2: None });

        let mut global_section = GlobalSection::new();
        for (ty, init) in globals.iter() {
            global_section.global(*ty, init);
        }

        let mut exports = ExportSection::new();
        exports
            .export("memory", ExportKind::Memory, 0)
            .export("tick", ExportKind::Func, tick_index)
            .export("flag_clicked", ExportKind::Func, tick_index + 1)
            .export("stop_all", ExportKind::Func, Helper::StopAll.index())
            .export("active_threads", ExportKind::Global, GLOBAL_ACTIVE_THREADS)
            .export("redraw_requested", ExportKind::Global, GLOBAL_REDRAW_REQUESTED)
            .export("strings_offset", ExportKind::Global, GLOBAL_STRINGS_OFFSET)
            .export("targets_offset", ExportKind::Global, GLOBAL_TARGETS_OFFSET)
            .export("threads_offset", ExportKind::Global, GLOBAL_THREADS_OFFSET);
        for (name, index) in var_exports.iter() {
            exports.export(name, ExportKind::Global, *index);
        }

        let mut data_section = DataSection::new();
        data_section.active(0, &ConstExpr::i32_const(VARS_OFFSET as i32), data);

        let target_names = project.targets.iter().map(|x| CompactString::from(x.name.as_str())).collect::<Vec<_>>();
        let threads = program.scripts.iter().map(|x| x.target).collect::<Vec<_>>();
        let lists = compiler::declared_lists(project).into_iter().map(|(_, list)| ListRecord {
            id: list.id.as_str().into(),
            name: list.name.as_str().into(),
            items: list.value.iter().map(Value::from).collect(),
        }).collect::<Vec<_>>();

        let mut module = Module::new();
        module
            .section(&types.section())
            .section(&imports)
            .section(&function_section)
            .section(&memory_section)
            .section(&global_section)
            .section(&exports)
            .section(&code_section)
            .section(&data_section);
        for (name, payload) in [
            (custom_sections::STRINGS, encode_strings(&strings)),
            (custom_sections::TARGETS, encode_strings(&target_names)),
            (custom_sections::THREADS, encode_indices(&threads)),
            (custom_sections::LISTS, encode_lists(&lists)),
            (custom_sections::FINGERPRINT, crate::meta::FINGERPRINT.to_vec()),
        ] {
            module.section(&CustomSection { name: Cow::Borrowed(name), data: Cow::Borrowed(payload.as_slice()) });
        }
        let wasm = module.finish();
        tracing::info!(bytes = wasm.len(), functions = functions.len(), threads = threads.len(), lists = lists.len(), "assembled module");

        Ok(Self { wasm, target_names, strings, threads, lists })
    }
    /// Recovers a compiled project from the bytes of a module emitted by [`CompiledProject::compile`].
    pub fn from_wasm(wasm: Vec<u8>) -> Result<Self, InstantiationError> {
        let (mut strings, mut target_names, mut threads, mut lists) = (None, None, None, None);
        for payload in Parser::new(0).parse_all(&wasm) {
            let Payload::CustomSection(section) = payload? else { continue };
            let reader = BinaryReader::new(section.data(), section.data_offset());
            match section.name() {
                custom_sections::STRINGS => strings = Some(read_strings(reader)?),
                custom_sections::TARGETS => target_names = Some(read_strings(reader)?),
                custom_sections::THREADS => threads = Some(read_indices(reader)?),
                custom_sections::LISTS => lists = Some(read_lists(reader)?),
                custom_sections::FINGERPRINT => if section.data() != crate::meta::FINGERPRINT {
                    tracing::warn!("module was built by a different compiler version");
                }
                _ => (),
            }
        }

        let strings = strings.ok_or(InstantiationError::MissingSection { name: custom_sections::STRINGS })?;
        let target_names = target_names.ok_or(InstantiationError::MissingSection { name: custom_sections::TARGETS })?;
        let threads = threads.ok_or(InstantiationError::MissingSection { name: custom_sections::THREADS })?;
        let lists = lists.ok_or(InstantiationError::MissingSection { name: custom_sections::LISTS })?;
        Ok(Self { wasm, target_names, strings, threads, lists })
    }
    /// Checks the module with the engine's validator.
    pub fn validate(&self) -> Result<(), ModuleValidationError> {
        let engine = wasmtime::Engine::default();
        wasmtime::Module::validate(&engine, &self.wasm).map_err(|e| ModuleValidationError { diagnostic: format!("{e:?}") })
    }
    /// Writes a table of the module's sections followed by a hex dump of each section.
    pub fn dump(&self, f: &mut dyn Write) -> io::Result<()> {
        // (start, end, contents length, label), where start is the section id byte
        let mut sections = vec![];
        let mut pos = 8;
        for payload in Parser::new(0).parse_all(&self.wasm) {
            let payload = payload.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let Some((id, range)) = payload.as_section() else { continue };
            let label = match (&payload, SectionId::from_u8(id)) {
                (Payload::CustomSection(x), _) => format!("Custom {:?}", x.name()),
                (_, Some(id)) => format!("{id:?}"),
                (_, None) => format!("Unknown({id})"),
            };
            sections.push((pos, range.end, range.len(), label));
            pos = range.end;
        }

        writeln!(f, "{} bytes, {} sections", self.wasm.len(), sections.len())?;
        for (start, _, len, label) in sections.iter() {
            writeln!(f, "{start:08}   {label:<40} {len} bytes")?;
        }
        writeln!(f)?;

        let regions = std::iter::once((0, 8, "header")).chain(sections.iter().map(|x| (x.0, x.1, x.3.as_str())));
        for (start, end, label) in regions {
            for (i, bytes) in self.wasm[start..end].chunks(BYTES_PER_LINE).enumerate() {
                if i == 0 {
                    write!(f, "{start:08}   ")?;
                } else {
                    write!(f, "           ")?;
                }

                for &b in bytes {
                    write!(f, " {b:02x}")?;
                }
                for _ in bytes.len()..BYTES_PER_LINE {
                    write!(f, "   ")?;
                }

                if i == 0 {
                    write!(f, "    {label}")?;
                }
                writeln!(f)?;
            }
        }
        Ok(())
    }
}

#[test]
fn test_target_record() {
    let target: ast::Target = serde_json::from_value(serde_json::json!({
        "name": "Sprite1", "x": 10.5, "y": -3, "direction": 45, "visible": false,
        "costumes": [{ "name": "a" }, { "name": "b" }], "current_costume": 7,
    })).unwrap();
    let record = TargetRecord::new(&target);
    assert_eq!(record.costume, 1);
    assert_eq!((record.size, record.pen_size), (100.0, 1.0));

    let mut bytes = vec![0xff];
    record.encode(&mut bytes);
    assert_eq!(bytes.len(), 1 + TARGET_RECORD_SIZE as usize);
    assert_eq!(&bytes[1..9], &10.5f64.to_le_bytes());
    assert_eq!(bytes[1 + target_field::VISIBLE as usize], 0);
    assert_eq!(TargetRecord::decode(&bytes[1..]), Some(record));
    assert_eq!(TargetRecord::decode(&bytes[1..40]), None);
}

#[test]
fn test_import_table() {
    assert_eq!(HostImport::ALL.len(), 47);
    assert_eq!(HostImport::DebugLog.index(), 0);
    assert_eq!(HostImport::RuntimeClock.index(), 38);
    assert_eq!(HostImport::ListContents.index(), 46);
    assert_eq!((HostImport::MathLog10.module(), HostImport::MathLog10.name()), ("math", "log10"));
    assert_eq!((HostImport::ListItem.module(), HostImport::ListItem.name()), ("data", "list_item"));
    assert_eq!(HostImport::OperatorCompare.ty(), FuncType::new(&[ValType::I32, ValType::I64, ValType::I32, ValType::I64], &[ValType::I32]));
    assert_eq!(HostImport::ListItem.ty(), FuncType::new(&[ValType::I32, ValType::I32, ValType::I64], &[ValType::I32, ValType::I64]));
    assert_eq!(Helper::BoxFloat.index(), 47);
    assert_eq!(stop_others_index(0), 47 + Helper::ALL.len() as u32);
    for (i, &helper) in Helper::ALL.iter().enumerate() {
        assert_eq!(helper as usize, i);
    }
}

#[test]
fn test_metadata_payloads() {
    let encoded = encode_strings(&["false", "true", "héllo"]);
    assert_eq!(read_strings(BinaryReader::new(&encoded, 0)).unwrap(), ["false", "true", "héllo"]);
    match read_strings(BinaryReader::new(&encoded[..encoded.len() - 1], 100)) {
        Err(InstantiationError::BadModule { error }) => assert!(error.offset() >= 100),
        x => panic!("{x:?}"),
    }
    assert_eq!(read_indices(BinaryReader::new(&encode_indices(&[0, 1, 1]), 0)).unwrap(), [0, 1, 1]);
    assert!(read_indices(BinaryReader::new(&[3, 0], 0)).is_err());
}

#[test]
fn test_list_payloads() {
    let lists = vec![
        ListRecord { id: "a".into(), name: "things".into(), items: vec![
            Value::Number(3.0), Value::Number(-0.0), Value::Number(0.25), Value::Number(1e300),
            Value::String("x y".into()), Value::Bool(true), Value::Number(f64::NEG_INFINITY),
        ] },
        ListRecord { id: "b".into(), name: "empty".into(), items: vec![] },
    ];
    let encoded = encode_lists(&lists);
    let decoded = read_lists(BinaryReader::new(&encoded, 0)).unwrap();
    assert_eq!(decoded, lists);
    assert!(matches!(decoded[0].items[1], Value::Number(x) if x.is_sign_negative()));

    let small = ListRecord { id: "".into(), name: "".into(), items: vec![Value::Number(-1.0)] };
    assert_eq!(encode_lists(&[small]), [0x01, 0x00, 0x00, 0x01, ItemKind::Whole as u8, 0x7f]);

    match read_lists(BinaryReader::new(&[0x01, 0x00, 0x00, 0x01, 0x09], 20)) {
        Err(InstantiationError::BadMetadata { section, pos }) => assert_eq!((section, pos), (custom_sections::LISTS, 24)),
        x => panic!("{x:?}"),
    }
}
