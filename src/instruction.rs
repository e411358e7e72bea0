//! Function bodies built from `wasm_encoder` instructions, plus the shorthands the code generators share.

pub use wasm_encoder::{BlockType, Instruction, MemArg, ValType};

/// Memory access arguments.
///
/// All emitted accesses use an absolute address folded into the offset with a base of zero on the stack,
/// which is how compile-time memory layout offsets end up baked into the code.
pub mod mem {
    use wasm_encoder::MemArg;

    fn arg(align: u32, offset: u32) -> MemArg {
        MemArg { offset: offset as u64, align, memory_index: 0 }
    }
    pub fn i8(offset: u32) -> MemArg { arg(0, offset) }
    pub fn i32(offset: u32) -> MemArg { arg(2, offset) }
    pub fn f32(offset: u32) -> MemArg { arg(2, offset) }
    pub fn i64(offset: u32) -> MemArg { arg(3, offset) }
    pub fn f64(offset: u32) -> MemArg { arg(3, offset) }
}

/// How much an instruction changes the structured control nesting depth.
pub fn nesting(ins: &Instruction) -> i32 {
    match ins {
        Instruction::Block(_) | Instruction::Loop(_) | Instruction::If(_) => 1,
        Instruction::End => -1,
        _ => 0,
    }
}

/// The locals and instructions of a function, minus the closing `end`.
#[derive(Clone, Debug)]
pub struct FunctionBody {
    /// Types of the locals declared after the parameters.
    pub locals: Vec<ValType>,
    pub body: Vec<Instruction<'static>>,
}
impl FunctionBody {
    pub fn new(locals: Vec<ValType>, body: Vec<Instruction<'static>>) -> Self {
        Self { locals, body }
    }
    pub fn encode(&self) -> wasm_encoder::Function {
        let mut res = wasm_encoder::Function::new_with_locals_types(self.locals.iter().copied());
        for ins in self.body.iter() {
            res.instruction(ins);
        }
        res.instruction(&Instruction::End);
        res
    }
}

#[test]
fn test_function_body() {
    let body = FunctionBody::new(vec![ValType::I32], vec![
        Instruction::LocalGet(0),
        Instruction::If(BlockType::Result(ValType::I32)),
            Instruction::I32Const(624485),
        Instruction::Else,
            Instruction::I32Const(-1),
        Instruction::End,
    ]);
    assert_eq!(body.body.iter().map(nesting).sum::<i32>(), 0);
    let arg = mem::f64(40);
    assert_eq!((arg.offset, arg.align, arg.memory_index), (40, 3, 0));

    let mut sink = vec![];
    wasm_encoder::Encode::encode(&body.encode(), &mut sink);
    assert_eq!(sink, [
        0x10, // body size
        0x01, 0x01, 0x7f, // one i32 local
        0x20, 0x00,
        0x04, 0x7f,
        0x41, 0xe5, 0x8e, 0x26,
        0x05,
        0x41, 0x7f,
        0x0b,
        0x0b,
    ]);
}
