//! Module section bookkeeping shared by the assembler and the dump listing.
//!
//! Section encoding itself is done by `wasm_encoder`; this only tracks what the assembler has to
//! deduplicate before handing sections over.

use wasm_encoder::{TypeSection, ValType};

/// Numeric ids of the module sections, in the order the binary format fixes for them (custom sections aside).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u8)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
    DataCount = 12,
}

/// A function signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}
impl FuncType {
    pub fn new(params: &[ValType], results: &[ValType]) -> Self {
        Self { params: params.to_vec(), results: results.to_vec() }
    }
}

/// The distinct signatures of a module, in first-use order.
#[derive(Default)]
pub struct TypeTable {
    types: Vec<FuncType>,
}
impl TypeTable {
    /// Gets the type index of `ty`, adding it if this is its first use.
    pub fn index(&mut self, ty: FuncType) -> u32 {
        match self.types.iter().position(|x| *x == ty) {
            Some(i) => i as u32,
            None => {
                self.types.push(ty);
                (self.types.len() - 1) as u32
            }
        }
    }
    pub fn len(&self) -> usize {
        self.types.len()
    }
    pub fn section(&self) -> TypeSection {
        let mut res = TypeSection::new();
        for ty in self.types.iter() {
            res.function(ty.params.iter().copied(), ty.results.iter().copied());
        }
        res
    }
}

#[test]
fn test_type_table() {
    let mut table = TypeTable::default();
    assert_eq!(table.index(FuncType::new(&[ValType::I32, ValType::F64], &[ValType::I32])), 0);
    assert_eq!(table.index(FuncType::new(&[], &[])), 1);
    assert_eq!(table.index(FuncType::new(&[ValType::I32, ValType::F64], &[ValType::I32])), 0);
    assert_eq!(table.len(), 2);

    let mut sink = vec![];
    wasm_encoder::Encode::encode(&table.section(), &mut sink);
    assert_eq!(sink, [0x0a, 0x02, 0x60, 0x02, 0x7f, 0x7c, 0x01, 0x7f, 0x60, 0x00, 0x00]);

    use num_traits::FromPrimitive;
    assert_eq!(SectionId::from_u8(10), Some(SectionId::Code));
    assert_eq!(SectionId::from_u8(13), None);
}
