//! Static value representations chosen by the compiler and their runtime encodings.

use wasm_encoder::ValType;

/// What is statically known about a number.
///
/// The variants form a chain: `Whole ⊑ NotNan ⊑ Any`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NumberKind {
    /// A finite integral value.
    Whole,
    /// Possibly fractional or infinite, but never NaN.
    NotNan,
    /// No guarantees.
    Any,
}
impl NumberKind {
    pub fn join(self, other: Self) -> Self {
        self.max(other)
    }
    pub fn of(value: f64) -> Self {
        if value.is_nan() { NumberKind::Any }
        else if value.is_finite() && value.fract() == 0.0 { NumberKind::Whole }
        else { NumberKind::NotNan }
    }
    /// Kind of the result of adding, subtracting, or multiplying two numbers of the given kinds.
    /// Finite operands never produce NaN, but anything involving an infinity might.
    pub fn arithmetic(self, other: Self) -> Self {
        match (self, other) {
            (NumberKind::Whole, NumberKind::Whole) => NumberKind::NotNan,
            _ => NumberKind::Any,
        }
    }
}

/// The static representation of a compiled expression or variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Repr {
    /// An `i32` holding 0 or 1.
    Boolean,
    /// An `f64`.
    Number(NumberKind),
    /// An `i32` string table index.
    String,
    /// An `(i32 tag, i64 payload)` pair; see [`ValueTag`].
    Dynamic,
}
impl Repr {
    pub const ANY_NUMBER: Repr = Repr::Number(NumberKind::Any);

    /// The least representation able to hold values of both `self` and `other`.
    /// Numbers unify with numbers, anything else that disagrees falls back to [`Repr::Dynamic`].
    pub fn join(self, other: Self) -> Self {
        match (self, other) {
            (Repr::Number(a), Repr::Number(b)) => Repr::Number(a.join(b)),
            (a, b) if a == b => a,
            _ => Repr::Dynamic,
        }
    }
    /// Like [`Repr::join`], but treating [`None`] as "no information yet".
    pub fn join_opt(a: Option<Self>, b: Self) -> Self {
        match a {
            Some(a) => a.join(b),
            None => b,
        }
    }
    /// The value types this representation occupies on the stack, bottom first.
    pub fn val_types(self) -> &'static [ValType] {
        match self {
            Repr::Boolean | Repr::String => &[ValType::I32],
            Repr::Number(_) => &[ValType::F64],
            Repr::Dynamic => &[ValType::I32, ValType::I64],
        }
    }
}

/// Runtime type discriminant of a dynamic value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ValueTag {
    /// Payload is the bit pattern of an `f64`.
    Number = 0,
    /// Payload is 0 or 1.
    Boolean = 1,
    /// Payload is a string table index.
    String = 2,
}

/// Memory layout of a dynamic value slot: the tag, padding, then the payload.
pub mod dynamic_slot {
    pub const TAG: u32 = 0;
    pub const PAYLOAD: u32 = 8;
    pub const SIZE: u32 = 16;
}

/// String table indices reserved for the boolean names, which makes every boolean its own string index.
pub const FALSE_STRING: u32 = 0;
pub const TRUE_STRING: u32 = 1;

#[test]
fn test_repr_join() {
    let whole = Repr::Number(NumberKind::Whole);
    let not_nan = Repr::Number(NumberKind::NotNan);

    assert_eq!(whole.join(whole), whole);
    assert_eq!(whole.join(not_nan), not_nan);
    assert_eq!(not_nan.join(Repr::ANY_NUMBER), Repr::ANY_NUMBER);
    assert_eq!(Repr::String.join(Repr::String), Repr::String);
    assert_eq!(Repr::Boolean.join(Repr::Boolean), Repr::Boolean);
    assert_eq!(whole.join(Repr::String), Repr::Dynamic);
    assert_eq!(Repr::Boolean.join(Repr::String), Repr::Dynamic);
    assert_eq!(Repr::Boolean.join(whole), Repr::Dynamic);
    assert_eq!(Repr::Dynamic.join(Repr::Boolean), Repr::Dynamic);
    assert_eq!(Repr::String.join(Repr::Dynamic), Repr::Dynamic);
    assert_eq!(Repr::join_opt(None, Repr::String), Repr::String);
    assert_eq!(Repr::join_opt(Some(Repr::Boolean), Repr::String), Repr::Dynamic);

    for a in [whole, not_nan, Repr::String, Repr::Boolean, Repr::Dynamic] {
        for b in [whole, not_nan, Repr::String, Repr::Boolean, Repr::Dynamic] {
            assert_eq!(a.join(b), b.join(a));
            assert_eq!(a.join(a.join(b)), a.join(b));
        }
    }
}

#[test]
fn test_number_kind() {
    assert_eq!(NumberKind::of(3.0), NumberKind::Whole);
    assert_eq!(NumberKind::of(-0.0), NumberKind::Whole);
    assert_eq!(NumberKind::of(0.5), NumberKind::NotNan);
    assert_eq!(NumberKind::of(f64::INFINITY), NumberKind::NotNan);
    assert_eq!(NumberKind::of(f64::NAN), NumberKind::Any);
    assert_eq!(NumberKind::Whole.arithmetic(NumberKind::Whole), NumberKind::NotNan);
    assert_eq!(NumberKind::Whole.arithmetic(NumberKind::NotNan), NumberKind::Any);
    assert_eq!(Repr::Dynamic.val_types(), &[ValType::I32, ValType::I64]);
}
