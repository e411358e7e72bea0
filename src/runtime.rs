//! Runtime values, the reference casting and comparison semantics, and the types shared between the host and the scheduler.

use std::cmp::Ordering;
use std::time::Duration;

use compact_str::{CompactString, format_compact};
use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::ast;
use crate::types::ValueTag;
use crate::util;

/// A runtime value as seen by the host.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
    String(CompactString),
}
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Number(v) } }
impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.into()) } }
impl From<CompactString> for Value { fn from(v: CompactString) -> Self { Value::String(v) } }
impl From<&ast::Literal> for Value {
    fn from(v: &ast::Literal) -> Self {
        match v {
            ast::Literal::Bool(x) => Value::Bool(*x),
            ast::Literal::Number(x) => Value::Number(*x),
            ast::Literal::String(x) => Value::String(x.as_str().into()),
        }
    }
}

impl Value {
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Number(_) => ValueTag::Number,
            Value::Bool(_) => ValueTag::Boolean,
            Value::String(_) => ValueTag::String,
        }
    }
    /// Equivalent to JavaScript's `Number(value)`, so unparsable strings give NaN.
    pub fn as_number_or_nan(&self) -> f64 {
        match self {
            Value::Number(x) => *x,
            Value::Bool(x) => *x as u8 as f64,
            Value::String(x) => parse_number(x),
        }
    }
    /// Converts to a number, mapping anything that is not a number (NaN included) to zero.
    pub fn to_number(&self) -> f64 {
        let res = self.as_number_or_nan();
        if res.is_nan() { 0.0 } else { res }
    }
    pub fn to_bool(&self) -> bool {
        match self {
            Value::Bool(x) => *x,
            Value::Number(x) => *x != 0.0 && !x.is_nan(),
            Value::String(x) => !(x.is_empty() || x == "0" || x.eq_ignore_ascii_case("false")),
        }
    }
    pub fn to_compact_string(&self) -> CompactString {
        match self {
            Value::String(x) => x.clone(),
            Value::Bool(x) => CompactString::const_new(if *x { "true" } else { "false" }),
            Value::Number(x) => stringify_number(*x),
        }
    }
    fn is_whitespace_string(&self) -> bool {
        match self {
            Value::String(x) => x.chars().all(is_js_whitespace),
            _ => false,
        }
    }
}

/// Whitespace as trimmed by JavaScript's string-to-number conversion.
fn is_js_whitespace(c: char) -> bool {
    (c.is_whitespace() && c != '\u{85}') || c == '\u{feff}'
}

fn parse_radix(digits: &str, radix: u32) -> f64 {
    if digits.is_empty() { return f64::NAN }
    let mut res = 0.0;
    for c in digits.chars() {
        match c.to_digit(radix) {
            Some(d) => res = res * radix as f64 + d as f64,
            None => return f64::NAN,
        }
    }
    res
}
fn is_decimal_literal(s: &str) -> bool {
    let s = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (mantissa, exponent) = match s.find(['e', 'E']) {
        Some(p) => (&s[..p], Some(&s[p + 1..])),
        None => (s, None),
    };
    let (int, frac) = match mantissa.find('.') {
        Some(p) => (&mantissa[..p], &mantissa[p + 1..]),
        None => (mantissa, ""),
    };
    let digits = |x: &str| x.bytes().all(|b| b.is_ascii_digit());
    if !digits(int) || !digits(frac) || (int.is_empty() && frac.is_empty()) { return false }
    match exponent {
        None => true,
        Some(e) => {
            let e = e.strip_prefix(['+', '-']).unwrap_or(e);
            !e.is_empty() && digits(e)
        }
    }
}

/// Parses a string into a number just as the runtime does natively, which is JavaScript's `Number(string)`.
///
/// Surrounding whitespace is ignored, the empty string is zero, and anything unparsable is NaN.
pub fn parse_number(s: &str) -> f64 {
    let s = s.trim_matches(is_js_whitespace);
    if s.is_empty() { return 0.0 }
    match s {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => (),
    }
    match s.get(..2) {
        Some("0x" | "0X") => parse_radix(&s[2..], 16),
        Some("0o" | "0O") => parse_radix(&s[2..], 8),
        Some("0b" | "0B") => parse_radix(&s[2..], 2),
        _ if is_decimal_literal(s) => s.parse::<f64>().unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

/// Stringifies a number just as the runtime does natively, which is JavaScript's `Number.prototype.toString()`.
pub fn stringify_number(v: f64) -> CompactString {
    if v.is_nan() { return CompactString::const_new("NaN") }
    if v.is_infinite() { return CompactString::const_new(if v > 0.0 { "Infinity" } else { "-Infinity" }) }
    if v == 0.0 { return CompactString::const_new("0") }

    let mut buf = ryu::Buffer::new();
    let raw = buf.format_finite(v.abs());
    let (mantissa, exp) = match raw.find('e') {
        Some(p) => (&raw[..p], raw[p + 1..].parse::<i32>().unwrap_or(0)),
        None => (raw, 0),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));

    // value is 0.digits * 10^n
    let mut digits = CompactString::with_capacity(int.len() + frac.len());
    digits.push_str(int);
    digits.push_str(frac);
    let mut n = int.len() as i32 + exp;
    let leading = digits.len() - digits.trim_start_matches('0').len();
    n -= leading as i32;
    let digits = digits.trim_start_matches('0').trim_end_matches('0');
    let k = digits.len() as i32;

    let mut res = CompactString::with_capacity(digits.len() + 8);
    if v < 0.0 { res.push('-') }
    if k <= n && n <= 21 {
        res.push_str(digits);
        res.extend(std::iter::repeat('0').take((n - k) as usize));
    } else if 0 < n && n <= 21 {
        res.push_str(&digits[..n as usize]);
        res.push('.');
        res.push_str(&digits[n as usize..]);
    } else if -6 < n && n <= 0 {
        res.push_str("0.");
        res.extend(std::iter::repeat('0').take((-n) as usize));
        res.push_str(digits);
    } else {
        let e = n - 1;
        res.push_str(&digits[..1]);
        if k > 1 {
            res.push('.');
            res.push_str(&digits[1..]);
        }
        res.push_str(&format_compact!("e{}{}", if e < 0 { '-' } else { '+' }, e.abs()));
    }
    res
}

fn compare_strings(a: &str, b: &str) -> Ordering {
    a.to_lowercase().encode_utf16().cmp(b.to_lowercase().encode_utf16())
}

/// Compares two values with the reference cast-and-compare rules.
///
/// Both sides are compared as numbers if both convert to one (whitespace-only strings do not count as zero),
/// otherwise their string forms are compared case-insensitively.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    let (mut n1, mut n2) = (a.as_number_or_nan(), b.as_number_or_nan());
    if n1 == 0.0 && a.is_whitespace_string() {
        n1 = f64::NAN;
    } else if n2 == 0.0 && b.is_whitespace_string() {
        n2 = f64::NAN;
    }

    if n1.is_nan() || n2.is_nan() {
        return compare_strings(&a.to_compact_string(), &b.to_compact_string());
    }
    if n1.is_infinite() && n1 == n2 { return Ordering::Equal }
    n1.partial_cmp(&n2).unwrap_or(Ordering::Equal)
}

fn utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

/// The character at 1-based `index` (in UTF-16 units), or the empty string if out of range.
pub fn letter_of(index: f64, s: &str) -> CompactString {
    let units = utf16(s);
    let index = index - 1.0;
    if !(index >= 0.0 && index < units.len() as f64) { return CompactString::default() }
    CompactString::from_utf16_lossy(&units[index as usize..index as usize + 1])
}
pub fn length_of(s: &str) -> f64 {
    s.encode_utf16().count() as f64
}
pub fn contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// The most items a list can hold; adding or inserting beyond this does nothing.
pub const LIST_ITEM_LIMIT: usize = 200_000;

/// Where a list index input points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListIndex {
    /// A 0-based position.
    Item(usize),
    /// Every item.
    All,
    Invalid,
}

/// Resolves a 1-based list index against a list of `len` items.
///
/// The words `last`, `random`, and `any` are recognized, and `all` as well if `accept_all` is set.
/// Anything else is cast to a number and floored.
pub fn list_index<R: Rng>(index: &Value, len: usize, accept_all: bool, rng: &mut R) -> ListIndex {
    if let Value::String(word) = index {
        match word.as_str() {
            "all" if accept_all => return ListIndex::All,
            "last" if len > 0 => return ListIndex::Item(len - 1),
            "random" | "any" if len > 0 => return ListIndex::Item(rng.gen_range(0..len)),
            "last" | "random" | "any" => return ListIndex::Invalid,
            _ => (),
        }
    }
    let n = libm::floor(index.to_number());
    if n >= 1.0 && n <= len as f64 { ListIndex::Item(n as usize - 1) } else { ListIndex::Invalid }
}

/// The text of a whole list.
/// Items are joined directly if every one of them is a single character string, and with spaces otherwise.
pub fn list_contents(items: &[Value]) -> CompactString {
    let single = items.iter().all(|x| matches!(x, Value::String(s) if s.encode_utf16().count() == 1));
    let mut res = CompactString::default();
    for (i, item) in items.iter().enumerate() {
        if i > 0 && !single { res.push(' ') }
        res.push_str(&item.to_compact_string());
    }
    res
}

/// Rounds half-way cases towards positive infinity.
pub fn round(x: f64) -> f64 {
    let f = libm::floor(x);
    if x - f >= 0.5 { f + 1.0 } else { f }
}
fn round_10(x: f64) -> f64 {
    round(x * 1e10) / 1e10
}

/// The unary math operators available through the `mathop` reporter that are evaluated by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MathFn {
    Sin, Cos, Tan, Asin, Acos, Atan, Ln, Log10, Exp, Pow10,
}
impl MathFn {
    /// Evaluates the function, with angles in degrees.
    pub fn eval(self, n: f64) -> f64 {
        let to_rad = |deg: f64| std::f64::consts::PI * deg / 180.0;
        let to_deg = |rad: f64| rad * 180.0 / std::f64::consts::PI;
        match self {
            MathFn::Sin => round_10(libm::sin(to_rad(n))),
            MathFn::Cos => round_10(libm::cos(to_rad(n))),
            MathFn::Tan => tan(n),
            MathFn::Asin => to_deg(libm::asin(n)),
            MathFn::Acos => to_deg(libm::acos(n)),
            MathFn::Atan => to_deg(libm::atan(n)),
            MathFn::Ln => libm::log(n),
            MathFn::Log10 => libm::log(n) / std::f64::consts::LN_10,
            MathFn::Exp => libm::exp(n),
            MathFn::Pow10 => libm::pow(10.0, n),
        }
    }
}

/// Tangent in degrees, exact at the asymptotes.
pub fn tan(angle: f64) -> f64 {
    let angle = angle % 360.0;
    if angle == 90.0 || angle == 270.0 { return f64::INFINITY }
    if angle == -90.0 || angle == -270.0 { return f64::NEG_INFINITY }
    round_10(libm::tan(std::f64::consts::PI * angle / 180.0))
}

/// The remainder of `n / m` with the sign of `m`.
pub fn modulo(n: f64, m: f64) -> f64 {
    util::modulus(n, m)
}

/// A 32-bit RGBA color with color space conversion utils.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Color { pub r: u8, pub g: u8, pub b: u8, pub a: u8 }
impl Color {
    pub fn from_hsva(mut h: f32, mut s: f32, mut v: f32, mut a: f32) -> Self {
        h = util::modulus(h, 360.0);
        s = s.clamp(0.0, 1.0);
        v = v.clamp(0.0, 1.0);
        a = a.clamp(0.0, 1.0);

        let c = v * s;
        let hp = h / 60.0;
        let x = c * (1.0 - libm::fabsf(hp % 2.0 - 1.0));
        let m = v - c;

        let (r, g, b) = match hp as usize {
            0 | 6 => (c, x, 0.0),
            1 => (x, c, 0.0),
            2 => (0.0, c, x),
            3 => (0.0, x, c),
            4 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };

        fn f(x: f32) -> u8 { libm::roundf(x * 255.0) as u8 }

        Self { r: f(r + m), g: f(g + m), b: f(b + m), a: f(a) }
    }
    /// Converts the pen's color parameters, each on a 0-100 scale, to a color.
    pub fn from_pen(color: f32, saturation: f32, brightness: f32, transparency: f32) -> Self {
        Self::from_hsva(color * 3.6, saturation / 100.0, brightness / 100.0, 1.0 - transparency / 100.0)
    }
    /// Parses a `#rrggbb` string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix('#')?;
        if s.len() != 6 { return None }
        let v = u32::from_str_radix(s, 16).ok()?;
        Some(Self { r: (v >> 16) as u8, g: (v >> 8) as u8, b: v as u8, a: 0xff })
    }
    pub fn to_hsva(self) -> (f32, f32, f32, f32) {
        fn f(x: u8) -> f32 { x as f32 / 255.0 }

        let vals = [self.r, self.g, self.b];
        let (c_max_i, c_max) = vals.iter().copied().enumerate().max_by_key(|x| x.1).map(|(i, v)| (i, f(v))).unwrap_or((0, 0.0));
        let c_min = vals.iter().copied().min().map(f).unwrap_or(0.0);
        let delta = c_max - c_min;

        let h = if delta == 0.0 { 0.0 } else {
            match c_max_i {
                0 => 60.0 * util::modulus((f(self.g) - f(self.b)) / delta, 6.0),
                1 => 60.0 * ((f(self.b) - f(self.r)) / delta + 2.0),
                _ => 60.0 * ((f(self.r) - f(self.g)) / delta + 4.0),
            }
        };
        let s = if c_max == 0.0 { 0.0 } else { delta / c_max };
        let v = c_max;
        let a = f(self.a);

        (h, s, v, a)
    }
}

/// The pen color parameters, in the order of their indices in compiled code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum PenParam {
    Color = 0,
    Saturation = 1,
    Brightness = 2,
    Transparency = 3,
}
impl PenParam {
    pub fn from_menu(name: &str) -> Option<Self> {
        Some(match name {
            "color" => PenParam::Color,
            "saturation" => PenParam::Saturation,
            "brightness" => PenParam::Brightness,
            "transparency" => PenParam::Transparency,
            _ => return None,
        })
    }
    /// Brings a parameter value back into range: color wraps around, everything else is clamped.
    pub fn normalize(self, value: f64) -> f64 {
        match self {
            PenParam::Color => util::modulus(value, 100.0),
            _ => value.clamp(0.0, 100.0),
        }
    }
}

/// The style of a speech bubble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BubbleKind {
    Say,
    Think,
}

/// A drawing command for the pen layer.
#[derive(Clone, Debug, PartialEq)]
pub enum PenCommand {
    Clear,
    Down { target: usize },
    Up { target: usize },
    Point { target: usize, x: f64, y: f64, size: f64, color: Color },
    Line { target: usize, from: (f64, f64), to: (f64, f64), size: f64, color: Color },
}

/// A visible change to a target, reported after it happens.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SpriteChange {
    Position { x: f64, y: f64 },
    Size { size: f64 },
    Costume { index: usize },
    Rotation { direction: f64 },
    Visibility { visible: bool },
}

/// Represents all the features of an implementing system.
///
/// This is the renderer-like collaborator a running project reports to.
/// Everything except [`System::say`] has a default no-op (or logging) implementation.
pub trait System: 'static {
    /// Shows a speech or thought bubble for the target named `target`.
    fn say(&self, target: &str, kind: BubbleKind, message: &Value);
    /// Receives values logged by projects compiled in debug mode.
    fn log(&self, value: &Value) {
        tracing::info!(?value, "log");
    }
    /// Receives values asserted by projects compiled in debug mode.
    fn assert(&self, value: &Value) {
        tracing::info!(?value, "assert");
    }
    fn pen(&self, command: PenCommand) {
        let _ = command;
    }
    fn sprite_changed(&self, target: &str, change: SpriteChange) {
        let _ = (target, change);
    }
    /// Called once at the end of every frame.
    fn draw(&self) {}
    /// Blocks until the display is ready for another frame; used when the framerate is uncapped.
    fn await_refresh(&self) {
        std::thread::sleep(Duration::from_millis(16));
    }
}

/// The frame rate of the host loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framerate {
    /// Frames per second.
    Capped(u32),
    /// Follow the display via [`System::await_refresh`].
    Uncapped,
}

/// Settings to use for a [`Project`](crate::project::Project).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// The target frame rate (default 30 fps).
    pub framerate: Framerate,
    /// Skip waiting between frames (default `false`).
    pub turbo: bool,
    /// Fraction of a frame spent running ticks before yielding to the renderer (default `0.8`).
    pub budget_ratio: f64,
    /// Total wall clock limit for [`Project::run`](crate::project::Project::run) (default none).
    pub timeout: Option<Duration>,
    /// Seed for `pick random`; a fresh seed is drawn if not given.
    pub seed: Option<u64>,
}
impl Default for Settings {
    fn default() -> Self {
        Self {
            framerate: Framerate::Capped(30),
            turbo: false,
            budget_ratio: 0.8,
            timeout: None,
            seed: None,
        }
    }
}
impl Settings {
    /// Checks the fields that have a restricted range.
    pub fn validate(&self) -> Result<(), InstantiationError> {
        if !(0.0..=1.0).contains(&self.budget_ratio) {
            return Err(InstantiationError::Settings { diagnostic: format!("budget_ratio must be between 0 and 1, got {}", self.budget_ratio) });
        }
        Ok(())
    }
    /// Time spent running ticks in one frame before drawing.
    /// The budget ratio is clamped to `[0, 1]`, with NaN counting as zero.
    pub fn frame_budget(&self) -> Duration {
        let ratio = if self.budget_ratio.is_nan() { 0.0 } else { self.budget_ratio.clamp(0.0, 1.0) };
        Duration::from_secs_f64(self.frame_time().as_secs_f64() * ratio)
    }
    /// Nominal length of one frame; uncapped framerates assume 60 fps.
    pub fn frame_time(&self) -> Duration {
        match self.framerate {
            Framerate::Capped(fps) => Duration::from_millis(libm::round(1000.0 / fps.max(1) as f64) as u64),
            Framerate::Uncapped => Duration::from_micros(16_667),
        }
    }
}

/// The assembled bytes failed validation.
#[derive(Debug)]
pub struct ModuleValidationError {
    /// The raw validator message.
    pub diagnostic: String,
}

/// A compiled module could not be loaded and linked.
#[derive(Debug)]
pub enum InstantiationError {
    Validation { error: ModuleValidationError },
    BadModule { error: wasmparser::BinaryReaderError },
    MissingSection { name: &'static str },
    /// A metadata section decoded, but held something this version cannot represent.
    BadMetadata { section: &'static str, pos: usize },
    /// A [`Settings`] field is out of range.
    Settings { diagnostic: String },
    Link { diagnostic: String },
    MissingExport { name: &'static str },
    Memory { diagnostic: String },
    /// No seed was given and none could be drawn from the system.
    Entropy { diagnostic: String },
}
impl From<ModuleValidationError> for InstantiationError { fn from(error: ModuleValidationError) -> Self { Self::Validation { error } } }
impl From<wasmparser::BinaryReaderError> for InstantiationError { fn from(error: wasmparser::BinaryReaderError) -> Self { Self::BadModule { error } } }

/// An error raised while executing compiled code.
#[derive(Debug)]
pub enum ExecError {
    Trap { diagnostic: String },
    Memory { diagnostic: String },
}

/// The reason [`Project::run`](crate::project::Project::run) stopped early.
#[derive(Debug)]
pub enum RunError {
    Timeout { elapsed: Duration },
    Exec { error: ExecError },
}
impl From<ExecError> for RunError { fn from(error: ExecError) -> Self { Self::Exec { error } } }

#[test]
fn test_parse_number() {
    assert_eq!(parse_number(""), 0.0);
    assert_eq!(parse_number("  \t\n"), 0.0);
    assert_eq!(parse_number("12"), 12.0);
    assert_eq!(parse_number("  -12.5  "), -12.5);
    assert_eq!(parse_number("+3"), 3.0);
    assert_eq!(parse_number(".23"), 0.23);
    assert_eq!(parse_number("5."), 5.0);
    assert_eq!(parse_number("1e3"), 1000.0);
    assert_eq!(parse_number("1E-2"), 0.01);
    assert_eq!(parse_number("0x1f"), 31.0);
    assert_eq!(parse_number("0B101"), 5.0);
    assert_eq!(parse_number("0o17"), 15.0);
    assert_eq!(parse_number("Infinity"), f64::INFINITY);
    assert_eq!(parse_number("-Infinity"), f64::NEG_INFINITY);
    assert_eq!(parse_number("\u{a0}7\u{feff}"), 7.0);
    for bad in ["inf", "infinity", "NaN", "nan", "banana", "true", "1e", "e5", ".", "-", "0x", "-0x10", "1.2.3", "1_000", "🎉"] {
        assert!(parse_number(bad).is_nan(), "{bad:?}");
    }
}

#[test]
fn test_number_to_string() {
    assert_eq!(stringify_number(0.0), "0");
    assert_eq!(stringify_number(-0.0), "0");
    assert_eq!(stringify_number(1.0), "1");
    assert_eq!(stringify_number(-13.0), "-13");
    assert_eq!(stringify_number(0.1), "0.1");
    assert_eq!(stringify_number(-12.5), "-12.5");
    assert_eq!(stringify_number(123456789.0), "123456789");
    assert_eq!(stringify_number(0.000001), "0.000001");
    assert_eq!(stringify_number(1.5e-7), "1.5e-7");
    assert_eq!(stringify_number(1e20), "100000000000000000000");
    assert_eq!(stringify_number(1e21), "1e+21");
    assert_eq!(stringify_number(5.67e50), "5.67e+50");
    assert_eq!(stringify_number(-8.35e30), "-8.35e+30");
    assert_eq!(stringify_number(6e-24), "6e-24");
    assert_eq!(stringify_number(0.1 + 0.2), "0.30000000000000004");
    assert_eq!(stringify_number(f64::NAN), "NaN");
    assert_eq!(stringify_number(f64::INFINITY), "Infinity");
    assert_eq!(stringify_number(f64::NEG_INFINITY), "-Infinity");
}

#[test]
fn test_casts() {
    assert_eq!(Value::from("abc").to_number(), 0.0);
    assert_eq!(Value::from(f64::NAN).to_number(), 0.0);
    assert_eq!(Value::from(true).to_number(), 1.0);
    assert_eq!(Value::from(" 4 ").to_number(), 4.0);

    assert!(!Value::from("").to_bool());
    assert!(!Value::from("0").to_bool());
    assert!(!Value::from("FaLsE").to_bool());
    assert!(Value::from("0.0").to_bool());
    assert!(Value::from("no").to_bool());
    assert!(!Value::from(0.0).to_bool());
    assert!(!Value::from(f64::NAN).to_bool());
    assert!(Value::from(-2.0).to_bool());

    assert_eq!(Value::from(true).to_compact_string(), "true");
    assert_eq!(Value::from(2.5).to_compact_string(), "2.5");
}

#[test]
fn test_compare() {
    fn cmp(a: impl Into<Value>, b: impl Into<Value>) -> Ordering { compare(&a.into(), &b.into()) }

    assert_eq!(cmp(0.0, "0"), Ordering::Equal);
    assert_eq!(cmp("true", true), Ordering::Equal);
    assert_eq!(cmp("banana", "BANANA"), Ordering::Equal);
    assert_eq!(cmp("NaN", "NaN"), Ordering::Equal);
    assert_eq!(cmp(f64::NAN, "nan"), Ordering::Equal);
    assert_eq!(cmp("10", "9"), Ordering::Greater);
    assert_eq!(cmp("10", "9a"), Ordering::Less);
    assert_eq!(cmp("", 0.0), Ordering::Less);
    assert_eq!(cmp(" ", 0.0), Ordering::Less);
    assert_eq!(cmp(0.0, ""), Ordering::Greater);
    assert_eq!(cmp("1.23", 1.23), Ordering::Equal);
    assert_eq!(cmp("-0", 0.0), Ordering::Equal);
    assert_eq!(cmp("Infinity", f64::INFINITY), Ordering::Equal);
    assert_eq!(cmp(f64::NEG_INFINITY, f64::NEG_INFINITY), Ordering::Equal);
    assert_eq!(cmp(false, 1.0), Ordering::Less);
    assert_eq!(cmp("apple", "Banana"), Ordering::Less);
}

#[test]
fn test_string_ops() {
    assert_eq!(letter_of(1.0, "hello"), "h");
    assert_eq!(letter_of(5.0, "hello"), "o");
    assert_eq!(letter_of(1.5, "hello"), "h");
    assert_eq!(letter_of(0.0, "hello"), "");
    assert_eq!(letter_of(6.0, "hello"), "");
    assert_eq!(letter_of(f64::NAN, "hello"), "");
    assert_eq!(length_of("hello"), 5.0);
    assert_eq!(length_of("🎉"), 2.0);
    assert!(contains("Hello World", "o w"));
    assert!(!contains("Hello", "x"));
    assert!(contains("abc", ""));
}

#[test]
fn test_list_index() {
    use rand::SeedableRng;
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
    let idx = |index: Value, len: usize, accept_all: bool, rng: &mut rand_chacha::ChaCha8Rng| list_index(&index, len, accept_all, rng);

    assert_eq!(idx(1.0.into(), 3, false, &mut rng), ListIndex::Item(0));
    assert_eq!(idx(3.9.into(), 3, false, &mut rng), ListIndex::Item(2));
    assert_eq!(idx(" 2 ".into(), 3, false, &mut rng), ListIndex::Item(1));
    assert_eq!(idx(0.0.into(), 3, false, &mut rng), ListIndex::Invalid);
    assert_eq!(idx(4.0.into(), 3, false, &mut rng), ListIndex::Invalid);
    assert_eq!(idx(f64::NAN.into(), 3, false, &mut rng), ListIndex::Invalid);
    assert_eq!(idx("banana".into(), 3, false, &mut rng), ListIndex::Invalid);
    assert_eq!(idx("last".into(), 3, false, &mut rng), ListIndex::Item(2));
    assert_eq!(idx("last".into(), 0, false, &mut rng), ListIndex::Invalid);
    assert_eq!(idx("all".into(), 3, true, &mut rng), ListIndex::All);
    assert_eq!(idx("all".into(), 3, false, &mut rng), ListIndex::Invalid);
    assert_eq!(idx("random".into(), 0, false, &mut rng), ListIndex::Invalid);
    for _ in 0..50 {
        match idx("any".into(), 4, false, &mut rng) {
            ListIndex::Item(i) => assert!(i < 4),
            x => panic!("{x:?}"),
        }
    }
}

#[test]
fn test_list_contents() {
    assert_eq!(list_contents(&[]), "");
    assert_eq!(list_contents(&["a".into(), "b".into(), "c".into()]), "abc");
    assert_eq!(list_contents(&["a".into(), "bc".into()]), "a bc");
    assert_eq!(list_contents(&["a".into(), 1.0.into(), true.into()]), "a 1 true");
    assert_eq!(list_contents(&[2.5.into()]), "2.5");
}

#[test]
fn test_frame_budget() {
    let settings = |budget_ratio: f64| Settings { budget_ratio, framerate: Framerate::Capped(10), ..Default::default() };
    assert_eq!(settings(0.5).frame_budget(), Duration::from_millis(50));
    assert_eq!(settings(-1.0).frame_budget(), Duration::ZERO);
    assert_eq!(settings(f64::NAN).frame_budget(), Duration::ZERO);
    assert_eq!(settings(3.0).frame_budget(), Duration::from_millis(100));

    assert!(settings(0.8).validate().is_ok());
    for bad in [-0.1, 1.5, f64::NAN, f64::INFINITY] {
        assert!(matches!(settings(bad).validate(), Err(InstantiationError::Settings { .. })), "{bad}");
    }
}

#[test]
fn test_math() {
    assert_eq!(tan(90.0), f64::INFINITY);
    assert_eq!(tan(270.0), f64::INFINITY);
    assert_eq!(tan(450.0), f64::INFINITY);
    assert_eq!(tan(-90.0), f64::NEG_INFINITY);
    assert_eq!(tan(-270.0), f64::NEG_INFINITY);
    assert_eq!(tan(45.0), 1.0);
    assert_eq!(tan(0.0), 0.0);
    assert_eq!(tan(180.0), 0.0);

    assert_eq!(MathFn::Sin.eval(30.0), 0.5);
    assert_eq!(MathFn::Sin.eval(180.0), 0.0);
    assert_eq!(MathFn::Cos.eval(90.0), 0.0);
    assert!((MathFn::Asin.eval(1.0) - 90.0).abs() < 1e-9);
    assert!((MathFn::Atan.eval(1.0) - 45.0).abs() < 1e-9);
    assert!((MathFn::Log10.eval(1000.0) - 3.0).abs() < 1e-9);
    assert_eq!(MathFn::Pow10.eval(3.0), 1000.0);
    assert!(MathFn::Asin.eval(2.0).is_nan());
    assert_eq!(MathFn::Ln.eval(0.0), f64::NEG_INFINITY);

    assert_eq!(round(2.5), 3.0);
    assert_eq!(round(-2.5), -2.0);
    assert_eq!(round(0.49999999999999994), 0.0);
    assert_eq!(modulo(-1.0, 3.0), 2.0);
    assert_eq!(modulo(5.5, -2.0), -0.5);
    assert_eq!(modulo(6.0, 3.0), 0.0);
}

#[test]
fn test_color_hsv_to_rgb() {
    assert_eq!(Color::from_hsva(0.0, 0.0, 0.0, 1.0), Color { r: 0x00, g: 0x00, b: 0x00, a: 0xFF });
    assert_eq!(Color::from_hsva(0.0, 1.0, 1.0, 1.0), Color { r: 0xFF, g: 0x00, b: 0x00, a: 0xFF });
    assert_eq!(Color::from_hsva(120.0, 1.0, 1.0, 0.0), Color { r: 0x00, g: 0xFF, b: 0x00, a: 0x00 });
    assert_eq!(Color::from_hsva(-120.0, 1.0, 1.0, 1.0), Color { r: 0x00, g: 0x00, b: 0xFF, a: 0xFF });
    assert_eq!(Color::from_pen(0.0, 100.0, 100.0, 0.0), Color { r: 0xFF, g: 0x00, b: 0x00, a: 0xFF });
    assert_eq!(Color::from_hex("#00ff80"), Some(Color { r: 0x00, g: 0xFF, b: 0x80, a: 0xFF }));
    assert_eq!(Color::from_hex("00ff80"), None);

    let (h, s, v, a) = Color { r: 0xFF, g: 0x00, b: 0x00, a: 0xFF }.to_hsva();
    assert_eq!((h, s, v, a), (0.0, 1.0, 1.0, 1.0));
    assert_eq!(PenParam::Color.normalize(130.0), 30.0);
    assert_eq!(PenParam::Color.normalize(-10.0), 90.0);
    assert_eq!(PenParam::Brightness.normalize(130.0), 100.0);
    assert_eq!(PenParam::from_menu("saturation"), Some(PenParam::Saturation));
}
