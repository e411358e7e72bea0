//! Host implementations of the functions imported by compiled modules.

use std::collections::BTreeMap;
use std::time::Instant;

use compact_str::CompactString;
use num_traits::FromPrimitive;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use wasmtime::{Caller, Linker, Memory, AsContextMut};

use crate::assembler::{HostImport, TargetRecord, TARGET_RECORD_SIZE};
use crate::runtime::*;
use crate::types::ValueTag;

/// The data owned by the store of a running project.
#[derive(Educe)]
#[educe(Debug)]
pub struct HostState<S: System> {
    #[educe(Debug(ignore))]
    pub system: S,
    memory: Option<Memory>,
    strings_offset: u32,
    targets_offset: u32,
    target_names: Vec<CompactString>,
    constant_count: u32,
    /// Strings created while running, indexed from `constant_count` on. Collected slots are [`None`].
    runtime_strings: Vec<Option<CompactString>>,
    free_strings: Vec<u32>,
    /// Strings allocated since the last collection.
    allocations: usize,
    #[educe(Debug(ignore))]
    lookup: BTreeMap<CompactString, u32>,
    #[educe(Debug(ignore))]
    lists: Vec<Vec<Value>>,
    #[educe(Debug(ignore))]
    rng: ChaCha8Rng,
    start: Instant,
    timer_start: Instant,
}
impl<S: System> HostState<S> {
    pub(crate) fn new(system: S, target_names: Vec<CompactString>, lists: Vec<Vec<Value>>, settings: &Settings) -> Result<Self, InstantiationError> {
        let seed = match settings.seed {
            Some(seed) => seed,
            None => {
                let mut buf = [0u8; 8];
                getrandom::getrandom(&mut buf).map_err(|e| InstantiationError::Entropy { diagnostic: e.to_string() })?;
                u64::from_le_bytes(buf)
            }
        };
        let now = Instant::now();
        Ok(Self {
            system,
            memory: None,
            strings_offset: 0,
            targets_offset: 0,
            target_names,
            constant_count: 0,
            runtime_strings: vec![],
            free_strings: vec![],
            allocations: 0,
            lookup: Default::default(),
            lists,
            rng: ChaCha8Rng::seed_from_u64(seed),
            start: now,
            timer_start: now,
        })
    }
    /// Seconds since the project was created.
    pub fn clock(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
    pub fn target_name(&self, target: usize) -> Option<&str> {
        self.target_names.get(target).map(CompactString::as_str)
    }
    /// Looks up a runtime string; constants are not visible here, as they live in linear memory.
    pub fn runtime_string(&self, index: u32) -> Option<&str> {
        self.runtime_strings.get(index.checked_sub(self.constant_count)? as usize)?.as_deref()
    }
    /// The number of runtime strings that have not been collected.
    pub fn live_strings(&self) -> usize {
        self.runtime_strings.len() - self.free_strings.len()
    }
    pub fn list(&self, list: usize) -> Option<&[Value]> {
        self.lists.get(list).map(Vec::as_slice)
    }
    fn alloc_string(&mut self, value: CompactString) -> i32 {
        if let Some(&index) = self.lookup.get(&value) {
            return index as i32;
        }
        let slot = match self.free_strings.pop() {
            Some(slot) => {
                self.runtime_strings[slot as usize] = Some(value.clone());
                slot
            }
            None => {
                self.runtime_strings.push(Some(value.clone()));
                self.runtime_strings.len() as u32 - 1
            }
        };
        self.allocations += 1;
        let index = self.constant_count + slot;
        self.lookup.insert(value, index);
        index as i32
    }
    /// Frees every runtime string not named by `roots`, returning how many were freed.
    ///
    /// Must only be called between ticks, when every live string index is stored somewhere the caller can see.
    /// Roots that are not runtime string indices are ignored, so callers may over-approximate.
    /// Nothing happens if no string was allocated since the last collection.
    pub(crate) fn collect_strings(&mut self, roots: impl IntoIterator<Item = u32>) -> usize {
        if self.allocations == 0 { return 0 }
        self.allocations = 0;

        let mut marked = vec![false; self.runtime_strings.len()];
        for root in roots {
            if let Some(mark) = root.checked_sub(self.constant_count).and_then(|x| marked.get_mut(x as usize)) {
                *mark = true;
            }
        }
        let mut freed = 0;
        for (slot, marked) in marked.into_iter().enumerate() {
            if marked { continue }
            if let Some(value) = self.runtime_strings[slot].take() {
                self.lookup.remove(&value);
                self.free_strings.push(slot as u32);
                freed += 1;
            }
        }
        tracing::trace!(freed, live = self.live_strings(), "collected strings");
        freed
    }
}

/// Writes the constant string table into linear memory and connects the host state to the instance.
pub(crate) fn attach<S: System>(mut store: impl AsContextMut<Data = HostState<S>>, memory: Memory, strings_offset: u32, targets_offset: u32, constants: &[CompactString]) -> Result<(), InstantiationError> {
    let mut region = Vec::with_capacity(constants.iter().map(|x| 8 + x.len()).sum());
    let mut ptr = strings_offset + 8 * constants.len() as u32;
    for s in constants {
        region.extend_from_slice(&ptr.to_le_bytes());
        region.extend_from_slice(&(s.len() as u32).to_le_bytes());
        ptr += s.len() as u32;
    }
    for s in constants {
        region.extend_from_slice(s.as_bytes());
    }
    memory.write(&mut store, strings_offset as usize, &region).map_err(|e| InstantiationError::Memory { diagnostic: e.to_string() })?;

    let mut ctx = store.as_context_mut();
    let state = ctx.data_mut();
    state.memory = Some(memory);
    state.strings_offset = strings_offset;
    state.targets_offset = targets_offset;
    state.constant_count = constants.len() as u32;
    state.lookup = constants.iter().enumerate().map(|(i, x)| (x.clone(), i as u32)).collect();
    tracing::debug!(strings = constants.len(), bytes = region.len(), "wrote string table");
    Ok(())
}

fn memory<S: System>(caller: &Caller<'_, HostState<S>>) -> wasmtime::Result<Memory> {
    caller.data().memory.ok_or_else(|| wasmtime::Error::msg("linear memory is not attached"))
}

fn read_string<S: System>(caller: &Caller<'_, HostState<S>>, index: i32) -> wasmtime::Result<CompactString> {
    let state = caller.data();
    let index = index as u32;
    if index >= state.constant_count {
        return state.runtime_string(index).map(CompactString::from).ok_or_else(|| wasmtime::Error::msg(format!("string index {index} out of bounds")));
    }

    let data = memory(caller)?.data(caller);
    let desc = state.strings_offset as usize + 8 * index as usize;
    let word = |pos: usize| data.get(pos..pos + 4).and_then(|x| x.try_into().ok()).map(u32::from_le_bytes);
    let (ptr, len) = word(desc).zip(word(desc + 4)).ok_or_else(|| wasmtime::Error::msg("string descriptor out of bounds"))?;
    let bytes = data.get(ptr as usize..ptr as usize + len as usize).ok_or_else(|| wasmtime::Error::msg("string data out of bounds"))?;
    Ok(CompactString::from_utf8(bytes)?)
}

fn alloc_string<S: System>(caller: &mut Caller<'_, HostState<S>>, value: CompactString) -> i32 {
    caller.data_mut().alloc_string(value)
}

fn read_value<S: System>(caller: &Caller<'_, HostState<S>>, tag: i32, payload: i64) -> wasmtime::Result<Value> {
    Ok(match ValueTag::from_i32(tag) {
        Some(ValueTag::Number) => Value::Number(f64::from_bits(payload as u64)),
        Some(ValueTag::Boolean) => Value::Bool(payload != 0),
        Some(ValueTag::String) => Value::String(read_string(caller, payload as i32)?),
        None => return Err(wasmtime::Error::msg(format!("unknown value tag {tag}"))),
    })
}

fn box_value<S: System>(caller: &mut Caller<'_, HostState<S>>, value: Value) -> (i32, i64) {
    match value {
        Value::Number(x) => (ValueTag::Number as i32, x.to_bits() as i64),
        Value::Bool(x) => (ValueTag::Boolean as i32, x as i64),
        Value::String(x) => (ValueTag::String as i32, alloc_string(caller, x) as u32 as i64),
    }
}

fn list_mut<'a, S: System>(caller: &'a mut Caller<'_, HostState<S>>, list: i32) -> wasmtime::Result<(&'a mut Vec<Value>, &'a mut ChaCha8Rng)> {
    let state = caller.data_mut();
    let items = state.lists.get_mut(list as u32 as usize).ok_or_else(|| wasmtime::Error::msg(format!("unknown list {list}")))?;
    Ok((items, &mut state.rng))
}

fn read_record<S: System>(caller: &Caller<'_, HostState<S>>, target: i32) -> wasmtime::Result<TargetRecord> {
    let data = memory(caller)?.data(caller);
    let start = caller.data().targets_offset as usize + target as u32 as usize * TARGET_RECORD_SIZE as usize;
    data.get(start..).and_then(TargetRecord::decode).ok_or_else(|| wasmtime::Error::msg(format!("no record for target {target}")))
}

fn target_name<S: System>(caller: &Caller<'_, HostState<S>>, target: i32) -> wasmtime::Result<CompactString> {
    caller.data().target_name(target as u32 as usize).map(CompactString::from).ok_or_else(|| wasmtime::Error::msg(format!("unknown target {target}")))
}

/// Picks a random number between two bounds (in either order).
/// If both bounds are integers the result is too; otherwise it is uniform over the interval.
/// Unbounded intervals have no uniform distribution, so a result that would be NaN is 0 instead.
pub fn pick_random<R: Rng>(rng: &mut R, a: f64, b: f64) -> f64 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    if low == high { return low }
    let res = if low.fract() == 0.0 && high.fract() == 0.0 {
        low + libm::floor(rng.gen::<f64>() * (high + 1.0 - low))
    } else {
        rng.gen::<f64>() * (high - low) + low
    };
    if res.is_nan() { 0.0 } else { res }
}

fn days_since_2000() -> f64 {
    let epoch = time::Date::from_calendar_date(2000, time::Month::January, 1)
        .map(|x| x.midnight().assume_utc())
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    (time::OffsetDateTime::now_utc() - epoch).as_seconds_f64() / 86400.0
}

fn pen_color(record: &TargetRecord) -> Color {
    let [color, saturation, brightness, transparency] = record.pen;
    Color::from_pen(color, saturation, brightness, transparency)
}

macro_rules! wrap {
    ($linker:ident, $import:ident, $f:expr) => {
        $linker.func_wrap(HostImport::$import.module(), HostImport::$import.name(), $f)?;
    };
}

/// Defines every [`HostImport`] in `linker`.
pub(crate) fn link<S: System>(linker: &mut Linker<HostState<S>>) -> wasmtime::Result<()> {
    wrap!(linker, DebugLog, |caller: Caller<'_, HostState<S>>, tag: i32, payload: i64| -> wasmtime::Result<()> {
        let value = read_value(&caller, tag, payload)?;
        caller.data().system.log(&value);
        Ok(())
    });
    wrap!(linker, DebugAssert, |caller: Caller<'_, HostState<S>>, tag: i32, payload: i64| -> wasmtime::Result<()> {
        let value = read_value(&caller, tag, payload)?;
        caller.data().system.assert(&value);
        Ok(())
    });
    for (import, kind) in [(HostImport::LooksSay, BubbleKind::Say), (HostImport::LooksThink, BubbleKind::Think)] {
        linker.func_wrap(import.module(), import.name(), move |caller: Caller<'_, HostState<S>>, target: i32, tag: i32, payload: i64| -> wasmtime::Result<()> {
            let value = read_value(&caller, tag, payload)?;
            let name = target_name(&caller, target)?;
            caller.data().system.say(&name, kind, &value);
            Ok(())
        })?;
    }

    for (import, f) in [
        (HostImport::MathSin, MathFn::Sin), (HostImport::MathCos, MathFn::Cos), (HostImport::MathTan, MathFn::Tan),
        (HostImport::MathAsin, MathFn::Asin), (HostImport::MathAcos, MathFn::Acos), (HostImport::MathAtan, MathFn::Atan),
        (HostImport::MathLn, MathFn::Ln), (HostImport::MathLog10, MathFn::Log10), (HostImport::MathExp, MathFn::Exp),
        (HostImport::MathPow10, MathFn::Pow10),
    ] {
        linker.func_wrap(import.module(), import.name(), move |x: f64| f.eval(x))?;
    }
    wrap!(linker, MathMod, |n: f64, m: f64| modulo(n, m));
    wrap!(linker, MathRandom, |mut caller: Caller<'_, HostState<S>>, a: f64, b: f64| pick_random(&mut caller.data_mut().rng, a, b));

    wrap!(linker, CastStringToFloat, |caller: Caller<'_, HostState<S>>, s: i32| -> wasmtime::Result<f64> {
        Ok(Value::String(read_string(&caller, s)?).to_number())
    });
    wrap!(linker, CastStringToBool, |caller: Caller<'_, HostState<S>>, s: i32| -> wasmtime::Result<i32> {
        Ok(Value::String(read_string(&caller, s)?).to_bool() as i32)
    });
    wrap!(linker, CastFloatToString, |mut caller: Caller<'_, HostState<S>>, x: f64| alloc_string(&mut caller, stringify_number(x)));

    wrap!(linker, OperatorCompare, |caller: Caller<'_, HostState<S>>, tag1: i32, payload1: i64, tag2: i32, payload2: i64| -> wasmtime::Result<i32> {
        let a = read_value(&caller, tag1, payload1)?;
        let b = read_value(&caller, tag2, payload2)?;
        Ok(compare(&a, &b) as i32)
    });
    wrap!(linker, OperatorJoin, |mut caller: Caller<'_, HostState<S>>, a: i32, b: i32| -> wasmtime::Result<i32> {
        let mut res = read_string(&caller, a)?;
        res.push_str(&read_string(&caller, b)?);
        Ok(alloc_string(&mut caller, res))
    });
    wrap!(linker, OperatorLetterOf, |mut caller: Caller<'_, HostState<S>>, index: f64, s: i32| -> wasmtime::Result<i32> {
        let res = letter_of(index, &read_string(&caller, s)?);
        Ok(alloc_string(&mut caller, res))
    });
    wrap!(linker, OperatorLength, |caller: Caller<'_, HostState<S>>, s: i32| -> wasmtime::Result<f64> {
        Ok(length_of(&read_string(&caller, s)?))
    });
    wrap!(linker, OperatorContains, |caller: Caller<'_, HostState<S>>, a: i32, b: i32| -> wasmtime::Result<i32> {
        Ok(contains(&read_string(&caller, a)?, &read_string(&caller, b)?) as i32)
    });

    wrap!(linker, PenClear, |caller: Caller<'_, HostState<S>>| caller.data().system.pen(PenCommand::Clear));
    wrap!(linker, PenDown, |caller: Caller<'_, HostState<S>>, target: i32| caller.data().system.pen(PenCommand::Down { target: target as u32 as usize }));
    wrap!(linker, PenUp, |caller: Caller<'_, HostState<S>>, target: i32| caller.data().system.pen(PenCommand::Up { target: target as u32 as usize }));
    wrap!(linker, PenLine, |caller: Caller<'_, HostState<S>>, target: i32, x0: f64, y0: f64, x1: f64, y1: f64| -> wasmtime::Result<()> {
        let record = read_record(&caller, target)?;
        caller.data().system.pen(PenCommand::Line { target: target as u32 as usize, from: (x0, y0), to: (x1, y1), size: record.pen_size, color: pen_color(&record) });
        Ok(())
    });
    wrap!(linker, PenPoint, |caller: Caller<'_, HostState<S>>, target: i32, x: f64, y: f64| -> wasmtime::Result<()> {
        let record = read_record(&caller, target)?;
        caller.data().system.pen(PenCommand::Point { target: target as u32 as usize, x, y, size: record.pen_size, color: pen_color(&record) });
        Ok(())
    });
    wrap!(linker, PenSetColorParam, |_target: i32, param: i32, value: f64| -> wasmtime::Result<f64> {
        let param = PenParam::from_i32(param).ok_or_else(|| wasmtime::Error::msg(format!("unknown pen color parameter {param}")))?;
        Ok(param.normalize(value))
    });

    wrap!(linker, SpritePositionChanged, |caller: Caller<'_, HostState<S>>, target: i32| -> wasmtime::Result<()> {
        let record = read_record(&caller, target)?;
        caller.data().system.sprite_changed(&target_name(&caller, target)?, SpriteChange::Position { x: record.x, y: record.y });
        Ok(())
    });
    wrap!(linker, SpriteSizeChanged, |caller: Caller<'_, HostState<S>>, target: i32| -> wasmtime::Result<()> {
        let record = read_record(&caller, target)?;
        caller.data().system.sprite_changed(&target_name(&caller, target)?, SpriteChange::Size { size: record.size });
        Ok(())
    });
    wrap!(linker, SpriteCostumeChanged, |caller: Caller<'_, HostState<S>>, target: i32| -> wasmtime::Result<()> {
        let record = read_record(&caller, target)?;
        caller.data().system.sprite_changed(&target_name(&caller, target)?, SpriteChange::Costume { index: record.costume.max(0) as usize });
        Ok(())
    });
    wrap!(linker, SpriteRotationChanged, |caller: Caller<'_, HostState<S>>, target: i32| -> wasmtime::Result<()> {
        let record = read_record(&caller, target)?;
        caller.data().system.sprite_changed(&target_name(&caller, target)?, SpriteChange::Rotation { direction: record.direction });
        Ok(())
    });
    wrap!(linker, SpriteVisibilityChanged, |caller: Caller<'_, HostState<S>>, target: i32| -> wasmtime::Result<()> {
        let record = read_record(&caller, target)?;
        caller.data().system.sprite_changed(&target_name(&caller, target)?, SpriteChange::Visibility { visible: record.visible });
        Ok(())
    });

    wrap!(linker, SensingTimer, |caller: Caller<'_, HostState<S>>| caller.data().timer_start.elapsed().as_secs_f64());
    wrap!(linker, SensingResetTimer, |mut caller: Caller<'_, HostState<S>>| caller.data_mut().timer_start = Instant::now());
    wrap!(linker, SensingDaysSince2000, || days_since_2000());
    wrap!(linker, RuntimeClock, |caller: Caller<'_, HostState<S>>| caller.data().clock());

    wrap!(linker, ListAdd, |mut caller: Caller<'_, HostState<S>>, list: i32, tag: i32, payload: i64| -> wasmtime::Result<()> {
        let item = read_value(&caller, tag, payload)?;
        let (items, _) = list_mut(&mut caller, list)?;
        if items.len() < LIST_ITEM_LIMIT {
            items.push(item);
        }
        Ok(())
    });
    wrap!(linker, ListDelete, |mut caller: Caller<'_, HostState<S>>, list: i32, tag: i32, payload: i64| -> wasmtime::Result<()> {
        let index = read_value(&caller, tag, payload)?;
        let (items, rng) = list_mut(&mut caller, list)?;
        match list_index(&index, items.len(), true, rng) {
            ListIndex::Item(i) => { items.remove(i); }
            ListIndex::All => items.clear(),
            ListIndex::Invalid => (),
        }
        Ok(())
    });
    wrap!(linker, ListDeleteAll, |mut caller: Caller<'_, HostState<S>>, list: i32| -> wasmtime::Result<()> {
        list_mut(&mut caller, list)?.0.clear();
        Ok(())
    });
    wrap!(linker, ListInsert, |mut caller: Caller<'_, HostState<S>>, list: i32, index_tag: i32, index_payload: i64, tag: i32, payload: i64| -> wasmtime::Result<()> {
        let index = read_value(&caller, index_tag, index_payload)?;
        let item = read_value(&caller, tag, payload)?;
        let (items, rng) = list_mut(&mut caller, list)?;
        if items.len() >= LIST_ITEM_LIMIT { return Ok(()) }
        // one past the end appends
        if let ListIndex::Item(i) = list_index(&index, items.len() + 1, false, rng) {
            items.insert(i, item);
        }
        Ok(())
    });
    wrap!(linker, ListReplace, |mut caller: Caller<'_, HostState<S>>, list: i32, index_tag: i32, index_payload: i64, tag: i32, payload: i64| -> wasmtime::Result<()> {
        let index = read_value(&caller, index_tag, index_payload)?;
        let item = read_value(&caller, tag, payload)?;
        let (items, rng) = list_mut(&mut caller, list)?;
        if let ListIndex::Item(i) = list_index(&index, items.len(), false, rng) {
            items[i] = item;
        }
        Ok(())
    });
    wrap!(linker, ListItem, |mut caller: Caller<'_, HostState<S>>, list: i32, tag: i32, payload: i64| -> wasmtime::Result<(i32, i64)> {
        let index = read_value(&caller, tag, payload)?;
        let (items, rng) = list_mut(&mut caller, list)?;
        let item = match list_index(&index, items.len(), false, rng) {
            ListIndex::Item(i) => items[i].clone(),
            ListIndex::All | ListIndex::Invalid => Value::String(CompactString::default()),
        };
        Ok(box_value(&mut caller, item))
    });
    wrap!(linker, ListLength, |mut caller: Caller<'_, HostState<S>>, list: i32| -> wasmtime::Result<f64> {
        Ok(list_mut(&mut caller, list)?.0.len() as f64)
    });
    wrap!(linker, ListContents, |mut caller: Caller<'_, HostState<S>>, list: i32| -> wasmtime::Result<i32> {
        let contents = list_contents(list_mut(&mut caller, list)?.0);
        Ok(alloc_string(&mut caller, contents))
    });

    Ok(())
}

#[test]
fn test_pick_random() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for _ in 0..200 {
        let x = pick_random(&mut rng, 1.0, 10.0);
        assert!((1.0..=10.0).contains(&x) && x.fract() == 0.0);
        let y = pick_random(&mut rng, 3.0, -2.0);
        assert!((-2.0..=3.0).contains(&y) && y.fract() == 0.0);
        let z = pick_random(&mut rng, 0.5, 1.0);
        assert!((0.5..=1.0).contains(&z));
    }
    assert_eq!(pick_random(&mut rng, 4.5, 4.5), 4.5);

    let mut seen = [false; 3];
    for _ in 0..200 {
        seen[pick_random(&mut rng, 0.0, 2.0) as usize] = true;
    }
    assert_eq!(seen, [true; 3]);

    for (a, b) in [(f64::NEG_INFINITY, f64::INFINITY), (f64::INFINITY, f64::NEG_INFINITY), (f64::NEG_INFINITY, 0.5)] {
        let x = pick_random(&mut rng, a, b);
        assert!(!x.is_nan(), "{a} {b}");
    }
    assert_eq!(pick_random(&mut rng, f64::NEG_INFINITY, f64::INFINITY), 0.0);
    assert_eq!(pick_random(&mut rng, f64::INFINITY, f64::INFINITY), f64::INFINITY);
}

#[cfg(test)]
fn test_state() -> HostState<crate::std_system::StdSystem> {
    let settings = Settings { seed: Some(1), ..Default::default() };
    HostState::new(Default::default(), vec![], vec![vec![Value::Number(1.0)]], &settings).unwrap()
}

#[test]
fn test_string_collection() {
    let mut state = test_state();
    state.constant_count = 2;
    let a = state.alloc_string("apple".into()) as u32;
    let b = state.alloc_string("banana".into()) as u32;
    assert_eq!((a, b), (2, 3));
    assert_eq!(state.alloc_string("apple".into()) as u32, a);
    assert_eq!(state.live_strings(), 2);

    assert_eq!(state.collect_strings([b, 0, 1, 9000]), 1);
    assert_eq!(state.live_strings(), 1);
    assert_eq!(state.runtime_string(a), None);
    assert_eq!(state.runtime_string(b), Some("banana"));

    // nothing allocated, so nothing is collected
    assert_eq!(state.collect_strings([]), 0);
    assert_eq!(state.runtime_string(b), Some("banana"));

    let c = state.alloc_string("cherry".into()) as u32;
    assert_eq!(c, a);
    assert_eq!(state.alloc_string("apple".into()) as u32, 4);
    assert_eq!(state.collect_strings([c]), 2);
    assert_eq!(state.runtime_string(c), Some("cherry"));
    assert_eq!(state.live_strings(), 1);
    assert_eq!(state.list(0), Some([Value::Number(1.0)].as_slice()));
    assert_eq!(state.list(1), None);
}

#[test]
fn test_days_since_2000() {
    // 2024-01-01 is 8766 days after the epoch
    assert!(days_since_2000() > 8766.0);
}
