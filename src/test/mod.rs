use std::cell::RefCell;
use std::time::Duration;

use crate::ast;
use crate::assembler::CompiledProject;
use crate::compiler::CompileOptions;
use crate::project::*;
use crate::runtime::*;

mod compile;
mod project;

/// Something a [`RecordingSystem`] was told about.
#[derive(Debug, Clone, PartialEq)]
enum Event {
    Say { target: String, kind: BubbleKind, value: Value },
    Log { value: Value },
    Assert { value: Value },
    Pen { command: PenCommand },
    Sprite { target: String, change: SpriteChange },
    Draw,
}

/// A [`System`] which remembers every call made to it, in order.
#[derive(Default)]
struct RecordingSystem {
    events: RefCell<Vec<Event>>,
}
impl RecordingSystem {
    fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }
    fn said(&self) -> Vec<Value> {
        self.events.borrow().iter().filter_map(|x| match x {
            Event::Say { value, .. } => Some(value.clone()),
            _ => None,
        }).collect()
    }
    fn draws(&self) -> usize {
        self.events.borrow().iter().filter(|x| **x == Event::Draw).count()
    }
}
impl System for RecordingSystem {
    fn say(&self, target: &str, kind: BubbleKind, value: &Value) {
        self.events.borrow_mut().push(Event::Say { target: target.into(), kind, value: value.clone() });
    }
    fn log(&self, value: &Value) {
        self.events.borrow_mut().push(Event::Log { value: value.clone() });
    }
    fn assert(&self, value: &Value) {
        self.events.borrow_mut().push(Event::Assert { value: value.clone() });
    }
    fn pen(&self, command: PenCommand) {
        self.events.borrow_mut().push(Event::Pen { command });
    }
    fn sprite_changed(&self, target: &str, change: SpriteChange) {
        self.events.borrow_mut().push(Event::Sprite { target: target.into(), change });
    }
    fn draw(&self) {
        self.events.borrow_mut().push(Event::Draw);
    }
    fn await_refresh(&self) {}
}

fn assert_values_eq(got: &Value, expected: &Value, epsilon: f64, path: &str) {
    match (got, expected) {
        (Value::Bool(got), Value::Bool(expected)) => {
            if got != expected { panic!("{} - bool error - got {} expected {}", path, got, expected) }
        }
        (Value::Number(got), Value::Number(expected)) => {
            let good = if got.is_finite() && expected.is_finite() { (got - expected).abs() <= epsilon } else { got == expected || (got.is_nan() && expected.is_nan()) };
            if !good { panic!("{} - number error - got {} expected {}", path, got, expected) }
        }
        (Value::String(got), Value::String(expected)) => {
            if got != expected { panic!("{} - string error - got {:?} expected {:?}", path, got, expected) }
        }
        (x, y) => panic!("{} - type error - got {:?} expected {:?}", path, x, y),
    }
}
fn assert_said(system: &RecordingSystem, expected: &[Value], epsilon: f64) {
    let said = system.said();
    assert_eq!(said.len(), expected.len(), "said {:?}", said);
    for (i, (got, expected)) in said.iter().zip(expected).enumerate() {
        assert_values_eq(got, expected, epsilon, &format!("say[{i}]"));
    }
}

/// A stage with one global numeric variable `g`, plus a single sprite holding `blocks`.
fn sprite_project(blocks: serde_json::Value) -> ast::Project {
    serde_json::from_value(serde_json::json!({
        "targets": [{
            "name": "Stage",
            "is_stage": true,
            "variables": [{ "id": "g", "name": "global", "value": 0 }],
        }, {
            "name": "Sprite1",
            "variables": [{ "id": "s", "name": "local", "value": "" }],
            "costumes": [{ "name": "a" }, { "name": "b" }, { "name": "c" }],
            "blocks": blocks,
        }]
    })).unwrap()
}

fn test_settings() -> Settings {
    Settings { turbo: true, seed: Some(0), timeout: Some(Duration::from_secs(20)), ..Settings::default() }
}

fn get_running_project(project: &ast::Project, options: CompileOptions) -> Project<RecordingSystem> {
    let compiled = CompiledProject::compile(project, options).unwrap();
    let mut proj = Project::new(&compiled, RecordingSystem::default(), test_settings()).unwrap();
    proj.input(Input::Start).unwrap();
    proj
}

fn run_till_term(project: &mut Project<RecordingSystem>) {
    for _ in 0..100_000 {
        match project.step().unwrap() {
            ProjectStep::Idle => return,
            ProjectStep::Normal => (),
        }
    }
    panic!("project did not terminate");
}

/// Compiles and runs a single sprite script to completion, returning everything it did.
fn run_blocks(blocks: serde_json::Value) -> Project<RecordingSystem> {
    let mut proj = get_running_project(&sprite_project(blocks), CompileOptions::default());
    run_till_term(&mut proj);
    proj
}
