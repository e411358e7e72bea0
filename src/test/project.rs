use std::cmp::Ordering;

use crate::assembler::CompiledProject;
use crate::compiler::CompileOptions;

use super::*;

fn flag(next: &str) -> serde_json::Value {
    serde_json::json!({ "opcode": "event_whenflagclicked", "next": next, "top_level": true })
}
fn say(value: serde_json::Value, next: Option<&str>) -> serde_json::Value {
    serde_json::json!({ "opcode": "looks_say", "inputs": { "MESSAGE": value }, "next": next })
}
fn global_number(proj: &mut Project<RecordingSystem>, id: &str) -> f64 {
    proj.global_variable(id).and_then(|x| x.f64()).unwrap()
}

#[test]
fn test_proj_pass_end() {
    let mut proj = run_blocks(serde_json::json!({
        "hat": flag("a"),
        "a": say(serde_json::json!({ "literal": "pass test1" }), Some("b")),
        "b": say(serde_json::json!({ "literal": "end" }), None),
    }));
    assert_said(proj.system(), &["pass test1".into(), "end".into()], 0.0);
    assert!(proj.system().events().iter().all(|x| match x {
        Event::Say { target, kind, .. } => target == "Sprite1" && *kind == BubbleKind::Say,
        _ => true,
    }));
    assert_eq!(proj.active_threads(), 0);
    assert_eq!(proj.thread_statuses(), [ThreadStatus::Completed]);
    assert_eq!(proj.step().unwrap(), ProjectStep::Idle);
}

#[test]
fn test_proj_literal_round_trip() {
    let values = [
        serde_json::json!(0.1), serde_json::json!(-2.5e-300), serde_json::json!(1.7976931348623157e308), serde_json::json!(42),
        serde_json::json!(true), serde_json::json!(false),
        serde_json::json!(""), serde_json::json!("héllo wörld ✓"), serde_json::json!("123"),
    ];
    let mut blocks = serde_json::Map::new();
    blocks.insert("hat".into(), flag("say0"));
    for (i, value) in values.iter().enumerate() {
        let next = if i + 1 < values.len() { Some(format!("say{}", i + 1)) } else { None };
        blocks.insert(format!("say{i}"), say(serde_json::json!({ "literal": value }), next.as_deref()));
    }
    let proj = run_blocks(serde_json::Value::Object(blocks));

    assert_said(proj.system(), &[
        Value::Number(0.1), Value::Number(-2.5e-300), Value::Number(f64::MAX), Value::Number(42.0),
        Value::Bool(true), Value::Bool(false),
        "".into(), "héllo wörld ✓".into(), "123".into(),
    ], 0.0);
}

#[test]
fn test_proj_tan() {
    let angles = [90.0, 270.0, -90.0, -270.0, 45.0, 0.0];
    let mut blocks = serde_json::Map::new();
    blocks.insert("hat".into(), flag("say0"));
    for (i, angle) in angles.iter().enumerate() {
        let next = if i + 1 < angles.len() { Some(format!("say{}", i + 1)) } else { None };
        blocks.insert(format!("say{i}"), say(serde_json::json!({ "block": format!("tan{i}") }), next.as_deref()));
        blocks.insert(format!("tan{i}"), serde_json::json!({ "opcode": "operator_mathop", "fields": { "OPERATOR": "tan" }, "inputs": { "NUM": { "literal": angle } } }));
    }
    let proj = run_blocks(serde_json::Value::Object(blocks));

    assert_said(proj.system(), &[
        Value::Number(f64::INFINITY), Value::Number(f64::INFINITY),
        Value::Number(f64::NEG_INFINITY), Value::Number(f64::NEG_INFINITY),
        Value::Number(1.0), Value::Number(0.0),
    ], 1e-10);
}

#[test]
fn test_proj_comparison_matrix() {
    let pairs = [
        (serde_json::json!(0), serde_json::json!("0")),
        (serde_json::json!("true"), serde_json::json!(true)),
        (serde_json::json!("banana"), serde_json::json!("BANANA")),
        (serde_json::json!("NaN"), serde_json::json!("NaN")),
        (serde_json::json!("10"), serde_json::json!(9)),
        (serde_json::json!("apple"), serde_json::json!("banana")),
        (serde_json::json!(" "), serde_json::json!(0)),
    ];
    let ops = ["operator_lt", "operator_equals", "operator_gt"];

    let mut blocks = serde_json::Map::new();
    let mut expected = vec![];
    blocks.insert("hat".into(), flag("say0"));
    let count = pairs.len() * ops.len();
    for (i, (a, b)) in pairs.iter().enumerate() {
        let lit = |x: &serde_json::Value| serde_json::from_value::<crate::ast::Literal>(x.clone()).unwrap();
        let to_value = |x: crate::ast::Literal| match x {
            crate::ast::Literal::Bool(x) => Value::Bool(x),
            crate::ast::Literal::Number(x) => Value::Number(x),
            crate::ast::Literal::String(x) => Value::String(x.into()),
        };
        let ordering = compare(&to_value(lit(a)), &to_value(lit(b)));

        for (j, op) in ops.iter().enumerate() {
            let k = i * ops.len() + j;
            let next = if k + 1 < count { Some(format!("say{}", k + 1)) } else { None };
            blocks.insert(format!("say{k}"), say(serde_json::json!({ "block": format!("cmp{k}") }), next.as_deref()));
            blocks.insert(format!("cmp{k}"), serde_json::json!({ "opcode": op, "inputs": { "OPERAND1": { "literal": a }, "OPERAND2": { "literal": b } } }));
            expected.push(Value::Bool(ordering == [Ordering::Less, Ordering::Equal, Ordering::Greater][j]));
        }
    }

    // all of the first four pairs compare equal
    for chunk in expected[..12].chunks(3) {
        assert_eq!(chunk, [Value::Bool(false), Value::Bool(true), Value::Bool(false)]);
    }
    assert_eq!(&expected[12..18], [Value::Bool(false), Value::Bool(false), Value::Bool(true), Value::Bool(true), Value::Bool(false), Value::Bool(false)]);

    let proj = run_blocks(serde_json::Value::Object(blocks));
    assert_said(proj.system(), &expected, 0.0);
}

#[test]
fn test_proj_repeat_counts() {
    for (times, expected) in [(serde_json::json!(3), 3.0), (serde_json::json!(2.5), 3.0), (serde_json::json!(2.4), 2.0), (serde_json::json!(-1), 0.0), (serde_json::json!("abc"), 0.0), (serde_json::json!("4"), 4.0)] {
        let mut proj = get_running_project(&sprite_project(serde_json::json!({
            "hat": flag("loop"),
            "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": times.clone() }, "SUBSTACK": { "block": "inc" } } },
            "inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } },
        })), CompileOptions::default());

        // one iteration per tick, plus the tick that leaves the loop
        let mut ticks = 0;
        while proj.step().unwrap() == ProjectStep::Normal {
            ticks += 1;
        }
        assert_eq!(global_number(&mut proj, "g"), expected, "repeat {times}");
        assert_eq!(ticks, expected as usize + 1, "repeat {times}");
    }
}

#[test]
fn test_proj_wait_until() {
    let mut proj = run_blocks(serde_json::json!({
        "a_hat": flag("wait"),
        "wait": { "opcode": "control_wait_until", "inputs": { "CONDITION": { "block": "gt" } }, "next": "done" },
        "gt": { "opcode": "operator_gt", "inputs": { "OPERAND1": { "block": "var" }, "OPERAND2": { "literal": 2 } } },
        "var": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },
        "done": say(serde_json::json!({ "block": "var2" }), None),
        "var2": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },

        "b_hat": flag("loop"),
        "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 5 }, "SUBSTACK": { "block": "inc" } } },
        "inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } },
    }));
    // the waiting thread runs first in each tick, so it sees the count from the previous tick
    assert_said(proj.system(), &[Value::Number(3.0)], 0.0);
    assert_eq!(global_number(&mut proj, "g"), 5.0);
}

#[test]
fn test_proj_variables() {
    let mut proj = run_blocks(serde_json::json!({
        "hat": flag("a"),
        "a": { "opcode": "data_setvariableto", "fields": { "VARIABLE": "s" }, "inputs": { "VALUE": { "literal": "hi" } }, "next": "b" },
        "b": say(serde_json::json!({ "block": "join" }), Some("c")),
        "join": { "opcode": "operator_join", "inputs": { "STRING1": { "block": "s1" }, "STRING2": { "literal": "!" } } },
        "s1": { "opcode": "data_variable", "fields": { "VARIABLE": "s" } },
        "c": { "opcode": "data_setvariableto", "fields": { "VARIABLE": "s" }, "inputs": { "VALUE": { "literal": 5 } }, "next": "d" },
        "d": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "s" }, "inputs": { "VALUE": { "literal": 1 } }, "next": "e" },
        "e": say(serde_json::json!({ "block": "s2" }), Some("f")),
        "s2": { "opcode": "data_variable", "fields": { "VARIABLE": "s" } },
        "f": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 2.5 } }, "next": "g" },
        "g": say(serde_json::json!({ "block": "len" }), None),
        "len": { "opcode": "operator_length", "inputs": { "STRING": { "block": "gv" } } },
        "gv": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },
    }));
    assert_said(proj.system(), &["hi!".into(), Value::Number(6.0), Value::Number(3.0)], 0.0);
    assert_eq!(global_number(&mut proj, "g"), 2.5);
    // assigned both strings and numbers, so it lives in memory instead of a global
    assert!(proj.global_variable("s").is_none());
}

#[test]
fn test_proj_if_else() {
    let proj = run_blocks(serde_json::json!({
        "hat": flag("if"),
        "if": { "opcode": "control_if_else", "inputs": { "CONDITION": { "block": "cond" }, "SUBSTACK": { "block": "yes" }, "SUBSTACK2": { "block": "no" } }, "next": "if2" },
        "cond": { "opcode": "operator_contains", "inputs": { "STRING1": { "literal": "Hello" }, "STRING2": { "literal": "ELL" } } },
        "yes": say(serde_json::json!({ "literal": "yes" }), None),
        "no": say(serde_json::json!({ "literal": "no" }), None),
        "if2": { "opcode": "control_if", "inputs": { "CONDITION": { "block": "not" }, "SUBSTACK": { "block": "inner" } }, "next": "end" },
        "not": { "opcode": "operator_not", "inputs": { "OPERAND": { "block": "cond2" } } },
        "cond2": { "opcode": "operator_and", "inputs": { "OPERAND1": { "literal": true }, "OPERAND2": { "literal": "false" } } },
        "inner": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 2 }, "SUBSTACK": { "block": "inner_say" } } },
        "inner_say": say(serde_json::json!({ "literal": "again" }), None),
        "end": say(serde_json::json!({ "literal": "end" }), None),
    }));
    assert_said(proj.system(), &["yes".into(), "again".into(), "again".into(), "end".into()], 0.0);
}

#[test]
fn test_proj_stop_input() {
    let mut targets = vec![serde_json::json!({ "name": "Stage", "is_stage": true })];
    for i in 0..8 {
        targets.push(serde_json::json!({
            "name": format!("Sprite{i}"),
            "blocks": {
                "hat1": flag("forever"),
                "forever": { "opcode": "control_forever", "inputs": { "SUBSTACK": { "block": "turn" } } },
                "turn": { "opcode": "motion_turnright", "inputs": { "DEGREES": { "literal": 15 } } },
                "hat2": flag("wait"),
                "wait": { "opcode": "control_wait", "inputs": { "DURATION": { "literal": 1000 } } },
            },
        }));
    }
    let project: crate::ast::Project = serde_json::from_value(serde_json::json!({ "targets": targets })).unwrap();
    let mut proj = get_running_project(&project, CompileOptions::default());
    assert_eq!(proj.active_threads(), 16);
    assert!(proj.thread_statuses().iter().all(|x| *x == ThreadStatus::Pending));

    for _ in 0..5 {
        assert_eq!(proj.step().unwrap(), ProjectStep::Normal);
    }
    assert_eq!(proj.active_threads(), 16);
    assert!(proj.thread_statuses().iter().all(|x| *x == ThreadStatus::Yielded));

    proj.input(Input::Stop).unwrap();
    assert_eq!(proj.active_threads(), 0);
    assert!(proj.thread_statuses().iter().all(|x| *x == ThreadStatus::Stopped));
    assert_eq!(proj.step().unwrap(), ProjectStep::Idle);

    // pressing start again restarts everything
    proj.input(Input::Start).unwrap();
    assert_eq!(proj.active_threads(), 16);
}

#[test]
fn test_proj_stop_blocks() {
    let mut proj = run_blocks(serde_json::json!({
        "a_hat": flag("a_forever"),
        "a_forever": { "opcode": "control_forever", "inputs": { "SUBSTACK": { "block": "a_inc" } } },
        "a_inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } },

        "b_hat": flag("b_loop"),
        "b_loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 3 }, "SUBSTACK": { "block": "b_say" } }, "next": "b_stop" },
        "b_say": say(serde_json::json!({ "literal": "tick" }), None),
        "b_stop": { "opcode": "control_stop", "fields": { "STOP_OPTION": "other scripts in sprite" }, "next": "b_end" },
        "b_end": { "opcode": "control_stop", "fields": { "STOP_OPTION": "this script" }, "next": "b_never" },
        "b_never": say(serde_json::json!({ "literal": "never" }), None),
    }));
    assert_said(proj.system(), &["tick".into(), "tick".into(), "tick".into()], 0.0);
    assert_eq!(global_number(&mut proj, "g"), 4.0);
    assert_eq!(proj.active_threads(), 0);

    let mut proj = run_blocks(serde_json::json!({
        "a_hat": flag("a_forever"),
        "a_forever": { "opcode": "control_forever", "inputs": { "SUBSTACK": { "block": "a_inc" } } },
        "a_inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } },
        "b_hat": flag("b_stop"),
        "b_stop": { "opcode": "control_stop", "fields": { "STOP_OPTION": "all" }, "next": "b_never" },
        "b_never": say(serde_json::json!({ "literal": "never" }), None),
    }));
    assert_said(proj.system(), &[], 0.0);
    assert_eq!(global_number(&mut proj, "g"), 1.0);
    assert_eq!(proj.active_threads(), 0);
}

#[test]
fn test_proj_statuses() {
    let mut proj = get_running_project(&sprite_project(serde_json::json!({
        "a_hat": flag("a_say"),
        "a_say": say(serde_json::json!({ "literal": "hi" }), None),
        "b_hat": flag("b_loop"),
        "b_loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 2 }, "SUBSTACK": { "block": "b_show" } } },
        "b_show": { "opcode": "looks_show" },
    })), CompileOptions::default());
    assert_eq!(proj.thread_statuses(), [ThreadStatus::Pending, ThreadStatus::Pending]);
    assert_eq!(proj.active_threads(), 2);

    proj.step().unwrap();
    assert_eq!(proj.thread_statuses(), [ThreadStatus::Completed, ThreadStatus::Yielded]);
    assert_eq!(proj.active_threads(), 1);

    run_till_term(&mut proj);
    assert_eq!(proj.thread_statuses(), [ThreadStatus::Completed, ThreadStatus::Completed]);
}

#[test]
fn test_proj_redraw_frames() {
    let blocks = |body: serde_json::Value| serde_json::json!({
        "hat": flag("loop"),
        "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 5 }, "SUBSTACK": { "block": "body" } } },
        "body": body,
    });
    let run = |blocks: serde_json::Value| {
        let compiled = CompiledProject::compile(&sprite_project(blocks), CompileOptions::default()).unwrap();
        let mut proj = Project::new(&compiled, RecordingSystem::default(), test_settings()).unwrap();
        proj.input(Input::Start).unwrap();
        proj.run().unwrap();
        proj
    };

    let moving = run(blocks(serde_json::json!({ "opcode": "motion_changexby", "inputs": { "DX": { "literal": 10 } } })));
    assert!(moving.system().draws() >= 5, "draws: {}", moving.system().draws());
    assert_eq!(moving.target(1).unwrap().x, 50.0);
    let positions = moving.system().events().into_iter().filter_map(|x| match x {
        Event::Sprite { change: SpriteChange::Position { x, .. }, .. } => Some(x),
        _ => None,
    }).collect::<Vec<_>>();
    assert_eq!(positions, [10.0, 20.0, 30.0, 40.0, 50.0]);

    let counting = run(blocks(serde_json::json!({ "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } })));
    assert!(counting.system().draws() < moving.system().draws());
    assert!(counting.system().draws() >= 1);
}

#[test]
fn test_proj_pen_motion() {
    let proj = run_blocks(serde_json::json!({
        "hat": flag("down"),
        "down": { "opcode": "pen_penDown", "next": "size" },
        "size": { "opcode": "pen_setPenSizeTo", "inputs": { "SIZE": { "literal": 4 } }, "next": "goto" },
        "goto": { "opcode": "motion_gotoxy", "inputs": { "X": { "literal": 10 }, "Y": { "literal": 20 } }, "next": "up" },
        "up": { "opcode": "pen_penUp", "next": "point" },
        "point": { "opcode": "motion_pointindirection", "inputs": { "DIRECTION": { "literal": 270 } }, "next": "grow" },
        "grow": { "opcode": "looks_changesizeby", "inputs": { "CHANGE": { "literal": -150 } }, "next": "say" },
        "say": say(serde_json::json!({ "block": "dir" }), None),
        "dir": { "opcode": "motion_direction" },
    }));

    let pen = proj.system().events().into_iter().filter_map(|x| match x {
        Event::Pen { command } => Some(command),
        _ => None,
    }).collect::<Vec<_>>();
    assert_eq!(pen.len(), 4, "{pen:?}");
    assert_eq!(pen[0], PenCommand::Down { target: 1 });
    assert!(matches!(pen[1], PenCommand::Point { target: 1, x, y, size, .. } if (x, y, size) == (0.0, 0.0, 1.0)));
    assert!(matches!(pen[2], PenCommand::Line { target: 1, from, to, size, .. } if from == (0.0, 0.0) && to == (10.0, 20.0) && size == 4.0));
    assert_eq!(pen[3], PenCommand::Up { target: 1 });

    let record = proj.target(1).unwrap();
    assert_eq!((record.x, record.y, record.direction, record.size, record.pen_size), (10.0, 20.0, -90.0, 0.0, 4.0));
    assert!(!record.pen_down);
    assert_said(proj.system(), &[Value::Number(-90.0)], 0.0);
}

#[test]
fn test_proj_costumes() {
    let proj = run_blocks(serde_json::json!({
        "hat": flag("a"),
        "a": { "opcode": "looks_switchcostumeto", "inputs": { "COSTUME": { "block": "menu" } }, "next": "b" },
        "menu": { "opcode": "looks_costume", "fields": { "COSTUME": "c" } },
        "b": say(serde_json::json!({ "block": "num1" }), Some("c")),
        "num1": { "opcode": "looks_costumenumbername", "fields": { "NUMBER_NAME": "number" } },
        "c": { "opcode": "looks_nextcostume", "next": "d" },
        "d": say(serde_json::json!({ "block": "num2" }), Some("e")),
        "num2": { "opcode": "looks_costumenumbername", "fields": { "NUMBER_NAME": "number" } },
        "e": { "opcode": "looks_switchcostumeto", "inputs": { "COSTUME": { "literal": 5 } }, "next": "f" },
        "f": say(serde_json::json!({ "block": "num3" }), Some("g")),
        "num3": { "opcode": "looks_costumenumbername", "fields": { "NUMBER_NAME": "number" } },
        "g": { "opcode": "looks_switchcostumeto", "inputs": { "COSTUME": { "literal": "nope" } }, "next": "h" },
        "h": say(serde_json::json!({ "block": "num4" }), None),
        "num4": { "opcode": "looks_costumenumbername", "fields": { "NUMBER_NAME": "number" } },
    }));
    assert_said(proj.system(), &[Value::Number(3.0), Value::Number(1.0), Value::Number(2.0), Value::Number(2.0)], 0.0);
}

#[test]
fn test_proj_random_seeded() {
    let blocks = || serde_json::json!({
        "hat": flag("loop"),
        "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 20 }, "SUBSTACK": { "block": "say" } } },
        "say": say(serde_json::json!({ "block": "rand" }), None),
        "rand": { "opcode": "operator_random", "inputs": { "FROM": { "literal": 1 }, "TO": { "literal": 6 } } },
    });
    let a = run_blocks(blocks());
    let b = run_blocks(blocks());
    assert_eq!(a.system().said(), b.system().said());
    for value in a.system().said() {
        match value {
            Value::Number(x) => assert!((1.0..=6.0).contains(&x) && x.fract() == 0.0, "{x}"),
            x => panic!("{x:?}"),
        }
    }
}

#[test]
fn test_proj_debug_mode() {
    let mut proj = get_running_project(&sprite_project(serde_json::json!({
        "hat": flag("a"),
        "a": say(serde_json::json!({ "literal": "logged" }), Some("b")),
        "b": { "opcode": "looks_think", "inputs": { "MESSAGE": { "literal": true } } },
    })), CompileOptions { debug: true });
    run_till_term(&mut proj);
    assert_eq!(proj.system().events(), [
        Event::Log { value: "logged".into() },
        Event::Assert { value: Value::Bool(true) },
    ]);
}

fn procedure(proccode: &str, ids: &[&str], names: &[&str], warp: bool, body: &str) -> [(String, serde_json::Value); 2] {
    let def = format!("def {proccode}");
    let proto = format!("proto {proccode}");
    [
        (def, serde_json::json!({ "opcode": "procedures_definition", "next": body, "top_level": true, "inputs": { "custom_block": { "block": proto } } })),
        (proto, serde_json::json!({
            "opcode": "procedures_prototype",
            "mutation": { "proccode": proccode, "argumentids": ids, "argumentnames": names, "warp": warp },
        })),
    ]
}
fn call(proccode: &str, ids: &[&str], inputs: serde_json::Value, next: Option<&str>) -> serde_json::Value {
    serde_json::json!({ "opcode": "procedures_call", "inputs": inputs, "next": next, "mutation": { "proccode": proccode, "argumentids": ids } })
}
fn with_blocks(mut blocks: serde_json::Value, extra: impl IntoIterator<Item = (String, serde_json::Value)>) -> serde_json::Value {
    if let Some(map) = blocks.as_object_mut() {
        map.extend(extra);
    }
    blocks
}

#[test]
fn test_proj_lists() {
    let project: crate::ast::Project = serde_json::from_value(serde_json::json!({
        "targets": [{
            "name": "Stage", "is_stage": true,
            "lists": [{ "id": "l", "name": "things", "value": [1, "a"] }],
        }, {
            "name": "Sprite1",
            "lists": [{ "id": "chars", "name": "chars" }],
            "blocks": {
                "hat": flag("add"),
                "add": { "opcode": "data_addtolist", "fields": { "LIST": "l" }, "inputs": { "ITEM": { "literal": "b" } }, "next": "insert" },
                "insert": { "opcode": "data_insertatlist", "fields": { "LIST": "l" }, "inputs": { "INDEX": { "literal": 1 }, "ITEM": { "literal": "x" } }, "next": "replace" },
                "replace": { "opcode": "data_replaceitemoflist", "fields": { "LIST": "l" }, "inputs": { "INDEX": { "literal": "last" }, "ITEM": { "literal": true } }, "next": "delete" },
                "delete": { "opcode": "data_deleteoflist", "fields": { "LIST": "l" }, "inputs": { "INDEX": { "literal": 2 } }, "next": "ignored" },
                "ignored": { "opcode": "data_deleteoflist", "fields": { "LIST": "l" }, "inputs": { "INDEX": { "literal": 99 } }, "next": "say_len" },
                "say_len": say(serde_json::json!({ "block": "len" }), Some("say_first")),
                "len": { "opcode": "data_lengthoflist", "fields": { "LIST": "l" } },
                "say_first": say(serde_json::json!({ "block": "first" }), Some("say_missing")),
                "first": { "opcode": "data_itemoflist", "fields": { "LIST": "l" }, "inputs": { "INDEX": { "literal": 1 } } },
                "say_missing": say(serde_json::json!({ "block": "missing" }), Some("say_contents")),
                "missing": { "opcode": "data_itemoflist", "fields": { "LIST": "l" }, "inputs": { "INDEX": { "literal": 10 } } },
                "say_contents": say(serde_json::json!({ "block": "contents" }), Some("c1")),
                "contents": { "opcode": "data_listcontents", "fields": { "LIST": "l" } },

                "c1": { "opcode": "data_addtolist", "fields": { "LIST": "chars" }, "inputs": { "ITEM": { "literal": "o" } }, "next": "c2" },
                "c2": { "opcode": "data_insertatlist", "fields": { "LIST": "chars" }, "inputs": { "INDEX": { "literal": "last" }, "ITEM": { "literal": "k" } }, "next": "say_chars" },
                "say_chars": say(serde_json::json!({ "block": "chars" }), Some("clear")),
                "chars": { "opcode": "data_listcontents", "fields": { "LIST": "chars" } },
                "clear": { "opcode": "data_deleteoflist", "fields": { "LIST": "l" }, "inputs": { "INDEX": { "literal": "all" } } },
            },
        }],
    })).unwrap();
    let compiled = CompiledProject::compile(&project, CompileOptions::default()).unwrap();
    assert_eq!(compiled.lists.iter().map(|x| (x.id.as_str(), x.name.as_str())).collect::<Vec<_>>(), [("l", "things"), ("chars", "chars")]);
    assert_eq!(compiled.lists[0].items, [Value::Number(1.0), "a".into()]);

    let mut proj = Project::new(&compiled, RecordingSystem::default(), test_settings()).unwrap();
    proj.input(Input::Start).unwrap();
    run_till_term(&mut proj);
    assert_said(proj.system(), &[Value::Number(3.0), "x".into(), "".into(), "x a true".into(), "ok".into()], 0.0);
    assert_eq!(proj.list(0), Some([].as_slice()));
    assert_eq!(proj.list(1), Some([Value::from("o"), Value::from("k")].as_slice()));
    assert_eq!(proj.list(2), None);
}

#[test]
fn test_proj_list_limit() {
    let project: crate::ast::Project = serde_json::from_value(serde_json::json!({
        "targets": [{
            "name": "Stage", "is_stage": true,
            "lists": [{ "id": "big", "name": "big", "value": vec![0; LIST_ITEM_LIMIT - 1] }],
            "blocks": {
                "hat": flag("a"),
                "a": { "opcode": "data_addtolist", "fields": { "LIST": "big" }, "inputs": { "ITEM": { "literal": 1 } }, "next": "b" },
                "b": { "opcode": "data_addtolist", "fields": { "LIST": "big" }, "inputs": { "ITEM": { "literal": 2 } }, "next": "c" },
                "c": { "opcode": "data_insertatlist", "fields": { "LIST": "big" }, "inputs": { "INDEX": { "literal": 1 }, "ITEM": { "literal": 3 } } },
            },
        }],
    })).unwrap();
    let mut proj = get_running_project(&project, CompileOptions::default());
    run_till_term(&mut proj);
    let items = proj.list(0).unwrap();
    assert_eq!(items.len(), LIST_ITEM_LIMIT);
    assert_eq!((&items[0], items.last()), (&Value::Number(0.0), Some(&Value::Number(1.0))));
}

#[test]
fn test_proj_procedures() {
    for warp in [false, true] {
        let blocks = with_blocks(serde_json::json!({
            "hat": flag("call"),
            "call": call("count to %n", &["n_id"], serde_json::json!({ "n_id": { "literal": 3 } }), Some("done")),
            "done": say(serde_json::json!({ "block": "g" }), None),
            "g": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },
            "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "block": "n" }, "SUBSTACK": { "block": "inc" } } },
            "n": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "n" } },
            "inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } },
        }), procedure("count to %n", &["n_id"], &["n"], warp, "loop"));
        let mut proj = get_running_project(&sprite_project(blocks), CompileOptions::default());

        let mut ticks = 0;
        while proj.step().unwrap() == ProjectStep::Normal {
            ticks += 1;
        }
        assert_said(proj.system(), &[Value::Number(3.0)], 0.0);
        assert_eq!(global_number(&mut proj, "g"), 3.0);
        // the loop yields once per iteration unless the procedure runs without screen refresh
        assert_eq!(ticks, if warp { 1 } else { 4 }, "warp {warp}");
    }
}

#[test]
fn test_proj_procedure_arguments() {
    let blocks = with_blocks(serde_json::json!({
        "hat": flag("call1"),
        "call1": call("greet %s %b", &["s_id", "b_id"], serde_json::json!({ "s_id": { "literal": "bob" }, "b_id": { "literal": true } }), Some("call2")),
        "call2": call("greet %s %b", &["s_id", "b_id"], serde_json::json!({ "s_id": { "literal": "amy" }, "b_id": { "block": "cmp" } }), Some("call3")),
        "cmp": { "opcode": "operator_gt", "inputs": { "OPERAND1": { "literal": 1 }, "OPERAND2": { "literal": 2 } } },
        "call3": call("greet %s %b", &["s_id", "b_id"], serde_json::json!({ "b_id": { "literal": true } }), Some("call4")),
        "call4": call("undefined %s", &["u"], serde_json::json!({ "u": { "literal": 1 } }), Some("outside")),
        "outside": say(serde_json::json!({ "block": "stray" }), None),
        "stray": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "s" } },

        "if": { "opcode": "control_if_else", "inputs": { "CONDITION": { "block": "b" }, "SUBSTACK": { "block": "yes" }, "SUBSTACK2": { "block": "no" } } },
        "b": { "opcode": "argument_reporter_boolean", "fields": { "VALUE": "b" } },
        "yes": say(serde_json::json!({ "block": "join" }), None),
        "join": { "opcode": "operator_join", "inputs": { "STRING1": { "literal": "hi " }, "STRING2": { "block": "s" } } },
        "s": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "s" } },
        "no": say(serde_json::json!({ "literal": "no" }), None),
    }), procedure("greet %s %b", &["s_id", "b_id"], &["s", "b"], false, "if"));
    let proj = run_blocks(blocks);
    // a missing text argument is empty, and argument reporters outside of any procedure read zero
    assert_said(proj.system(), &["hi bob".into(), "no".into(), "hi ".into(), Value::Number(0.0)], 0.0);
}

#[test]
fn test_proj_procedure_stop() {
    for warp in [false, true] {
        let blocks = with_blocks(serde_json::json!({
            "hat": flag("call"),
            "call": call("early", &[], serde_json::json!({}), Some("after")),
            "after": say(serde_json::json!({ "literal": "after" }), Some("call_all")),
            "call_all": call("halt", &[], serde_json::json!({}), Some("never")),
            "never": say(serde_json::json!({ "literal": "never" }), None),

            "in": say(serde_json::json!({ "literal": "in" }), Some("stop")),
            "stop": { "opcode": "control_stop", "fields": { "STOP_OPTION": "this script" }, "next": "skipped" },
            "skipped": say(serde_json::json!({ "literal": "skipped" }), None),
            "stop_all": { "opcode": "control_stop", "fields": { "STOP_OPTION": "all" } },
        }), procedure("early", &[], &[], warp, "in").into_iter().chain(procedure("halt", &[], &[], warp, "stop_all")));
        let proj = run_blocks(blocks);
        assert_said(proj.system(), &["in".into(), "after".into()], 0.0);
        assert_eq!(proj.thread_statuses(), [ThreadStatus::Completed], "warp {warp}");
    }
}

#[test]
fn test_proj_procedure_recursion() {
    for warp in [false, true] {
        let blocks = with_blocks(serde_json::json!({
            "hat": flag("call"),
            "call": call("down %n", &["n_id"], serde_json::json!({ "n_id": { "literal": 5 } }), None),

            "if": { "opcode": "control_if", "inputs": { "CONDITION": { "block": "gt" }, "SUBSTACK": { "block": "inc" } } },
            "gt": { "opcode": "operator_gt", "inputs": { "OPERAND1": { "block": "n1" }, "OPERAND2": { "literal": 0 } } },
            "n1": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "n" } },
            "inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "block": "n2" } }, "next": "again" },
            "n2": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "n" } },
            "again": call("down %n", &["n_id"], serde_json::json!({ "n_id": { "block": "minus" } }), None),
            "minus": { "opcode": "operator_subtract", "inputs": { "NUM1": { "block": "n3" }, "NUM2": { "literal": 1 } } },
            "n3": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "n" } },
        }), procedure("down %n", &["n_id"], &["n"], warp, "if"));
        let mut proj = run_blocks(blocks);
        assert_eq!(global_number(&mut proj, "g"), 15.0, "warp {warp}");
    }
}

#[test]
fn test_proj_runtime_strings_collected() {
    let mut proj = get_running_project(&sprite_project(serde_json::json!({
        "hat": flag("forever"),
        "forever": { "opcode": "control_forever", "inputs": { "SUBSTACK": { "block": "inc" } } },
        "inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } }, "next": "say" },
        "say": say(serde_json::json!({ "block": "join" }), None),
        "join": { "opcode": "operator_join", "inputs": { "STRING1": { "literal": "n" }, "STRING2": { "block": "var" } } },
        "var": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },
    })), CompileOptions::default());
    for _ in 0..100_000 {
        proj.step().unwrap();
    }
    assert!(proj.runtime_strings() < 1000, "{} live strings", proj.runtime_strings());
    assert_eq!(proj.system().said().last(), Some(&"n100000".into()));
}

#[test]
fn test_proj_runtime_strings_kept() {
    // strings held by variables and by yielded threads survive collection
    let mut proj = get_running_project(&sprite_project(serde_json::json!({
        "hat": flag("set"),
        "set": { "opcode": "data_setvariableto", "fields": { "VARIABLE": "s" }, "inputs": { "VALUE": { "block": "join" } }, "next": "loop" },
        "join": { "opcode": "operator_join", "inputs": { "STRING1": { "literal": "kept " }, "STRING2": { "block": "g" } } },
        "g": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },
        "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 50 }, "SUBSTACK": { "block": "noise" } }, "next": "say" },
        "noise": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "block": "len" } } },
        "len": { "opcode": "operator_length", "inputs": { "STRING": { "block": "letter" } } },
        "letter": { "opcode": "operator_join", "inputs": { "STRING1": { "literal": "x" }, "STRING2": { "block": "rand" } } },
        "rand": { "opcode": "operator_random", "inputs": { "FROM": { "literal": 1 }, "TO": { "literal": 1000 } } },
        "say": say(serde_json::json!({ "block": "s" }), None),
        "s": { "opcode": "data_variable", "fields": { "VARIABLE": "s" } },
    })), CompileOptions::default());
    run_till_term(&mut proj);
    assert_said(proj.system(), &["kept 0".into()], 0.0);
    assert!(global_number(&mut proj, "g") >= 100.0);
}

#[test]
fn test_proj_timeout() {
    let compiled = CompiledProject::compile(&sprite_project(serde_json::json!({
        "hat": flag("forever"),
        "forever": { "opcode": "control_forever", "inputs": { "SUBSTACK": { "block": "inc" } } },
        "inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } },
    })), CompileOptions::default()).unwrap();
    let settings = Settings { timeout: Some(Duration::from_millis(50)), ..test_settings() };
    let mut proj = Project::new(&compiled, RecordingSystem::default(), settings).unwrap();
    proj.input(Input::Start).unwrap();
    match proj.run() {
        Err(RunError::Timeout { elapsed }) => assert!(elapsed >= Duration::from_millis(50)),
        x => panic!("{x:?}"),
    }
    assert_eq!(proj.active_threads(), 1);
    assert!(global_number(&mut proj, "g") > 0.0);
}

#[test]
fn test_proj_shared_reporter() {
    // a reporter referenced from two inputs runs once for each of them
    let shared = run_blocks(serde_json::json!({
        "hat": flag("a"),
        "a": say(serde_json::json!({ "block": "rand" }), Some("b")),
        "b": say(serde_json::json!({ "block": "rand" }), None),
        "rand": { "opcode": "operator_random", "inputs": { "FROM": { "literal": 1 }, "TO": { "literal": 1000000000 } } },
    }));
    let separate = run_blocks(serde_json::json!({
        "hat": flag("a"),
        "a": say(serde_json::json!({ "block": "rand1" }), Some("b")),
        "b": say(serde_json::json!({ "block": "rand2" }), None),
        "rand1": { "opcode": "operator_random", "inputs": { "FROM": { "literal": 1 }, "TO": { "literal": 1000000000 } } },
        "rand2": { "opcode": "operator_random", "inputs": { "FROM": { "literal": 1 }, "TO": { "literal": 1000000000 } } },
    }));
    let said = shared.system().said();
    assert_eq!(said, separate.system().said());
    assert_ne!(said[0], said[1]);

    let both = run_blocks(serde_json::json!({
        "hat": flag("a"),
        "a": say(serde_json::json!({ "block": "sub" }), None),
        "sub": { "opcode": "operator_subtract", "inputs": { "NUM1": { "block": "rand" }, "NUM2": { "block": "rand" } } },
        "rand": { "opcode": "operator_random", "inputs": { "FROM": { "literal": 1 }, "TO": { "literal": 1000000000 } } },
    }));
    match &both.system().said()[..] {
        [Value::Number(x)] => assert_eq!(*x, (said[0].to_number() - said[1].to_number())),
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_proj_wait_resumes() {
    let mut proj = get_running_project(&sprite_project(serde_json::json!({
        "hat": flag("wait"),
        "wait": { "opcode": "control_wait", "inputs": { "DURATION": { "literal": 0.05 } }, "next": "done" },
        "done": say(serde_json::json!({ "literal": "done" }), None),
    })), CompileOptions::default());
    let start = std::time::Instant::now();

    assert_eq!(proj.step().unwrap(), ProjectStep::Normal);
    assert_eq!(proj.thread_statuses(), [ThreadStatus::Yielded]);
    assert_said(proj.system(), &[], 0.0);

    let mut ticks = 1;
    while proj.step().unwrap() == ProjectStep::Normal {
        ticks += 1;
        assert!(start.elapsed() < Duration::from_secs(10), "wait never finished");
    }
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(ticks > 2, "{ticks} ticks");
    assert_said(proj.system(), &["done".into()], 0.0);
    assert_eq!(proj.thread_statuses(), [ThreadStatus::Completed]);
}

#[test]
fn test_proj_bad_settings() {
    let compiled = CompiledProject::compile(&sprite_project(serde_json::json!({})), CompileOptions::default()).unwrap();
    for budget_ratio in [-0.5, 1.5, f64::NAN] {
        let settings = Settings { budget_ratio, ..test_settings() };
        match Project::new(&compiled, RecordingSystem::default(), settings) {
            Err(InstantiationError::Settings { .. }) => (),
            x => panic!("{budget_ratio}: {:?}", x.map(|_| ())),
        }
    }
    assert!(Project::new(&compiled, RecordingSystem::default(), Settings { budget_ratio: 1.0, ..test_settings() }).is_ok());
}
