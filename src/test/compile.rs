use crate::assembler::*;
use crate::compiler::CompileOptions;
use wasmparser::{Parser, Payload};

use super::*;

fn counting_blocks() -> serde_json::Value {
    serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "loop", "top_level": true },
        "loop": { "opcode": "control_repeat", "inputs": { "TIMES": { "literal": 4 }, "SUBSTACK": { "block": "inc" } }, "next": "say" },
        "inc": { "opcode": "data_changevariableby", "fields": { "VARIABLE": "g" }, "inputs": { "VALUE": { "literal": 1 } } },
        "say": { "opcode": "looks_say", "inputs": { "MESSAGE": { "block": "join" } } },
        "join": { "opcode": "operator_join", "inputs": { "STRING1": { "literal": "count: " }, "STRING2": { "block": "var" } } },
        "var": { "opcode": "data_variable", "fields": { "VARIABLE": "g" } },
    })
}

#[test]
fn test_compile_idempotent() {
    let project = sprite_project(counting_blocks());
    let a = CompiledProject::compile(&project, CompileOptions::default()).unwrap();
    let b = CompiledProject::compile(&project, CompileOptions::default()).unwrap();
    assert_eq!(a.wasm, b.wasm);
    assert_eq!(a, b);

    let debug = CompiledProject::compile(&project, CompileOptions { debug: true }).unwrap();
    assert_ne!(a.wasm, debug.wasm);
}

#[test]
fn test_compile_validates() {
    for blocks in [counting_blocks(), serde_json::json!({})] {
        let compiled = CompiledProject::compile(&sprite_project(blocks), CompileOptions::default()).unwrap();
        assert!(compiled.wasm.starts_with(b"\0asm\x01\0\0\0"));
        compiled.validate().unwrap();
    }
}

#[test]
fn test_compile_metadata() {
    let compiled = CompiledProject::compile(&sprite_project(counting_blocks()), CompileOptions::default()).unwrap();
    assert_eq!(compiled.target_names, ["Stage", "Sprite1"]);
    assert_eq!(compiled.threads, [1]);
    assert_eq!(&compiled.strings[..2], ["false", "true"]);
    assert!(compiled.strings.iter().any(|x| x == "count: "));

    let mut custom = vec![];
    for payload in Parser::new(0).parse_all(&compiled.wasm) {
        if let Payload::CustomSection(section) = payload.unwrap() {
            custom.push(section.name().to_owned());
        }
    }
    assert_eq!(custom, [custom_sections::STRINGS, custom_sections::TARGETS, custom_sections::THREADS, custom_sections::LISTS, custom_sections::FINGERPRINT]);
    wasmparser::validate(&compiled.wasm).unwrap();

    let recovered = CompiledProject::from_wasm(compiled.wasm.clone()).unwrap();
    assert_eq!(recovered, compiled);
}

#[test]
fn test_from_wasm_errors() {
    match CompiledProject::from_wasm(b"not a module".to_vec()) {
        Err(InstantiationError::BadModule { .. }) => (),
        x => panic!("{x:?}"),
    }

    match CompiledProject::from_wasm(wasm_encoder::Module::new().finish()) {
        Err(InstantiationError::MissingSection { name }) => assert_eq!(name, custom_sections::STRINGS),
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_layout_offsets() {
    let compiled = CompiledProject::compile(&sprite_project(counting_blocks()), CompileOptions::default()).unwrap();
    let mut proj = Project::new(&compiled, RecordingSystem::default(), test_settings()).unwrap();

    let stage = proj.target(0).unwrap();
    assert_eq!((stage.x, stage.y, stage.direction, stage.size), (0.0, 0.0, 90.0, 100.0));
    assert!(proj.target(1).unwrap().visible);
    assert_eq!(proj.target(2), None);

    assert_eq!(proj.global_variable("g").and_then(|x| x.f64()), Some(0.0));
    assert!(proj.global_variable("s").and_then(|x| x.i32()).is_some());
    assert!(proj.global_variable("missing").is_none());
    assert_eq!(proj.active_threads(), 0);
    assert_eq!(proj.thread_statuses(), [ThreadStatus::Idle]);
}

#[test]
fn test_dump() {
    let compiled = CompiledProject::compile(&sprite_project(counting_blocks()), CompileOptions::default()).unwrap();
    let mut out = vec![];
    compiled.dump(&mut out).unwrap();
    let out = String::from_utf8(out).unwrap();

    let mut lines = out.lines();
    assert_eq!(lines.next(), Some(format!("{} bytes, 13 sections", compiled.wasm.len()).as_str()));
    assert!(out.contains("Code"));
    assert!(out.contains(r#"Custom "blockwasm.strings""#));
    assert!(out.contains("00000000    00 61 73 6d 01 00 00 00"));
    assert!(out.contains("00000008   Type"));
    assert!(out.contains(r#"Custom "blockwasm.lists""#));
}

#[test]
fn test_compile_error_borrows() {
    let project = sprite_project(serde_json::json!({
        "hat": { "opcode": "event_whenflagclicked", "next": "x", "top_level": true },
        "x": { "opcode": "motion_glideto" },
    }));
    match CompiledProject::compile(&project, CompileOptions::default()) {
        Err(crate::compiler::CompileError::UnknownOpcode { block, opcode }) => assert_eq!((block, opcode), ("x", "motion_glideto")),
        x => panic!("{x:?}"),
    }
}

#[test]
fn test_compile_lists_and_procedures() {
    let project: crate::ast::Project = serde_json::from_value(serde_json::json!({
        "targets": [{
            "name": "Stage", "is_stage": true,
            "lists": [{ "id": "l", "name": "things", "value": [1, 2.5, -0.0, "a", true] }],
        }, {
            "name": "Sprite1",
            "blocks": {
                "hat": { "opcode": "event_whenflagclicked", "next": "call", "top_level": true },
                "call": { "opcode": "procedures_call", "inputs": { "x": { "literal": 4 } }, "mutation": { "proccode": "push %s", "argumentids": ["x"] } },
                "def": { "opcode": "procedures_definition", "next": "add", "top_level": true, "inputs": { "custom_block": { "block": "proto" } } },
                "proto": { "opcode": "procedures_prototype", "mutation": { "proccode": "push %s", "argumentids": ["x"], "argumentnames": ["item"], "warp": true } },
                "add": { "opcode": "data_addtolist", "fields": { "LIST": "l" }, "inputs": { "ITEM": { "block": "arg" } } },
                "arg": { "opcode": "argument_reporter_string_number", "fields": { "VALUE": "item" } },
            },
        }],
    })).unwrap();
    let compiled = CompiledProject::compile(&project, CompileOptions::default()).unwrap();
    compiled.validate().unwrap();
    wasmparser::validate(&compiled.wasm).unwrap();
    assert_eq!(compiled.threads, [1]);
    assert_eq!(compiled.lists.len(), 1);

    let recovered = CompiledProject::from_wasm(compiled.wasm.clone()).unwrap();
    assert_eq!(recovered.lists, compiled.lists);
    assert!(matches!(recovered.lists[0].items[2], Value::Number(x) if x == 0.0 && x.is_sign_negative()));

    // the procedure function sits between the scripts and the entry points
    let mut functions = 0;
    for payload in Parser::new(0).parse_all(&compiled.wasm) {
        if let Payload::FunctionSection(section) = payload.unwrap() {
            functions = section.count();
        }
    }
    assert_eq!(functions, Helper::ALL.len() as u32 + 2 + 1 + 1 + 2);
}
