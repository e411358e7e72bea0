//! The normalized project model consumed by the compiler.
//!
//! Projects are read from JSON after unpacking and migration have already been done elsewhere.
//! Every map is a [`BTreeMap`] so that anything derived from iterating over the model is deterministic.

use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

/// A constant value written directly into an input slot or a variable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    String(String),
}

/// The contents of a block input slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Input {
    /// The id of a block in the same target.
    Block(String),
    Literal(Literal),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub opcode: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Input>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub top_level: bool,
    /// Extra data carried by procedure prototypes and calls.
    #[serde(default)]
    pub mutation: Option<Mutation>,
}

/// The signature of a custom procedure, as carried by its prototype and by every call to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// The procedure's label, with `%s`, `%n`, and `%b` marking the arguments.
    pub proccode: String,
    /// Ids of the arguments, which are the input names used by calls.
    #[serde(default)]
    pub argumentids: Vec<String>,
    /// Names of the arguments as seen by argument reporters; only present on prototypes.
    #[serde(default)]
    pub argumentnames: Vec<String>,
    /// Run without yielding ("run without screen refresh").
    #[serde(default)]
    pub warp: bool,
}

impl Mutation {
    /// Which arguments are booleans, from the `%b` markers of the proccode (`\%` escapes a marker).
    pub fn boolean_args(&self) -> Vec<bool> {
        let mut res = vec![];
        let mut chars = self.proccode.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => { chars.next(); }
                '%' => match chars.clone().next() {
                    Some(m @ ('s' | 'n' | 'b')) => {
                        chars.next();
                        res.push(m == 'b');
                    }
                    _ => (),
                }
                _ => (),
            }
        }
        res
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub id: String,
    pub name: String,
    pub value: Literal,
}

/// A list declaration and its initial items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub value: Vec<Literal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Costume {
    pub name: String,
}

fn default_direction() -> f64 { 90.0 }
fn default_size() -> f64 { 100.0 }
fn default_visible() -> bool { true }

/// A sprite or the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    #[serde(default)]
    pub is_stage: bool,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub lists: Vec<List>,
    #[serde(default)]
    pub costumes: Vec<Costume>,
    #[serde(default)]
    pub blocks: BTreeMap<String, Block>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default = "default_direction")]
    pub direction: f64,
    #[serde(default = "default_size")]
    pub size: f64,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub current_costume: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub targets: Vec<Target>,
}
impl Project {
    pub fn from_json(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }
}

/// How a block participates in a script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockShape {
    Hat,
    Statement,
    Reporter,
    /// A reporter that only ever appears as the default contents of an input slot.
    Shadow,
    /// The top of a custom procedure body.
    Definition,
}

macro_rules! opcodes {
    ($($variant:ident => $name:literal : $shape:ident),*$(,)?) => {
        /// Every opcode the compiler knows how to translate.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
        pub enum Opcode {
            $($variant),*
        }
        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant),*];

            pub fn name(self) -> &'static str {
                match self { $(Opcode::$variant => $name),* }
            }
            pub fn shape(self) -> BlockShape {
                match self { $(Opcode::$variant => BlockShape::$shape),* }
            }
            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Opcode::$variant),)*
                    _ => None,
                }
            }
        }
    };
}
opcodes! {
    EventWhenFlagClicked => "event_whenflagclicked" : Hat,

    LooksSay => "looks_say" : Statement,
    LooksThink => "looks_think" : Statement,
    LooksShow => "looks_show" : Statement,
    LooksHide => "looks_hide" : Statement,
    LooksSetSizeTo => "looks_setsizeto" : Statement,
    LooksChangeSizeBy => "looks_changesizeby" : Statement,
    LooksSwitchCostumeTo => "looks_switchcostumeto" : Statement,
    LooksNextCostume => "looks_nextcostume" : Statement,
    LooksSize => "looks_size" : Reporter,
    LooksCostumeNumberName => "looks_costumenumbername" : Reporter,

    MotionGoToXY => "motion_gotoxy" : Statement,
    MotionSetX => "motion_setx" : Statement,
    MotionSetY => "motion_sety" : Statement,
    MotionChangeXBy => "motion_changexby" : Statement,
    MotionChangeYBy => "motion_changeyby" : Statement,
    MotionPointInDirection => "motion_pointindirection" : Statement,
    MotionTurnRight => "motion_turnright" : Statement,
    MotionTurnLeft => "motion_turnleft" : Statement,
    MotionXPosition => "motion_xposition" : Reporter,
    MotionYPosition => "motion_yposition" : Reporter,
    MotionDirection => "motion_direction" : Reporter,

    PenClear => "pen_clear" : Statement,
    PenDown => "pen_penDown" : Statement,
    PenUp => "pen_penUp" : Statement,
    PenSetColorParamTo => "pen_setPenColorParamTo" : Statement,
    PenChangeColorParamBy => "pen_changePenColorParamBy" : Statement,
    PenSetSizeTo => "pen_setPenSizeTo" : Statement,
    PenChangeSizeBy => "pen_changePenSizeBy" : Statement,
    PenSetColorToColor => "pen_setPenColorToColor" : Statement,

    DataSetVariableTo => "data_setvariableto" : Statement,
    DataChangeVariableBy => "data_changevariableby" : Statement,
    DataVariable => "data_variable" : Reporter,
    DataAddToList => "data_addtolist" : Statement,
    DataDeleteOfList => "data_deleteoflist" : Statement,
    DataDeleteAllOfList => "data_deletealloflist" : Statement,
    DataInsertAtList => "data_insertatlist" : Statement,
    DataReplaceItemOfList => "data_replaceitemoflist" : Statement,
    DataItemOfList => "data_itemoflist" : Reporter,
    DataLengthOfList => "data_lengthoflist" : Reporter,
    DataListContents => "data_listcontents" : Reporter,

    ProceduresDefinition => "procedures_definition" : Definition,
    ProceduresPrototype => "procedures_prototype" : Shadow,
    ProceduresCall => "procedures_call" : Statement,
    ArgumentReporterStringNumber => "argument_reporter_string_number" : Reporter,
    ArgumentReporterBoolean => "argument_reporter_boolean" : Reporter,

    SensingResetTimer => "sensing_resettimer" : Statement,
    SensingTimer => "sensing_timer" : Reporter,
    SensingDaysSince2000 => "sensing_dayssince2000" : Reporter,

    ControlIf => "control_if" : Statement,
    ControlIfElse => "control_if_else" : Statement,
    ControlRepeat => "control_repeat" : Statement,
    ControlForever => "control_forever" : Statement,
    ControlWait => "control_wait" : Statement,
    ControlWaitUntil => "control_wait_until" : Statement,
    ControlRepeatUntil => "control_repeat_until" : Statement,
    ControlStop => "control_stop" : Statement,

    OperatorAdd => "operator_add" : Reporter,
    OperatorSubtract => "operator_subtract" : Reporter,
    OperatorMultiply => "operator_multiply" : Reporter,
    OperatorDivide => "operator_divide" : Reporter,
    OperatorMod => "operator_mod" : Reporter,
    OperatorRound => "operator_round" : Reporter,
    OperatorMathOp => "operator_mathop" : Reporter,
    OperatorRandom => "operator_random" : Reporter,
    OperatorLt => "operator_lt" : Reporter,
    OperatorGt => "operator_gt" : Reporter,
    OperatorEquals => "operator_equals" : Reporter,
    OperatorAnd => "operator_and" : Reporter,
    OperatorOr => "operator_or" : Reporter,
    OperatorNot => "operator_not" : Reporter,
    OperatorJoin => "operator_join" : Reporter,
    OperatorLetterOf => "operator_letter_of" : Reporter,
    OperatorLength => "operator_length" : Reporter,
    OperatorContains => "operator_contains" : Reporter,

    MathNumber => "math_number" : Shadow,
    MathPositiveNumber => "math_positive_number" : Shadow,
    MathWholeNumber => "math_whole_number" : Shadow,
    MathInteger => "math_integer" : Shadow,
    MathAngle => "math_angle" : Shadow,
    Text => "text" : Shadow,
    LooksCostume => "looks_costume" : Shadow,
    PenMenuColorParam => "pen_menu_colorParam" : Shadow,
    ColourPicker => "colour_picker" : Shadow,
}

/// Heuristic for event blocks the compiler does not support, so they can be told apart from unknown opcodes in general.
pub fn looks_like_hat(opcode: &str) -> bool {
    opcode.starts_with("event_when") || opcode == "control_start_as_clone"
}

#[test]
fn test_opcode_table() {
    for &op in Opcode::ALL {
        assert_eq!(Opcode::parse(op.name()), Some(op));
    }
    assert_eq!(Opcode::parse("pen_penDown"), Some(Opcode::PenDown));
    assert_eq!(Opcode::parse("pen_pendown"), None);
    assert_eq!(Opcode::OperatorAdd.shape(), BlockShape::Reporter);
    assert_eq!(Opcode::EventWhenFlagClicked.shape(), BlockShape::Hat);
    assert!(looks_like_hat("event_whenkeypressed"));
    assert!(!looks_like_hat("looks_say"));
    assert_eq!(Opcode::ProceduresDefinition.shape(), BlockShape::Definition);
}

#[test]
fn test_boolean_args() {
    let mutation = |proccode: &str| Mutation { proccode: proccode.into(), argumentids: vec![], argumentnames: vec![], warp: false };
    assert_eq!(mutation("jump %n times").boolean_args(), [false]);
    assert_eq!(mutation("draw %s if %b then %n").boolean_args(), [false, true, false]);
    assert_eq!(mutation("100\\%s done %b").boolean_args(), [true]);
    assert_eq!(mutation("50% off %").boolean_args(), Vec::<bool>::new());
}

#[test]
fn test_parse_project() {
    let project = Project::from_json(r#"{
        "targets": [{
            "name": "Stage",
            "is_stage": true,
            "variables": [{ "id": "v", "name": "my var", "value": 0 }]
        }, {
            "name": "Sprite1",
            "costumes": [{ "name": "a" }, { "name": "b" }],
            "blocks": {
                "hat": { "opcode": "event_whenflagclicked", "next": "say", "top_level": true },
                "say": { "opcode": "looks_say", "inputs": { "MESSAGE": { "literal": "hello" } } },
                "op": { "opcode": "operator_add", "inputs": { "NUM1": { "block": "n" }, "NUM2": { "literal": 2.5 } } },
                "flag": { "opcode": "data_variable", "fields": { "VARIABLE": "v" }, "inputs": { "X": { "literal": true } } }
            }
        }]
    }"#).unwrap();

    assert_eq!(project.targets.len(), 2);
    let stage = &project.targets[0];
    assert!(stage.is_stage && stage.visible);
    assert_eq!((stage.direction, stage.size), (90.0, 100.0));
    assert_eq!(stage.variables[0].value, Literal::Number(0.0));

    let sprite = &project.targets[1];
    assert!(!sprite.is_stage);
    assert_eq!(sprite.blocks.keys().collect::<Vec<_>>(), ["flag", "hat", "op", "say"]);
    assert_eq!(sprite.blocks["hat"].next.as_deref(), Some("say"));
    assert!(sprite.blocks["hat"].top_level && !sprite.blocks["say"].top_level);
    assert_eq!(sprite.blocks["say"].inputs["MESSAGE"], Input::Literal(Literal::String("hello".into())));
    assert_eq!(sprite.blocks["op"].inputs["NUM1"], Input::Block("n".into()));
    assert_eq!(sprite.blocks["op"].inputs["NUM2"], Input::Literal(Literal::Number(2.5)));
    assert_eq!(sprite.blocks["flag"].inputs["X"], Input::Literal(Literal::Bool(true)));
    assert_eq!(sprite.blocks["flag"].fields["VARIABLE"], "v");
}
