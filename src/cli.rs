//! The command line front end used by the `bw` binary.
//!
//! This submodule is only available with the `cli` feature flag.

use std::fs::File;
use std::io::{self, Read, Write, stdout};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fmt;

use clap::Parser;

use crate::ast;
use crate::assembler::CompiledProject;
use crate::compiler::CompileOptions;
use crate::project::{Project, Input};
use crate::runtime::*;
use crate::std_system::StdSystem;

macro_rules! crash {
    ($ret:literal : $($tt:tt)*) => {{
        eprint!($($tt)*);
        eprint!("\n");
        std::process::exit($ret);
    }}
}

/// Standard project actions that can be performed
#[derive(Parser, Debug)]
#[command(name = "bw", version)]
pub enum Mode {
    /// Compiles a single (json) project file to a wasm module
    Compile {
        /// Path to the (json) project file
        src: PathBuf,

        /// Output path (default: the project path with a `.wasm` extension)
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Emit the `debug.log` and `debug.assert` blocks
        #[clap(long)]
        debug: bool,
    },
    /// Runs a project file or a previously compiled module until all of its scripts finish
    Run {
        /// Path to the (json) project file or (wasm) module
        src: PathBuf,

        /// Frames per second (default 30)
        #[clap(long, conflicts_with = "uncapped")]
        framerate: Option<u32>,

        /// Draw as often as the display allows instead of at a fixed rate
        #[clap(long)]
        uncapped: bool,

        /// Never wait between frames
        #[clap(long)]
        turbo: bool,

        /// Give up after this many seconds
        #[clap(long)]
        timeout: Option<f64>,

        /// Seed for `pick random`
        #[clap(long)]
        seed: Option<u64>,

        /// Also print pen commands and sprite changes
        #[clap(short, long)]
        verbose: bool,

        /// Emit the `debug.log` and `debug.assert` blocks (json input only)
        #[clap(long)]
        debug: bool,
    },
    /// Compiles a project file (or loads a module) and dumps its sections to stdout
    Dump {
        /// Path to the (json) project file or (wasm) module
        src: PathBuf,
    },
    /// Lists every opcode the compiler supports
    Opcodes,
}

#[derive(Debug)]
enum OpenProjectError {
    Io { error: io::Error },
    Parse { error: serde_json::Error },
    Compile { diagnostic: String },
    Load { error: InstantiationError },
}
impl fmt::Display for OpenProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenProjectError::Io { error } => write!(f, "failed to read file: {error}"),
            OpenProjectError::Parse { error } => write!(f, "failed to parse project: {error}"),
            OpenProjectError::Compile { diagnostic } => write!(f, "failed to compile project: {diagnostic}"),
            OpenProjectError::Load { error } => write!(f, "failed to load module: {error:?}"),
        }
    }
}

fn read_file(src: &Path) -> io::Result<Vec<u8>> {
    let mut file = File::open(src)?;
    let mut res = vec![];
    file.read_to_end(&mut res)?;
    Ok(res)
}
fn compile_json(content: &[u8], options: CompileOptions) -> Result<CompiledProject, OpenProjectError> {
    let content = std::str::from_utf8(content).map_err(|e| OpenProjectError::Io { error: io::Error::new(io::ErrorKind::InvalidData, e) })?;
    let project = ast::Project::from_json(content).map_err(|error| OpenProjectError::Parse { error })?;
    CompiledProject::compile(&project, options).map_err(|e| OpenProjectError::Compile { diagnostic: format!("{e:?}") })
}
/// Opens either a json project (compiling it) or a wasm module, deciding by the magic number.
fn open_project(src: &Path, options: CompileOptions) -> Result<CompiledProject, OpenProjectError> {
    let content = read_file(src).map_err(|error| OpenProjectError::Io { error })?;
    if content.starts_with(b"\0asm") {
        CompiledProject::from_wasm(content).map_err(|error| OpenProjectError::Load { error })
    } else {
        compile_json(&content, options)
    }
}

pub fn run(mode: Mode) {
    match mode {
        Mode::Compile { src, output, debug } => {
            let content = read_file(&src).unwrap_or_else(|e| crash!(1: "failed to read file '{}': {e}", src.display()));
            let compiled = compile_json(&content, CompileOptions { debug }).unwrap_or_else(|e| crash!(2: "{e}"));
            let output = output.unwrap_or_else(|| src.with_extension("wasm"));

            if let Err(e) = File::create(&output).and_then(|mut f| f.write_all(&compiled.wasm)) {
                crash!(3: "failed to write '{}': {e}", output.display());
            }
            tracing::info!(output = %output.display(), bytes = compiled.wasm.len(), "wrote module");
        }
        Mode::Run { src, framerate, uncapped, turbo, timeout, seed, verbose, debug } => {
            let compiled = open_project(&src, CompileOptions { debug }).unwrap_or_else(|e| crash!(2: "{e}"));

            let defaults = Settings::default();
            let settings = Settings {
                framerate: match (uncapped, framerate) {
                    (true, _) => Framerate::Uncapped,
                    (false, Some(fps)) => Framerate::Capped(fps),
                    (false, None) => defaults.framerate,
                },
                turbo,
                timeout: timeout.map(Duration::from_secs_f64),
                seed,
                ..defaults
            };

            let mut project = Project::new(&compiled, StdSystem::new(verbose), settings).unwrap_or_else(|e| crash!(4: "failed to instantiate project: {e:?}"));
            if let Err(e) = project.input(Input::Start) {
                crash!(5: "execution error: {e:?}");
            }
            match project.run() {
                Ok(()) => tracing::info!(frames = project.system().frames(), "project finished"),
                Err(RunError::Timeout { elapsed }) => crash!(6: "timed out after {elapsed:?}"),
                Err(RunError::Exec { error }) => crash!(5: "execution error: {error:?}"),
            }
        }
        Mode::Dump { src } => {
            let compiled = open_project(&src, CompileOptions::default()).unwrap_or_else(|e| crash!(2: "{e}"));
            if let Err(e) = compiled.dump(&mut stdout().lock()) {
                crash!(3: "failed to write dump: {e}");
            }
            println!("\ntargets: {:?}", compiled.target_names);
            println!("threads: {}", compiled.threads.len());
            println!("strings: {}", compiled.strings.len());
            println!("total size: {}", compiled.wasm.len());
        }
        Mode::Opcodes => {
            for opcode in ast::Opcode::ALL {
                println!("{:<32} {:?}", opcode.name(), opcode.shape());
            }
        }
    }
}
