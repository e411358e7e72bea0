//! A compiler from block-based sprite projects to WebAssembly modules, and a cooperative scheduler to run them.
//!
//! Projects are parsed into [`ast::Project`], compiled by [`assembler::CompiledProject::compile`],
//! and executed through [`project::Project`], which reports everything observable to a [`runtime::System`].

#![forbid(unsafe_code)]

#[macro_use] extern crate num_derive;
#[macro_use] extern crate educe;

mod meta {
    include!(concat!(env!("OUT_DIR"), "/meta.rs"));
}

pub mod encode;
pub mod sections;
pub mod instruction;
pub mod types;
pub mod util;
pub mod runtime;
pub mod ast;
pub mod compiler;
pub mod assembler;
pub mod host;
pub mod project;
pub mod std_system;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
mod test;
