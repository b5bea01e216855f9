//! scrivener
//!
//! One dependency for both halves of the toolchain:
//!
//! - the compiler pipeline (re-exported from `scrivener-compiler`),
//! - the session runtime that generated code links against (`scrivener-runtime`),
//! - helpers for dumping protocol trees and projections as JSON.

use serde::Serialize;

pub use scrivener_compiler::error::CompileError;
pub use scrivener_compiler::{
    compile_files, compile_protocol, compile_protocol_to_rust, write_module, CompileOptions, GenOptions,
    ParseOptions, Projection,
};
pub use scrivener_runtime::{BranchDone, Endpoint, Finished, JoinBarrier, Joiner, Mesh, Session, SessionError};

fn to_json<T: Serialize>(value: &T) -> Result<String, CompileError> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// Parse protocol text into a pretty‐printed JSON tree.
pub fn protocol_to_json(text: &str) -> Result<String, CompileError> {
    let (protocol, _) = compile_protocol(text, &ParseOptions::default())?;
    to_json(&protocol)
}

/// Project every Local of protocol text and pretty‐print the projections as JSON.
pub fn projection_to_json(text: &str) -> Result<String, CompileError> {
    let (_, projections) = compile_protocol(text, &ParseOptions::default())?;
    to_json(&projections)
}

pub mod error {
    pub use scrivener_compiler::error::CompileError;
    pub use scrivener_runtime::SessionError;
}

pub mod runtime {
    pub use scrivener_runtime::*;
}
