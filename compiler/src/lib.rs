//! scrivener-compiler
//!
//! This crate implements:
//!  1) A tokenizer + parser for local Scribble protocols,
//!  2) A verifier (declared roles, known payload types, no self-messages),
//!  3) The projector, which names every state and resolves where each step leads,
//!  4) Code generation (`compile_protocol_to_rust` → `String`),
//!  5) Error types (`CompileError`).

pub mod error;
pub mod types;
pub mod utils;
pub mod tokenizer;
pub mod ids;
pub mod parser;
pub mod verifier;
pub mod projector;
pub mod compiler;
pub mod gen_rust;

pub use compiler::{compile_files, compile_protocol, write_module, CompileOptions};
pub use gen_rust::{compile_combined_to_rust, compile_protocol_to_rust, GenOptions};
pub use parser::{parse_protocol, parse_protocol_with, ParseOptions};
pub use projector::{project_local, project_protocol, Projection, Target};
pub use tokenizer::tokenize_protocol;
pub use verifier::verify_protocol;
