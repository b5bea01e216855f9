use std::fs;
use std::path::{Path, PathBuf};

use crate::{
    error::CompileError,
    gen_rust::{compile_combined_to_rust, compile_protocol_to_rust, GenOptions},
    parser::{parse_protocol_with, ParseOptions},
    projector::{project_protocol, Projection},
    tokenizer::tokenize_protocol,
    types::Protocol,
    verifier::verify_protocol,
};

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub parse: ParseOptions,
    pub gen:   GenOptions,
}

/// Compile protocol text into its tree and one projection per Local.
/// Returns `Err(CompileError)` if tokenization/parsing/verification/projection fails.
pub fn compile_protocol(text: &str, options: &ParseOptions) -> Result<(Protocol, Vec<Projection>), CompileError> {
    let tokens = tokenize_protocol(text);
    let protocol = parse_protocol_with(&tokens, options)?;
    verify_protocol(&protocol)?;
    let projections = project_protocol(&protocol)?;
    tracing::info!(
        module = protocol.module.as_deref().unwrap_or("-"),
        locals = projections.len(),
        "compiled protocol"
    );
    Ok((protocol, projections))
}

/// Compile protocol files into Rust source.
///
/// A single Local becomes a standalone module; anything more is combined into
/// one module with a submodule per role. Nothing is written here, so a failure
/// in any file leaves no partial output behind.
pub fn compile_files(paths: &[PathBuf], options: &CompileOptions) -> Result<String, CompileError> {
    if paths.is_empty() {
        return Err(CompileError::CodegenError("No protocol files given".to_string()));
    }

    let mut projections = Vec::new();
    for path in paths {
        let text = fs::read_to_string(path)?;
        let (_, mut found) = compile_protocol(&text, &options.parse)?;
        tracing::debug!(path = %path.display(), locals = found.len(), "read protocol file");
        projections.append(&mut found);
    }

    match projections.as_slice() {
        [single] => compile_protocol_to_rust(single, &options.gen),
        all => compile_combined_to_rust(all, &options.gen),
    }
}

/// Writes `source` to `<dir>/<module>/mod.rs`, creating directories as needed.
pub fn write_module(dir: &Path, module: &str, source: &str) -> Result<PathBuf, CompileError> {
    let module_dir = dir.join(module);
    fs::create_dir_all(&module_dir)?;
    let path = module_dir.join("mod.rs");
    fs::write(&path, source)?;
    tracing::info!(path = %path.display(), "wrote generated module");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_protocol_runs_every_stage() {
        let (protocol, projections) = compile_protocol(
            "local protocol P at A (role A, role B) { a(int) to B; }",
            &ParseOptions::default(),
        )
        .unwrap();
        assert_eq!(protocol.locals.len(), 1);
        assert_eq!(projections[0].messages.len(), 1);
    }

    #[test]
    fn test_compile_protocol_stops_at_verifier() {
        let err = compile_protocol(
            "local protocol P at A (role A, role B) { a(Unknown) to B; }",
            &ParseOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::VerifierError(_)), "{:?}", err);
    }

    #[test]
    fn test_compile_files_requires_input() {
        let err = compile_files(&[], &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::CodegenError(_)), "{:?}", err);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = compile_files(
            &[PathBuf::from("definitely/not/here.scr")],
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::Io(_)), "{:?}", err);
    }

    #[test]
    fn test_write_module() {
        let dir = std::env::temp_dir().join(format!("scrivener-write-{}", std::process::id()));
        let path = write_module(&dir, "protocol", "// generated\n").unwrap();
        assert_eq!(path, dir.join("protocol").join("mod.rs"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "// generated\n");
        fs::remove_dir_all(&dir).unwrap();
    }
}
