use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error at line {line}, column {column}: {msg}")]
    ParseError {
        msg:    String,
        line:   usize,
        column: usize,
    },

    #[error("Structural error: {0}")]
    StructuralError(String),

    #[error("Linkage error: {0}")]
    LinkageError(String),

    #[error("Verifier error: {0}")]
    VerifierError(String),

    #[error("Code generation error: {0}")]
    CodegenError(String),
}
