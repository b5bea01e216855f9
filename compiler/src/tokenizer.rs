use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::error::CompileError;

/// Characters that always form a token on their own.
pub const PUNCTUATION: [char; 14] = [
    '<', '>', '/', '"', '.', ',', '\\', ';', '{', '}', '[', ']', '(', ')',
];

lazy_static! {
    // Comments come first in the alternation so `//` and `/*` win over the `/` punctuation.
    pub static ref TOKEN_REGEX: Regex = Regex::new(
        r#"(?s)(//[^\n]*|/\*.*?(?:\*/|\z)|\s+|[<>/".,\\;{}\[\]()]|[^\s<>/".,\\;{}\[\]()]+)"#
    ).unwrap();
    pub static ref SKIPPED_RX: Regex = Regex::new(r"(?s)^(//.*|/\*.*|\s+)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub text:   String,
    pub line:   usize,
    pub column: usize,
}

impl Token {
    pub fn is(&self, text: &str) -> bool {
        self.text == text
    }
}

pub fn is_punctuation(text: &str) -> bool {
    let mut chars = text.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if PUNCTUATION.contains(&c))
}

/// Splits protocol text into tokens, dropping comments and whitespace.
///
/// Every character of the input belongs to some alternative of `TOKEN_REGEX`,
/// so tokenizing itself cannot fail; malformed input is left for the parser.
pub fn tokenize_protocol(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut column = 1;

    for mat in TOKEN_REGEX.find_iter(text) {
        let part = mat.as_str();

        if !SKIPPED_RX.is_match(part) {
            tokens.push(Token {
                text: part.to_string(),
                line,
                column,
            });
        }

        let newline_count = part.matches('\n').count();
        if newline_count > 0 {
            line += newline_count;
            if let Some(last_line_part) = part.split('\n').last() {
                column = last_line_part.chars().count() + 1;
            }
        } else {
            column += part.chars().count();
        }
    }

    tracing::trace!(count = tokens.len(), "tokenized protocol text");
    tokens
}

/// Reads a protocol file and tokenizes it.
pub fn read_tokens(path: &Path) -> Result<Vec<Token>, CompileError> {
    let text = fs::read_to_string(path)?;
    Ok(tokenize_protocol(&text))
}
