use lazy_static::lazy_static;
use rayon::prelude::*;
use regex::Regex;

use crate::{
    error::CompileError,
    ids::IdGenerator,
    tokenizer::{is_punctuation, Token},
    types::{Conversation, Local, Node, Protocol, Role, TypeImport},
    utils::{error, quote},
};

lazy_static! {
    static ref IDENTIFIER:        Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    static ref SEMICOLON:         Regex = Regex::new(r"^;$").unwrap();
    static ref COMMA:             Regex = Regex::new(r"^,$").unwrap();
    static ref DOT:               Regex = Regex::new(r"^\.$").unwrap();
    static ref QUOTE:             Regex = Regex::new(r#"^"$"#).unwrap();
    static ref LEFT_ANGLE:        Regex = Regex::new(r"^<$").unwrap();
    static ref RIGHT_ANGLE:       Regex = Regex::new(r"^>$").unwrap();
    static ref LEFT_PAREN:        Regex = Regex::new(r"^\($").unwrap();
    static ref RIGHT_PAREN:       Regex = Regex::new(r"^\)$").unwrap();
    static ref LEFT_BRACE:        Regex = Regex::new(r"^\{$").unwrap();
    static ref MODULE_KEYWORD:    Regex = Regex::new(r"^module$").unwrap();
    static ref TYPE_KEYWORD:      Regex = Regex::new(r"^type$").unwrap();
    static ref LOCAL_KEYWORD:     Regex = Regex::new(r"^local$").unwrap();
    static ref PROTOCOL_KEYWORD:  Regex = Regex::new(r"^protocol$").unwrap();
    static ref AT_KEYWORD:        Regex = Regex::new(r"^at$").unwrap();
    static ref ROLE_KEYWORD:      Regex = Regex::new(r"^role$").unwrap();
    static ref FROM_KEYWORD:      Regex = Regex::new(r"^from$").unwrap();
    static ref TO_KEYWORD:        Regex = Regex::new(r"^to$").unwrap();
    static ref AS_KEYWORD:        Regex = Regex::new(r"^as$").unwrap();
    static ref REC_KEYWORD:       Regex = Regex::new(r"^rec$").unwrap();
    static ref CHOICE_KEYWORD:    Regex = Regex::new(r"^choice$").unwrap();
    static ref PAR_KEYWORD:       Regex = Regex::new(r"^par$").unwrap();
    static ref DO_KEYWORD:        Regex = Regex::new(r"^do$").unwrap();
    static ref CONTINUE_KEYWORD:  Regex = Regex::new(r"^continue$").unwrap();
}

const OPEN: &str = "{";
const CLOSE: &str = "}";
const OR: &str = "or";
const AND: &str = "and";

#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Parse independent sections and branches as rayon tasks.
    pub parallel: bool,
}

/// Top-level runs of the token stream, classified by leading keyword.
#[derive(Debug, Clone, Copy)]
pub enum Section<'a> {
    Module(&'a [Token]),
    Type(&'a [Token]),
    Local(&'a [Token]),
}

struct Cursor<'a> {
    tokens: &'a [Token],
    index:  usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Cursor { tokens, index: 0 }
    }

    fn current(&self) -> Option<&'a Token> {
        self.tokens.get(self.index)
    }

    fn eat(&mut self, test: &Regex) -> bool {
        match self.current() {
            Some(tok) if test.is_match(&tok.text) => {
                self.index += 1;
                true
            }
            _ => false,
        }
    }

    fn expect(&mut self, test: &Regex, expected: &str) -> Result<&'a Token, CompileError> {
        match self.current() {
            Some(tok) if test.is_match(&tok.text) => {
                self.index += 1;
                Ok(tok)
            }
            Some(tok) => Err(error(
                &format!("Expected {} but found {}", expected, quote(&tok.text)),
                tok.line,
                tok.column,
            )),
            None => {
                let (line, column) = end_position(self.tokens);
                Err(error(&format!("Expected {} but found end of input", expected), line, column))
            }
        }
    }

    /// Concatenates tokens up to (not including) the first token matching `stop`.
    fn take_until(&mut self, stop: &Regex) -> String {
        let mut text = String::new();
        while let Some(tok) = self.current() {
            if stop.is_match(&tok.text) {
                break;
            }
            text.push_str(&tok.text);
            self.index += 1;
        }
        text
    }

    fn expect_end(&self) -> Result<(), CompileError> {
        match self.current() {
            None => Ok(()),
            Some(tok) => Err(unexpected_token(tok)),
        }
    }
}

fn unexpected_token(tok: &Token) -> CompileError {
    error(&format!("Unexpected token {}", quote(&tok.text)), tok.line, tok.column)
}

fn end_position(tokens: &[Token]) -> (usize, usize) {
    tokens
        .last()
        .map(|t| (t.line, t.column + t.text.chars().count()))
        .unwrap_or((1, 1))
}

/// Index of the `}` that closes the `{` at `open`.
fn matching_close(tokens: &[Token], open: usize) -> Result<usize, CompileError> {
    let mut depth = 0usize;
    for (offset, tok) in tokens[open..].iter().enumerate() {
        if tok.is(OPEN) {
            depth += 1;
        } else if tok.is(CLOSE) {
            if depth == 0 {
                return Err(unexpected_token(tok));
            }
            depth -= 1;
            if depth == 0 {
                return Ok(open + offset);
            }
        }
    }
    let tok = &tokens[open];
    Err(error("Unbalanced brackets: \"{\" is never closed", tok.line, tok.column))
}

/// Index of the first `;`, rejecting any bracket seen before it.
fn statement_end(tokens: &[Token], start: usize) -> Result<usize, CompileError> {
    for (offset, tok) in tokens[start..].iter().enumerate() {
        if tok.is(";") {
            return Ok(start + offset);
        }
        if tok.is(OPEN) || tok.is(CLOSE) {
            return Err(error(
                &format!("Expected \";\" but found {}", quote(&tok.text)),
                tok.line,
                tok.column,
            ));
        }
    }
    let (line, column) = end_position(tokens);
    Err(error("Expected \";\" but found end of input", line, column))
}

/// Splits the token stream into `module`, `type` and `local` sections.
///
/// `module` and `type` sections end at their `;`. A `local` section ends when
/// the bracket depth returns to zero, since its body nests arbitrarily deep.
pub fn split_sections(tokens: &[Token]) -> Result<Vec<Section<'_>>, CompileError> {
    let mut sections = Vec::new();
    let mut index = 0;

    while index < tokens.len() {
        let tok = &tokens[index];
        if MODULE_KEYWORD.is_match(&tok.text) || TYPE_KEYWORD.is_match(&tok.text) {
            let end = statement_end(tokens, index)?;
            let run = &tokens[index..=end];
            sections.push(if tok.is("module") { Section::Module(run) } else { Section::Type(run) });
            index = end + 1;
        } else if LOCAL_KEYWORD.is_match(&tok.text) {
            let open = tokens[index..]
                .iter()
                .position(|t| t.is(OPEN) || t.is(CLOSE) || t.is(";"))
                .map(|offset| index + offset);
            let open = match open {
                Some(open) if tokens[open].is(OPEN) => open,
                Some(other) => return Err(unexpected_token(&tokens[other])),
                None => {
                    let (line, column) = end_position(tokens);
                    return Err(error("Expected \"{\" but found end of input", line, column));
                }
            };
            let close = matching_close(tokens, open)?;
            sections.push(Section::Local(&tokens[index..=close]));
            index = close + 1;
        } else {
            return Err(unexpected_token(tok));
        }
    }

    tracing::debug!(sections = sections.len(), "split protocol into sections");
    Ok(sections)
}

pub fn parse_protocol(tokens: &[Token]) -> Result<Protocol, CompileError> {
    parse_protocol_with(tokens, &ParseOptions::default())
}

pub fn parse_protocol_with(tokens: &[Token], options: &ParseOptions) -> Result<Protocol, CompileError> {
    let sections = split_sections(tokens)?;

    let mut module = None;
    let mut type_sections = Vec::new();
    let mut local_sections = Vec::new();
    for section in sections {
        match section {
            Section::Module(run) => {
                if module.is_some() {
                    return Err(error("The module is declared twice", run[0].line, run[0].column));
                }
                module = Some(parse_module(run)?);
            }
            Section::Type(run) => type_sections.push(run),
            Section::Local(run) => local_sections.push(run),
        }
    }

    // Sections share no data, so they may be parsed in any order; collect keeps source order.
    let (types, locals) = if options.parallel {
        let types = type_sections
            .par_iter()
            .map(|run| parse_type(run))
            .collect::<Result<Vec<_>, _>>()?;
        let locals = local_sections
            .par_iter()
            .map(|run| parse_local(run, options))
            .collect::<Result<Vec<_>, _>>()?;
        (types, locals)
    } else {
        let types = type_sections
            .iter()
            .map(|run| parse_type(run))
            .collect::<Result<Vec<_>, _>>()?;
        let locals = local_sections
            .iter()
            .map(|run| parse_local(run, options))
            .collect::<Result<Vec<_>, _>>()?;
        (types, locals)
    };

    if locals.is_empty() {
        let (line, column) = end_position(tokens);
        return Err(error("Expected at least one local protocol", line, column));
    }

    tracing::debug!(types = types.len(), locals = locals.len(), "parsed protocol");
    Ok(Protocol { module, types, locals })
}

fn parse_module(tokens: &[Token]) -> Result<String, CompileError> {
    let mut cursor = Cursor::new(tokens);
    cursor.expect(&MODULE_KEYWORD, "\"module\"")?;
    let mut name = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
    while cursor.eat(&DOT) {
        name.push('.');
        name.push_str(&cursor.expect(&IDENTIFIER, "identifier")?.text);
    }
    cursor.expect(&SEMICOLON, "\";\"")?;
    cursor.expect_end()?;
    Ok(name)
}

/// `type <schema> "source" from "file" as Alias;`
fn parse_type(tokens: &[Token]) -> Result<TypeImport, CompileError> {
    let mut cursor = Cursor::new(tokens);
    cursor.expect(&TYPE_KEYWORD, "\"type\"")?;

    cursor.expect(&LEFT_ANGLE, "\"<\"")?;
    let schema = cursor.take_until(&RIGHT_ANGLE);
    if schema.is_empty() {
        let tok = cursor.expect(&IDENTIFIER, "schema name")?;
        return Err(unexpected_token(tok));
    }
    cursor.expect(&RIGHT_ANGLE, "\">\"")?;

    cursor.expect(&QUOTE, "'\"'")?;
    let source = cursor.take_until(&QUOTE);
    cursor.expect(&QUOTE, "'\"'")?;

    cursor.expect(&FROM_KEYWORD, "\"from\"")?;
    cursor.expect(&QUOTE, "'\"'")?;
    let file_name = cursor.take_until(&QUOTE);
    cursor.expect(&QUOTE, "'\"'")?;

    let alias = if cursor.eat(&AS_KEYWORD) {
        Some(cursor.expect(&IDENTIFIER, "identifier")?.text.clone())
    } else {
        None
    };
    cursor.expect(&SEMICOLON, "\";\"")?;
    cursor.expect_end()?;

    Ok(TypeImport { schema, source, file_name, alias })
}

struct LocalContext<'a> {
    ids:         &'a IdGenerator,
    protagonist: &'a str,
    parallel:    bool,
}

/// `local protocol Name at Role (role A, role B, ...) { conversation }`
fn parse_local(tokens: &[Token], options: &ParseOptions) -> Result<Local, CompileError> {
    let mut cursor = Cursor::new(tokens);
    cursor.expect(&LOCAL_KEYWORD, "\"local\"")?;
    cursor.expect(&PROTOCOL_KEYWORD, "\"protocol\"")?;
    let name = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
    cursor.expect(&AT_KEYWORD, "\"at\"")?;
    let protagonist = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();

    cursor.expect(&LEFT_PAREN, "\"(\"")?;
    let mut roles = Vec::new();
    if !cursor.eat(&RIGHT_PAREN) {
        loop {
            cursor.expect(&ROLE_KEYWORD, "\"role\"")?;
            let role = cursor.expect(&IDENTIFIER, "identifier")?;
            roles.push(Role { name: role.text.clone() });
            if cursor.eat(&RIGHT_PAREN) {
                break;
            }
            cursor.expect(&COMMA, "\",\"")?;
        }
    }

    let open = cursor.index;
    cursor.expect(&LEFT_BRACE, "\"{\"")?;
    let close = matching_close(tokens, open)?;
    if close + 1 != tokens.len() {
        return Err(unexpected_token(&tokens[close + 1]));
    }

    tracing::debug!(local = %name, protagonist = %protagonist, "parsing local protocol");
    let ids = IdGenerator::new(&name);
    let ctx = LocalContext {
        ids:         &ids,
        protagonist: &protagonist,
        parallel:    options.parallel,
    };
    let mut conversation = parse_conversation(&tokens[open + 1..close], &ctx)?;
    if options.parallel {
        renumber(&mut conversation, &mut 0);
    }
    tracing::debug!(local = %name, ids = ids.issued(), "parsed local protocol");

    Ok(Local { name, protagonist, roles, conversation })
}

/// Splits a conversation body into the token runs of its steps.
///
/// `rec`, `choice` and `par` steps extend over their bracket-balanced blocks,
/// including any further `or`/`and` blocks at depth zero; every other step
/// ends at its `;`.
fn split_steps(tokens: &[Token]) -> Result<Vec<&[Token]>, CompileError> {
    let mut steps = Vec::new();
    let mut index = 0;

    while index < tokens.len() {
        let tok = &tokens[index];
        let separator = if REC_KEYWORD.is_match(&tok.text) {
            Some(None)
        } else if CHOICE_KEYWORD.is_match(&tok.text) {
            Some(Some(OR))
        } else if PAR_KEYWORD.is_match(&tok.text) {
            Some(Some(AND))
        } else {
            None
        };

        let end = match separator {
            Some(separator) => block_step_end(tokens, index, separator)?,
            None => {
                if tok.is(OPEN) || tok.is(CLOSE) {
                    return Err(unexpected_token(tok));
                }
                statement_end(tokens, index)?
            }
        };
        steps.push(&tokens[index..=end]);
        index = end + 1;
    }
    Ok(steps)
}

fn block_step_end(tokens: &[Token], start: usize, separator: Option<&str>) -> Result<usize, CompileError> {
    let header = &tokens[start];
    let open = tokens[start..]
        .iter()
        .position(|t| t.is(OPEN) || t.is(CLOSE) || t.is(";"))
        .map(|offset| start + offset);
    let mut open = match open {
        Some(open) if tokens[open].is(OPEN) => open,
        Some(other) => {
            return Err(error(
                &format!("Expected \"{{\" after {} but found {}", quote(&header.text), quote(&tokens[other].text)),
                tokens[other].line,
                tokens[other].column,
            ))
        }
        None => {
            let (line, column) = end_position(tokens);
            return Err(error("Expected \"{\" but found end of input", line, column));
        }
    };

    loop {
        let close = matching_close(tokens, open)?;
        match (separator, tokens.get(close + 1)) {
            (Some(sep), Some(next)) if next.is(sep) => match tokens.get(close + 2) {
                Some(brace) if brace.is(OPEN) => open = close + 2,
                Some(other) => return Err(unexpected_token(other)),
                None => {
                    let (line, column) = end_position(tokens);
                    return Err(error(
                        &format!("Expected \"{{\" after {} but found end of input", quote(sep)),
                        line,
                        column,
                    ));
                }
            },
            _ => return Ok(close),
        }
    }
}

/// Inner token runs of `{ .. } sep { .. } sep ...`, without the braces.
fn split_branches<'a>(tokens: &'a [Token], separator: &str) -> Result<Vec<&'a [Token]>, CompileError> {
    let mut branches = Vec::new();
    let mut index = 0;
    loop {
        match tokens.get(index) {
            Some(tok) if tok.is(OPEN) => {}
            Some(tok) => return Err(unexpected_token(tok)),
            None => {
                let (line, column) = end_position(tokens);
                return Err(error("Expected \"{\" but found end of input", line, column));
            }
        }
        let close = matching_close(tokens, index)?;
        branches.push(&tokens[index + 1..close]);
        index = close + 1;
        match tokens.get(index) {
            None => return Ok(branches),
            Some(tok) if tok.is(separator) => index += 1,
            Some(tok) => return Err(unexpected_token(tok)),
        }
    }
}

/// Branch blocks of a `choice`/`par`, accepting both `{ A } or { B }` and the
/// wrapped `{ { A } or { B } }` form.
fn branch_blocks<'a>(tokens: &'a [Token], separator: &str) -> Result<Vec<&'a [Token]>, CompileError> {
    let branches = split_branches(tokens, separator)?;
    if branches.len() == 1 && branches[0].first().map_or(false, |t| t.is(OPEN)) {
        return split_branches(branches[0], separator);
    }
    Ok(branches)
}

fn parse_conversation(tokens: &[Token], ctx: &LocalContext<'_>) -> Result<Conversation, CompileError> {
    let nodes = split_steps(tokens)?
        .into_iter()
        .map(|step| parse_step(step, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Conversation { nodes })
}

/// Reassigns sequence numbers in pre-order once branch tasks have joined, so
/// ids come out the same as in a sequential parse.
fn renumber(conversation: &mut Conversation, next: &mut u32) {
    for node in &mut conversation.nodes {
        if let Some(id) = node.id_mut() {
            id.seq = *next;
            *next += 1;
        }
        match node {
            Node::Choice { branches, .. } | Node::Par { branches, .. } => {
                for branch in branches {
                    renumber(branch, next);
                }
            }
            Node::Rec { body, .. } => renumber(body, next),
            Node::Message { .. } | Node::Do { .. } | Node::Continue { .. } => {}
        }
    }
}

fn parse_branches(blocks: &[&[Token]], ctx: &LocalContext<'_>) -> Result<Vec<Conversation>, CompileError> {
    if ctx.parallel {
        blocks
            .par_iter()
            .map(|block| parse_conversation(block, ctx))
            .collect()
    } else {
        blocks.iter().map(|block| parse_conversation(block, ctx)).collect()
    }
}

fn parse_step(tokens: &[Token], ctx: &LocalContext<'_>) -> Result<Node, CompileError> {
    let mut cursor = Cursor::new(tokens);

    if cursor.eat(&REC_KEYWORD) {
        let label = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
        let id = ctx.ids.next_id(&label);
        let open = cursor.index;
        cursor.expect(&LEFT_BRACE, "\"{\"")?;
        let close = matching_close(tokens, open)?;
        if let Some(extra) = tokens.get(close + 1) {
            return Err(unexpected_token(extra));
        }
        let body = parse_conversation(&tokens[open + 1..close], ctx)?;
        return Ok(Node::Rec { id, label, body });
    }

    if cursor.eat(&CHOICE_KEYWORD) {
        cursor.expect(&AT_KEYWORD, "\"at\"")?;
        let chooser = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
        let id = ctx.ids.next_id("choice");
        let blocks = branch_blocks(&tokens[cursor.index..], OR)?;
        let branches = parse_branches(&blocks, ctx)?;
        return Ok(Node::Choice { id, chooser, branches });
    }

    if cursor.eat(&PAR_KEYWORD) {
        let id = ctx.ids.next_id("par");
        let blocks = branch_blocks(&tokens[cursor.index..], AND)?;
        let branches = parse_branches(&blocks, ctx)?;
        return Ok(Node::Par { id, branches });
    }

    if cursor.eat(&CONTINUE_KEYWORD) {
        let label = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
        cursor.expect(&SEMICOLON, "\";\"")?;
        cursor.expect_end()?;
        let id = ctx.ids.next_id(&label);
        return Ok(Node::Continue { id, label });
    }

    if cursor.eat(&DO_KEYWORD) {
        let name = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
        cursor.expect(&LEFT_PAREN, "\"(\"")?;
        let mut roles = Vec::new();
        if !cursor.eat(&RIGHT_PAREN) {
            loop {
                cursor.eat(&ROLE_KEYWORD);
                roles.push(cursor.expect(&IDENTIFIER, "identifier")?.text.clone());
                if cursor.eat(&RIGHT_PAREN) {
                    break;
                }
                cursor.expect(&COMMA, "\",\"")?;
            }
        }
        cursor.expect(&SEMICOLON, "\";\"")?;
        cursor.expect_end()?;
        return Ok(Node::Do { name, roles });
    }

    parse_message(cursor, ctx)
}

/// `name(T1, T2) from Role;` or `name(T1, T2) to Role;`
fn parse_message(mut cursor: Cursor<'_>, ctx: &LocalContext<'_>) -> Result<Node, CompileError> {
    let name = cursor.expect(&IDENTIFIER, "message name")?.text.clone();
    cursor.expect(&LEFT_PAREN, "\"(\"")?;

    let mut payloads = Vec::new();
    if !cursor.eat(&RIGHT_PAREN) {
        loop {
            let position = cursor.current().map(|t| (t.line, t.column));
            let payload = take_payload(&mut cursor)?;
            if payload.is_empty() {
                let (line, column) = position.unwrap_or_else(|| end_position(cursor.tokens));
                return Err(error(&format!("Missing payload type in message {}", quote(&name)), line, column));
            }
            payloads.push(payload);
            if cursor.eat(&RIGHT_PAREN) {
                break;
            }
            cursor.expect(&COMMA, "\",\" or \")\"")?;
        }
    }

    let (from, to) = if cursor.eat(&FROM_KEYWORD) {
        let role = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
        (role, ctx.protagonist.to_string())
    } else if cursor.eat(&TO_KEYWORD) {
        let role = cursor.expect(&IDENTIFIER, "identifier")?.text.clone();
        (ctx.protagonist.to_string(), role)
    } else {
        return Err(match cursor.current() {
            Some(tok) => error(
                &format!("Expected \"from\" or \"to\" but found {}", quote(&tok.text)),
                tok.line,
                tok.column,
            ),
            None => {
                let (line, column) = end_position(cursor.tokens);
                error("Expected \"from\" or \"to\" but found end of input", line, column)
            }
        });
    };
    cursor.expect(&SEMICOLON, "\";\"")?;
    cursor.expect_end()?;

    let id = ctx.ids.next_id(&name);
    Ok(Node::Message { id, name, from, to, payloads })
}

/// One payload type: every token up to the next `,` or `)` at angle depth zero,
/// so `Map<string, int>` stays a single type.
fn take_payload(cursor: &mut Cursor<'_>) -> Result<String, CompileError> {
    let mut text = String::new();
    let mut depth = 0usize;
    while let Some(tok) = cursor.current() {
        if depth == 0 && (tok.is(",") || tok.is(")")) {
            break;
        }
        if tok.is("<") {
            depth += 1;
        } else if tok.is(">") {
            depth = depth.saturating_sub(1);
        } else if tok.is(";") || (is_punctuation(&tok.text) && !tok.is(".") && !tok.is(",")) {
            return Err(unexpected_token(tok));
        }
        text.push_str(&tok.text);
        cursor.index += 1;
    }
    Ok(text)
}
