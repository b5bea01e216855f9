use std::collections::HashSet;

use crate::{
    error::CompileError,
    projector::{ChoiceRecord, ChoiceRole, Direction, MessageRecord, ParRecord, Projection, RecRecord, Target},
    types::TypeImport,
    utils::{quote, to_pascal_case, to_snake_case},
};

#[derive(Debug, Clone)]
pub struct GenOptions {
    /// Name of the generated module. Only used in the file header unless `inline` is set.
    pub module_name: String,
    /// Wrap the output in `pub mod <module_name> { .. }` so it can be pulled in
    /// with `include!`, which rejects inner attributes.
    pub inline:      bool,
}

impl Default for GenOptions {
    fn default() -> Self {
        GenOptions {
            module_name: "protocol".to_string(),
            inline:      false,
        }
    }
}

const RUNTIME_IMPORTS: &str =
    "use scrivener_runtime::{BranchDone, Endpoint, Finished, Joiner, Session, SessionError};";

/// Maps protocol payload types to Rust types.
/// Declared aliases are emitted as `pub type` items, so they map to themselves.
fn map_type(type_name: &str) -> String {
    match type_name {
        "bool"   => "bool".to_string(),
        "byte"   => "u8".to_string(),
        "int"    => "i32".to_string(),
        "uint"   => "u32".to_string(),
        "int64"  => "i64".to_string(),
        "uint64" => "u64".to_string(),
        "float"  => "f32".to_string(),
        "double" => "f64".to_string(),
        "string" => "String".to_string(),
        other    => other.to_string(),
    }
}

/// Escapes Rust reserved keywords by suffixing with an underscore.
fn escape_rust_keyword(s: &str) -> String {
    let keywords = [
        "as", "break", "const", "continue", "crate", "else",
        "enum", "extern", "false", "fn", "for", "if", "impl",
        "in", "let", "loop", "match", "mod", "move", "mut",
        "pub", "ref", "return", "self", "Self", "static",
        "struct", "super", "trait", "true", "type", "unsafe",
        "use", "where", "while", "async", "await", "dyn",
    ];
    if keywords.contains(&s) {
        format!("{}_", s)
    } else {
        s.to_string()
    }
}

fn indent(code: &str) -> String {
    code.lines()
        .map(|line| if line.is_empty() { String::new() } else { format!("    {}", line) })
        .collect::<Vec<_>>()
        .join("\n")
}

fn comma_list(items: &[String]) -> String {
    items.join(", ")
}

/// One variant of the generated `Msg` enum.
#[derive(Debug, Clone)]
struct Variant {
    label:    String,
    payloads: Vec<String>,
    name:     String,
}

/// Every message label used by a set of projections, with collision-free variant names.
#[derive(Debug, Default)]
struct MsgEnum {
    variants: Vec<Variant>,
}

impl MsgEnum {
    fn collect(projections: &[Projection]) -> Result<Self, CompileError> {
        let mut seen: Vec<(String, Vec<String>)> = Vec::new();
        for message in projections.iter().flat_map(|p| &p.messages) {
            let key = (message.name.clone(), message.payloads.clone());
            if !seen.contains(&key) {
                seen.push(key);
            }
        }

        let mut variants: Vec<Variant> = Vec::with_capacity(seen.len());
        for (label, payloads) in &seen {
            let overloaded = seen.iter().filter(|(other, _)| other == label).count() > 1;
            let mut name = to_pascal_case(label);
            if overloaded {
                if payloads.is_empty() {
                    name.push_str("Empty");
                }
                for payload in payloads {
                    name.push_str(&to_pascal_case(payload));
                }
            }
            if let Some(clash) = variants.iter().find(|v| v.name == name) {
                return Err(CompileError::CodegenError(format!(
                    "The messages {} and {} both map to Msg::{}",
                    quote(&clash.label),
                    quote(label),
                    name
                )));
            }
            variants.push(Variant {
                label:    label.clone(),
                payloads: payloads.clone(),
                name,
            });
        }
        Ok(MsgEnum { variants })
    }

    fn variant(&self, message: &MessageRecord) -> Result<&Variant, CompileError> {
        self.variants
            .iter()
            .find(|v| v.label == message.name && v.payloads == message.payloads)
            .ok_or_else(|| {
                CompileError::CodegenError(format!("The message {} has no Msg variant", quote(&message.name)))
            })
    }

    fn render(&self) -> String {
        let mut code = Vec::new();
        code.push("/// Every message exchanged in this protocol.".to_string());
        code.push("#[derive(Debug, Clone, PartialEq)]".to_string());
        code.push("pub enum Msg {".to_string());
        for variant in &self.variants {
            if variant.payloads.is_empty() {
                code.push(format!("    {},", variant.name));
            } else {
                let types: Vec<String> = variant.payloads.iter().map(|p| map_type(p)).collect();
                code.push(format!("    {}({}),", variant.name, comma_list(&types)));
            }
        }
        code.push("}".to_string());
        code.push("".to_string());
        code.push("impl Msg {".to_string());
        code.push("    pub fn label(&self) -> &'static str {".to_string());
        code.push("        match *self {".to_string());
        for variant in &self.variants {
            let pattern = if variant.payloads.is_empty() {
                format!("Msg::{}", variant.name)
            } else {
                format!("Msg::{}(..)", variant.name)
            };
            code.push(format!("            {} => {},", pattern, quote(&variant.label)));
        }
        code.push("        }".to_string());
        code.push("    }".to_string());
        code.push("}".to_string());
        code.join("\n")
    }
}

fn render_aliases(types: &[&TypeImport]) -> String {
    let mut seen = HashSet::new();
    let mut code = Vec::new();
    for import in types {
        if let Some(alias) = &import.alias {
            if !seen.insert(alias.clone()) {
                continue;
            }
            code.push(format!(
                "/// `{}` type `{}` from `{}`, carried in its serialized form.",
                import.schema, import.source, import.file_name
            ));
            code.push(format!("pub type {} = String;", alias));
        }
    }
    code.join("\n")
}

/// Renders the states and operations of one projection.
struct RoleWriter<'a> {
    projection: &'a Projection,
    msg:        &'a MsgEnum,
    code:       Vec<String>,
}

impl<'a> RoleWriter<'a> {
    fn new(projection: &'a Projection, msg: &'a MsgEnum) -> Self {
        RoleWriter { projection, msg, code: Vec::new() }
    }

    /// Type reached through `target` and the expression that builds it from `session`.
    fn transition(&self, target: &Target, session: &str) -> Result<(String, String), CompileError> {
        match target {
            Target::Step { state, .. } | Target::Loop { state, .. } => {
                Ok((state.clone(), format!("{}({})", state, session)))
            }
            Target::Join { .. } => Ok(("BranchDone".to_string(), format!("{}.complete_branch()?", session))),
            Target::End => Ok(("Finished<Msg>".to_string(), format!("{}.finish()?", session))),
            Target::RecEnd { rec, label } => {
                let record = self.projection.rec(rec).ok_or_else(|| {
                    CompileError::CodegenError(format!("The rec {} has no record", quote(label)))
                })?;
                self.transition(&record.next, session)
            }
        }
    }

    fn state_struct(&mut self, state: &str, doc: &str) {
        self.code.push(format!("/// {}", doc));
        self.code.push(format!("pub struct {}(Session<Msg>);", state));
        self.code.push("".to_string());
    }

    fn write(mut self) -> Result<String, CompileError> {
        let projection = self.projection;

        self.code.push(format!("pub const ROLE: &str = {};", quote(&projection.protagonist)));
        let roles: Vec<String> = projection.roles.iter().map(|r| quote(r)).collect();
        self.code.push(format!("pub const ROLES: &[&str] = &[{}];", comma_list(&roles)));
        self.code.push("".to_string());

        for call in &projection.calls {
            self.code.push(format!(
                "// do {}({}) at {} is an external protocol and is not expanded.",
                call.name,
                comma_list(&call.roles),
                call.state
            ));
        }
        if !projection.calls.is_empty() {
            self.code.push("".to_string());
        }

        let (start_type, start_expr) = self.transition(&projection.start, "session")?;
        self.code.push(format!(
            "/// Opens the {} session of `{}` on `endpoint`.",
            projection.protagonist, projection.local
        ));
        self.code.push(format!(
            "pub fn start(endpoint: Endpoint<Msg>) -> Result<{}, SessionError> {{",
            start_type
        ));
        self.code.push("    let session = Session::new(endpoint);".to_string());
        self.code.push(format!("    Ok({})", start_expr));
        self.code.push("}".to_string());
        self.code.push("".to_string());

        for message in &projection.messages {
            self.message(message)?;
        }
        for choice in &projection.choices {
            self.choice(choice)?;
        }
        for par in &projection.pars {
            self.par(par)?;
        }
        for rec in &projection.recs {
            self.rec(rec)?;
        }

        while self.code.last().map_or(false, |line| line.is_empty()) {
            self.code.pop();
        }
        Ok(self.code.join("\n"))
    }

    fn message(&mut self, message: &MessageRecord) -> Result<(), CompileError> {
        let msg = self.msg;
        let variant = msg.variant(message)?;
        let (next_type, next_expr) = self.transition(&message.next, "session")?;
        let method = to_snake_case(&message.name);
        let args: Vec<String> = (0..message.payloads.len()).map(|i| format!("p{}", i)).collect();

        let value = if args.is_empty() {
            format!("Msg::{}", variant.name)
        } else {
            format!("Msg::{}({})", variant.name, comma_list(&args))
        };

        let doc = match message.direction {
            Direction::Send => format!("`{}({})` to {}", message.name, message.payloads.join(", "), message.to),
            Direction::Receive => format!("`{}({})` from {}", message.name, message.payloads.join(", "), message.from),
        };
        self.state_struct(&message.state, &doc);
        self.code.push(format!("impl {} {{", message.state));

        match message.direction {
            Direction::Send => {
                let params: Vec<String> = args
                    .iter()
                    .zip(&message.payloads)
                    .map(|(arg, ty)| format!("{}: {}", arg, map_type(ty)))
                    .collect();
                let params = if params.is_empty() {
                    String::new()
                } else {
                    format!(", {}", comma_list(&params))
                };
                self.code.push(format!(
                    "    pub fn emit_{}(self{}) -> Result<{}, SessionError> {{",
                    method, params, next_type
                ));
                self.code.push("        let session = self.0;".to_string());
                self.code.push(format!(
                    "        session.send({}, {}, {})?;",
                    quote(&message.to),
                    quote(&message.name),
                    value
                ));
                self.code.push(format!("        Ok({})", next_expr));
                self.code.push("    }".to_string());
            }
            Direction::Receive => {
                let (returns, result) = if args.is_empty() {
                    (next_type, next_expr)
                } else {
                    let types: Vec<String> = message.payloads.iter().map(|p| map_type(p)).collect();
                    (
                        format!("({}, {})", next_type, comma_list(&types)),
                        format!("({}, {})", next_expr, comma_list(&args)),
                    )
                };
                self.code.push(format!(
                    "    pub fn await_{}(self) -> Result<{}, SessionError> {{",
                    method, returns
                ));
                self.code.push("        let session = self.0;".to_string());
                self.code.push(format!(
                    "        match session.recv({}, {})? {{",
                    quote(&message.from),
                    quote(&message.name)
                ));
                self.code.push(format!("            {} => Ok({}),", value, result));
                self.code.push("            other => Err(SessionError::UnexpectedMessage {".to_string());
                self.code.push(format!("                state:    {}.to_string(),", quote(&message.state)));
                self.code.push(format!("                expected: {}.to_string(),", quote(&message.name)));
                self.code.push("                found:    other.label().to_string(),".to_string());
                self.code.push("            }),".to_string());
                self.code.push("        }".to_string());
                self.code.push("    }".to_string());
            }
        }

        self.code.push("}".to_string());
        self.code.push("".to_string());
        Ok(())
    }

    fn choice(&mut self, choice: &ChoiceRecord) -> Result<(), CompileError> {
        match choice.role {
            ChoiceRole::Chooser => self.chooser(choice),
            ChoiceRole::Observer => self.observer(choice),
        }
    }

    fn chooser(&mut self, choice: &ChoiceRecord) -> Result<(), CompileError> {
        let labels: Vec<Option<&str>> = choice
            .branches
            .iter()
            .map(|b| b.signal.as_ref().map(|s| s.label.as_str()))
            .collect();
        let distinct: HashSet<String> = labels.iter().flatten().map(|label| to_snake_case(label)).collect();
        let named = distinct.len() == labels.len() && labels.iter().all(Option::is_some);

        self.state_struct(&choice.state, &format!("Choice made here by {}.", choice.chooser));
        self.code.push(format!("impl {} {{", choice.state));
        for (branch, label) in choice.branches.iter().zip(&labels) {
            let method = match label {
                Some(label) if named => to_snake_case(label),
                _ => format!("branch{}", branch.index),
            };
            let (next_type, next_expr) = self.transition(&branch.entry, "session")?;
            self.code.push(format!(
                "    pub fn select_{}(self) -> Result<{}, SessionError> {{",
                method, next_type
            ));
            self.code.push("        let session = self.0;".to_string());
            self.code.push(format!("        Ok({})", next_expr));
            self.code.push("    }".to_string());
        }
        self.code.push("}".to_string());
        self.code.push("".to_string());
        Ok(())
    }

    fn observer(&mut self, choice: &ChoiceRecord) -> Result<(), CompileError> {
        let mut labels = Vec::with_capacity(choice.branches.len());
        for branch in &choice.branches {
            let signal = match &branch.signal {
                Some(signal) if signal.direction == Direction::Receive && signal.from == choice.chooser => signal,
                _ => {
                    return Err(CompileError::CodegenError(format!(
                        "Branch {} of the choice at {} does not start with a message from {}",
                        branch.index,
                        quote(&choice.state),
                        quote(&choice.chooser)
                    )))
                }
            };
            if labels.contains(&signal.label) {
                return Err(CompileError::CodegenError(format!(
                    "Two branches of the choice at {} start with message {}",
                    quote(&choice.state),
                    quote(&signal.label)
                )));
            }
            if let Some(clash) = labels.iter().find(|l| to_pascal_case(l) == to_pascal_case(&signal.label)) {
                return Err(CompileError::CodegenError(format!(
                    "The branches {} and {} of the choice at {} both map to variant {}",
                    quote(clash),
                    quote(&signal.label),
                    quote(&choice.state),
                    to_pascal_case(&signal.label)
                )));
            }
            labels.push(signal.label.clone());
        }

        let branch_enum = format!("{}_Branch", choice.state);
        let mut variants = Vec::new();
        let mut arms = Vec::new();
        for (i, (branch, label)) in choice.branches.iter().zip(&labels).enumerate() {
            let (next_type, next_expr) = self.transition(&branch.entry, "session")?;
            let variant = to_pascal_case(label);
            variants.push(format!("    {}({}),", variant, next_type));
            arms.push(format!("            {} => Ok({}::{}({})),", i, branch_enum, variant, next_expr));
        }

        self.code.push(format!("/// Branches {} may select at {}.", choice.chooser, choice.state));
        self.code.push(format!("pub enum {} {{", branch_enum));
        self.code.extend(variants);
        self.code.push("}".to_string());
        self.code.push("".to_string());

        self.state_struct(&choice.state, &format!("Waits for {} to choose a branch.", choice.chooser));
        let quoted: Vec<String> = labels.iter().map(|l| quote(l)).collect();
        self.code.push(format!("impl {} {{", choice.state));
        self.code.push(format!("    pub fn resolve(self) -> Result<{}, SessionError> {{", branch_enum));
        self.code.push("        let session = self.0;".to_string());
        self.code.push(format!(
            "        match session.wait_any({}, &[{}])? {{",
            quote(&choice.chooser),
            comma_list(&quoted)
        ));
        self.code.extend(arms);
        self.code.push("            _ => Err(SessionError::UnexpectedMessage {".to_string());
        self.code.push(format!("                state:    {}.to_string(),", quote(&choice.state)));
        self.code.push(format!("                expected: {}.to_string(),", quote(&labels.join(" | "))));
        self.code.push("                found:    \"none\".to_string(),".to_string());
        self.code.push("            }),".to_string());
        self.code.push("        }".to_string());
        self.code.push("    }".to_string());
        self.code.push("}".to_string());
        self.code.push("".to_string());
        Ok(())
    }

    fn par(&mut self, par: &ParRecord) -> Result<(), CompileError> {
        let n = par.branches.len();
        let names: Vec<String> = (1..=n).map(|b| format!("b{}", b)).collect();
        let mut types = vec![par.join.clone()];
        let mut values = vec![format!("{}(joiner)", par.join)];
        for (entry, name) in par.branches.iter().zip(&names) {
            let (ty, expr) = self.transition(entry, name)?;
            types.push(ty);
            values.push(expr);
        }

        self.state_struct(&par.state, &format!("Forks into {} parallel branches.", n));
        self.code.push(format!("impl {} {{", par.state));
        self.code.push(format!(
            "    pub fn fork(self) -> Result<({}), SessionError> {{",
            comma_list(&types)
        ));
        self.code.push(format!(
            "        let (joiner, [{}]) = self.0.fork::<{}>();",
            comma_list(&names),
            n
        ));
        self.code.push(format!("        Ok(({}))", comma_list(&values)));
        self.code.push("    }".to_string());
        self.code.push("}".to_string());
        self.code.push("".to_string());

        let (next_type, next_expr) = self.transition(&par.next, "session")?;
        self.code.push(format!("/// Joins the branches forked at {}.", par.state));
        self.code.push(format!("pub struct {}(Joiner<Msg>);", par.join));
        self.code.push("".to_string());
        self.code.push(format!("impl {} {{", par.join));
        self.code.push("    pub fn ready(&self) -> bool {".to_string());
        self.code.push("        self.0.ready()".to_string());
        self.code.push("    }".to_string());
        self.code.push("".to_string());
        self.code.push(format!("    pub fn join(self) -> Result<{}, SessionError> {{", next_type));
        self.code.push("        let session = self.0.join()?;".to_string());
        self.code.push(format!("        Ok({})", next_expr));
        self.code.push("    }".to_string());
        self.code.push("}".to_string());
        self.code.push("".to_string());
        Ok(())
    }

    /// `continue`s inside `rec` that leave it for an enclosing rec, as
    /// `(variant, state)` pairs whose state is neither its entry nor its exit.
    fn outward(&self, rec: &RecRecord, exit: &str) -> Result<Vec<(String, String)>, CompileError> {
        let inside = format!("{}_", rec.prefix);
        let mut outward: Vec<(String, String)> = Vec::new();
        for cont in self.projection.continues.iter().filter(|c| c.state.starts_with(&inside)) {
            let Target::Loop { rec: target, label, state } = &cont.target else {
                continue;
            };
            let enclosing = self.projection.rec(target).ok_or_else(|| {
                CompileError::CodegenError(format!("The rec {} has no record", quote(label)))
            })?;
            if enclosing.id == rec.id || !rec.prefix.starts_with(&format!("{}_", enclosing.prefix)) {
                continue;
            }
            if *state == rec.state || state == exit || outward.iter().any(|(_, s)| s == state) {
                continue;
            }
            outward.push((format!("Continue_{}", label), state.clone()));
        }
        Ok(outward)
    }

    fn from_impl(&mut self, ty: &str, target: &str, variant: &str) {
        self.code.push(format!("impl From<{}> for {} {{", ty, target));
        self.code.push(format!("    fn from(state: {}) -> Self {{", ty));
        self.code.push(format!("        {}::{}(state)", target, variant));
        self.code.push("    }".to_string());
        self.code.push("}".to_string());
        self.code.push("".to_string());
    }

    fn rec(&mut self, rec: &RecRecord) -> Result<(), CompileError> {
        let step = format!("{}_Step", rec.prefix);
        let entry = &rec.state;
        let (exit, _) = self.transition(&rec.next, "session")?;
        let outward = self.outward(rec, &exit)?;

        self.code.push(format!("/// Outcome of one pass through rec {}.", rec.label));
        self.code.push(format!("pub enum {} {{", step));
        self.code.push(format!("    Again({}),", entry));
        self.code.push(format!("    Done({}),", exit));
        for (variant, state) in &outward {
            self.code.push(format!("    {}({}),", variant, state));
        }
        self.code.push("}".to_string());
        self.code.push("".to_string());

        self.from_impl(entry, &step, "Again");
        if exit != *entry {
            self.from_impl(&exit, &step, "Done");
        }
        for (variant, state) in &outward {
            self.from_impl(state, &step, variant);
        }

        let returns = if outward.is_empty() {
            exit.clone()
        } else {
            let leave = format!("{}_Exit", rec.prefix);
            self.code.push(format!("/// How rec {} was left.", rec.label));
            self.code.push(format!("pub enum {} {{", leave));
            self.code.push(format!("    Done({}),", exit));
            for (variant, state) in &outward {
                self.code.push(format!("    {}({}),", variant, state));
            }
            self.code.push("}".to_string());
            self.code.push("".to_string());
            leave
        };

        self.code.push(format!(
            "/// Runs `body` from {} until it leaves rec {}.",
            entry, rec.label
        ));
        self.code.push(format!(
            "pub fn drive_{}<F>(mut state: {}, mut body: F) -> Result<{}, SessionError>",
            to_snake_case(&rec.prefix),
            entry,
            returns
        ));
        self.code.push("where".to_string());
        self.code.push(format!("    F: FnMut({}) -> Result<{}, SessionError>,", entry, step));
        self.code.push("{".to_string());
        self.code.push("    loop {".to_string());
        self.code.push("        match body(state)? {".to_string());
        self.code.push(format!("            {}::Again(next) => state = next,", step));
        if outward.is_empty() {
            self.code.push(format!("            {}::Done(exit) => return Ok(exit),", step));
        } else {
            self.code.push(format!("            {}::Done(exit) => return Ok({}::Done(exit)),", step, returns));
            for (variant, _) in &outward {
                self.code.push(format!(
                    "            {}::{}(next) => return Ok({}::{}(next)),",
                    step, variant, returns, variant
                ));
            }
        }
        self.code.push("        }".to_string());
        self.code.push("    }".to_string());
        self.code.push("}".to_string());
        self.code.push("".to_string());
        Ok(())
    }
}

/// Puts the header in front of `body`, or wraps it in a module when inlining.
fn assemble(options: &GenOptions, sources: &[String], body: Vec<String>) -> Result<String, CompileError> {
    let (doc, allow) = if options.inline { ("///", "#[allow") } else { ("//!", "#![allow") };
    let mut code = Vec::new();
    code.push(format!("{} Typestate API `{}`, generated by scrivener from:", doc, options.module_name));
    for source in sources {
        code.push(format!("{}  - {}", doc, source));
    }
    code.push(doc.to_string());
    code.push(format!("{} Do not edit by hand.", doc));
    code.push(format!(
        "{}(non_camel_case_types, dead_code, unused_imports, unreachable_patterns)]",
        allow
    ));

    if !options.inline {
        code.push("".to_string());
        code.extend(body);
        return Ok(code.join("\n"));
    }

    let name = &options.module_name;
    let valid = name.chars().next().map_or(false, |c| c.is_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !valid {
        return Err(CompileError::CodegenError(format!(
            "The module name {} is not a Rust identifier",
            quote(name)
        )));
    }
    code.push(format!("pub mod {} {{", escape_rust_keyword(name)));
    code.push(indent(&body.join("\n")));
    code.push("}".to_string());
    code.push("".to_string());
    Ok(code.join("\n"))
}

fn describe(projection: &Projection) -> String {
    format!("local protocol {} at {}", projection.local, projection.protagonist)
}

/// Compiles one role's projection into a standalone Rust module.
pub fn compile_protocol_to_rust(projection: &Projection, options: &GenOptions) -> Result<String, CompileError> {
    let msg = MsgEnum::collect(std::slice::from_ref(projection))?;

    let mut code = Vec::new();
    code.push(RUNTIME_IMPORTS.to_string());
    code.push("".to_string());

    let aliases = render_aliases(&projection.types.iter().collect::<Vec<_>>());
    if !aliases.is_empty() {
        code.push(aliases);
        code.push("".to_string());
    }
    code.push(msg.render());
    code.push("".to_string());
    code.push(RoleWriter::new(projection, &msg).write()?);
    code.push("".to_string());

    tracing::debug!(
        module = %options.module_name,
        role = %projection.protagonist,
        messages = msg.variants.len(),
        "generated rust module"
    );
    assemble(options, &[describe(projection)], code)
}

/// Compiles several roles into one module: a shared `Msg`, one submodule per
/// role, and a `connect` function wiring all of them to one in-process mesh.
pub fn compile_combined_to_rust(projections: &[Projection], options: &GenOptions) -> Result<String, CompileError> {
    if projections.is_empty() {
        return Err(CompileError::CodegenError("Nothing to generate".to_string()));
    }

    let mut modules = Vec::with_capacity(projections.len());
    for projection in projections {
        let module = escape_rust_keyword(&to_snake_case(&projection.protagonist));
        if modules.contains(&module) {
            return Err(CompileError::CodegenError(format!(
                "The role {} is projected twice",
                quote(&projection.protagonist)
            )));
        }
        modules.push(module);
    }

    let mut roles: Vec<&str> = Vec::new();
    for role in projections.iter().flat_map(|p| &p.roles) {
        if !roles.contains(&role.as_str()) {
            roles.push(role);
        }
    }

    let msg = MsgEnum::collect(projections)?;
    let sources: Vec<String> = projections.iter().map(describe).collect();

    let mut code = Vec::new();
    code.push("use scrivener_runtime::{Mesh, SessionError};".to_string());
    code.push("".to_string());

    let types: Vec<&TypeImport> = projections.iter().flat_map(|p| &p.types).collect();
    let aliases = render_aliases(&types);
    if !aliases.is_empty() {
        code.push(aliases);
        code.push("".to_string());
    }
    code.push(msg.render());
    code.push("".to_string());

    let mut starts = Vec::new();
    for (projection, module) in projections.iter().zip(&modules) {
        let writer = RoleWriter::new(projection, &msg);
        let (start_type, _) = writer.transition(&projection.start, "session")?;
        starts.push((module.clone(), projection.protagonist.clone(), start_type));

        code.push(format!("pub mod {} {{", module));
        code.push("    use super::*;".to_string());
        code.push(format!("    {}", RUNTIME_IMPORTS));
        code.push("".to_string());
        code.push(indent(&writer.write()?));
        code.push("}".to_string());
        code.push("".to_string());
    }

    let quoted: Vec<String> = roles.iter().map(|r| quote(r)).collect();
    let start_types: Vec<String> = starts
        .iter()
        .map(|(module, _, ty)| qualify(module, ty))
        .collect();
    let start_values: Vec<String> = starts
        .iter()
        .map(|(module, role, _)| format!("{}::start(mesh.endpoint({})?)?", module, quote(role)))
        .collect();
    code.push("/// Connects every role to a fresh in-process mesh and returns their start states.".to_string());
    code.push(format!(
        "pub fn connect() -> Result<({},), SessionError> {{",
        comma_list(&start_types)
    ));
    code.push(format!("    let mesh = Mesh::new([{}]);", comma_list(&quoted)));
    code.push(format!("    Ok(({},))", comma_list(&start_values)));
    code.push("}".to_string());

    tracing::debug!(
        module = %options.module_name,
        roles = projections.len(),
        messages = msg.variants.len(),
        "generated combined rust module"
    );
    assemble(options, &sources, code)
}

/// Path to a start type from the parent of its role module.
fn qualify(module: &str, ty: &str) -> String {
    match ty {
        "Finished<Msg>" => "scrivener_runtime::Finished<Msg>".to_string(),
        other => format!("{}::{}", module, other),
    }
}
