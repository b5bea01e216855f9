use std::collections::HashSet;

use crate::{
    error::CompileError,
    types::{Conversation, Local, Node, Protocol},
    utils::quote,
};

pub const NATIVE_TYPES: [&str; 9] = [
    "bool", "byte", "int", "uint", "int64", "uint64", "float", "double", "string",
];

/// Checks everything the projector assumes but the grammar cannot express:
/// every role is declared, every payload type is known, and no role sends to itself.
///
/// Returns `Ok(())` if verification passed, or `Err(CompileError::VerifierError(_))` otherwise.
pub fn verify_protocol(protocol: &Protocol) -> Result<(), CompileError> {
    if protocol.locals.is_empty() {
        return Err(CompileError::VerifierError(
            "A protocol needs at least one local declaration".to_string(),
        ));
    }

    // 1) Check duplicate / shadowing type aliases
    let mut known_types: HashSet<&str> = NATIVE_TYPES.iter().copied().collect();
    for import in &protocol.types {
        if let Some(alias) = &import.alias {
            if !known_types.insert(alias.as_str()) {
                return Err(CompileError::VerifierError(format!(
                    "The type {} is defined twice",
                    quote(alias)
                )));
            }
        }
    }

    // 2) Check each Local against its own role list
    let mut local_names = HashSet::new();
    for local in &protocol.locals {
        if !local_names.insert((local.name.as_str(), local.protagonist.as_str())) {
            return Err(CompileError::VerifierError(format!(
                "The local protocol {} at {} is declared twice",
                quote(&local.name),
                quote(&local.protagonist)
            )));
        }
        verify_local(local, &known_types)?;
    }

    tracing::debug!(locals = protocol.locals.len(), "verified protocol");
    Ok(())
}

fn verify_local(local: &Local, known_types: &HashSet<&str>) -> Result<(), CompileError> {
    let mut roles = HashSet::new();
    for role in &local.roles {
        if !roles.insert(role.name.as_str()) {
            return Err(CompileError::VerifierError(format!(
                "The role {} is declared twice in {}",
                quote(&role.name),
                quote(&local.name)
            )));
        }
    }
    if !roles.contains(local.protagonist.as_str()) {
        return Err(CompileError::VerifierError(format!(
            "The protagonist {} is not among the roles of {}",
            quote(&local.protagonist),
            quote(&local.name)
        )));
    }

    let checker = Checker { local, roles: &roles, known_types };
    checker.conversation(&local.conversation)
}

struct Checker<'a> {
    local:       &'a Local,
    roles:       &'a HashSet<&'a str>,
    known_types: &'a HashSet<&'a str>,
}

impl Checker<'_> {
    fn role(&self, role: &str) -> Result<(), CompileError> {
        if self.roles.contains(role) {
            Ok(())
        } else {
            Err(CompileError::VerifierError(format!(
                "The role {} is not declared in {}",
                quote(role),
                quote(&self.local.name)
            )))
        }
    }

    fn conversation(&self, conversation: &Conversation) -> Result<(), CompileError> {
        for node in &conversation.nodes {
            self.node(node)?;
        }
        Ok(())
    }

    fn node(&self, node: &Node) -> Result<(), CompileError> {
        match node {
            Node::Message { name, from, to, payloads, .. } => {
                self.role(from)?;
                self.role(to)?;
                if from == to {
                    return Err(CompileError::VerifierError(format!(
                        "The message {} is sent from {} to itself",
                        quote(name),
                        quote(from)
                    )));
                }
                if *from != self.local.protagonist && *to != self.local.protagonist {
                    return Err(CompileError::VerifierError(format!(
                        "The message {} does not involve the protagonist {}",
                        quote(name),
                        quote(&self.local.protagonist)
                    )));
                }
                for ty in payloads {
                    if !self.known_types.contains(ty.as_str()) {
                        return Err(CompileError::VerifierError(format!(
                            "The type {} is not defined for message {}",
                            quote(ty),
                            quote(name)
                        )));
                    }
                }
                Ok(())
            }
            Node::Choice { chooser, branches, .. } => {
                self.role(chooser)?;
                branches.iter().try_for_each(|branch| self.conversation(branch))
            }
            Node::Par { branches, .. } => branches.iter().try_for_each(|branch| self.conversation(branch)),
            Node::Rec { body, .. } => self.conversation(body),
            Node::Do { roles, .. } => roles.iter().try_for_each(|role| self.role(role)),
            Node::Continue { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parser::parse_protocol, tokenizer::tokenize_protocol};

    fn verify(text: &str) -> Result<(), CompileError> {
        let protocol = parse_protocol(&tokenize_protocol(text)).expect("parse failed");
        verify_protocol(&protocol)
    }

    fn verifier_msg(text: &str) -> String {
        match verify(text) {
            Err(CompileError::VerifierError(msg)) => msg,
            other => panic!("expected a verifier error, got {:?}", other),
        }
    }

    #[test]
    fn test_accepts_declared_alias() {
        verify(
            r#"
            type <java> "java.lang.Integer" from "rt.jar" as Price;
            local protocol P at Buyer (role Buyer, role Seller) {
                price(Price, double) from Seller;
                do Settle(Buyer, Seller);
            }
            "#,
        )
        .unwrap();
    }

    #[test]
    fn test_rejects_unknown_payload_type() {
        let msg = verifier_msg("local protocol P at A (role A, role B) { a(Price) to B; }");
        assert!(msg.contains("\"Price\""), "{}", msg);
    }

    #[test]
    fn test_rejects_alias_shadowing_native() {
        let msg = verifier_msg(
            r#"type <java> "java.lang.Integer" from "rt.jar" as int; local protocol P at A (role A, role B) { a() to B; }"#,
        );
        assert!(msg.contains("defined twice"), "{}", msg);
    }

    #[test]
    fn test_rejects_undeclared_role() {
        let msg = verifier_msg("local protocol P at A (role A, role B) { a() to C; }");
        assert!(msg.contains("\"C\""), "{}", msg);
        let msg = verifier_msg("local protocol P at A (role A, role B) { choice at C { a() to B; } }");
        assert!(msg.contains("\"C\""), "{}", msg);
    }

    #[test]
    fn test_rejects_missing_protagonist() {
        let msg = verifier_msg("local protocol P at A (role B, role C) { a() to B; }");
        assert!(msg.contains("protagonist"), "{}", msg);
    }

    #[test]
    fn test_rejects_self_message() {
        let msg = verifier_msg("local protocol P at A (role A, role B) { a() to A; }");
        assert!(msg.contains("to itself"), "{}", msg);
    }

    #[test]
    fn test_rejects_duplicate_role() {
        let msg = verifier_msg("local protocol P at A (role A, role A) { }");
        assert!(msg.contains("declared twice"), "{}", msg);
    }
}
