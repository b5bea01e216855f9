#![cfg(test)]

use std::collections::HashSet;

use proptest::prelude::*;

use scrivener_compiler::{
    compile_protocol,
    gen_rust::{compile_protocol_to_rust, GenOptions},
    parser::ParseOptions,
    projector::{Projection, Target},
    tokenizer::tokenize_protocol,
    types::{Conversation, Node, NodeId},
};

#[derive(Debug, Clone)]
enum Step {
    Message(String, bool),
    Choice(Vec<Vec<Step>>),
    Par(Vec<Vec<Step>>),
    Rec(Vec<Step>, bool),
}

fn step() -> impl Strategy<Value = Step> {
    let leaf = ("m[a-z]{0,4}", any::<bool>()).prop_map(|(name, send)| Step::Message(name, send));
    leaf.prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            prop::collection::vec(prop::collection::vec(inner.clone(), 0..3), 1..4).prop_map(Step::Choice),
            prop::collection::vec(prop::collection::vec(inner.clone(), 0..3), 1..4).prop_map(Step::Par),
            (prop::collection::vec(inner, 1..3), any::<bool>()).prop_map(|(body, again)| Step::Rec(body, again)),
        ]
    })
}

fn render(steps: &[Step], labels: &mut usize, out: &mut String) {
    for step in steps {
        match step {
            Step::Message(name, true) => out.push_str(&format!("{}() to B;\n", name)),
            Step::Message(name, false) => out.push_str(&format!("{}() from B;\n", name)),
            Step::Choice(branches) | Step::Par(branches) => {
                let (head, sep) = match step {
                    Step::Choice(_) => ("choice at A", "or"),
                    _ => ("par", "and"),
                };
                out.push_str(head);
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                        out.push_str(sep);
                    }
                    out.push_str(" {\n");
                    render(branch, labels, out);
                    out.push('}');
                }
                out.push('\n');
            }
            Step::Rec(body, again) => {
                let label = format!("L{}", labels);
                *labels += 1;
                out.push_str(&format!("rec {} {{\n", label));
                render(body, labels, out);
                if *again {
                    out.push_str(&format!("continue {};\n", label));
                }
                out.push_str("}\n");
            }
        }
    }
}

fn protocol_text(steps: &[Step]) -> String {
    let mut body = String::new();
    render(steps, &mut 0, &mut body);
    format!("local protocol P at A (role A, role B) {{\n{}}}\n", body)
}

/// The target a node hands control to once it has run, as recorded by the projector.
fn next_of<'a>(projection: &'a Projection, node: &Node) -> Option<&'a Target> {
    let id = node.id()?;
    projection
        .messages
        .iter()
        .find(|m| &m.id == id)
        .map(|m| &m.next)
        .or_else(|| projection.choices.iter().find(|c| &c.id == id).map(|c| &c.next))
        .or_else(|| projection.pars.iter().find(|p| &p.id == id).map(|p| &p.next))
        .or_else(|| projection.recs.iter().find(|r| &r.id == id).map(|r| &r.next))
}

fn check(conversation: &Conversation, projection: &Projection, recs: &mut Vec<(String, NodeId)>, ids: &mut HashSet<NodeId>) {
    for node in &conversation.nodes {
        if let Some(id) = node.id() {
            assert!(ids.insert(id.clone()), "duplicate id {}", id);
        }
        match node {
            Node::Choice { id, branches, .. } => {
                let choice = projection.choices.iter().find(|c| &c.id == id).unwrap();
                for branch in branches {
                    if let Some(last) = branch.nodes.last() {
                        assert_eq!(next_of(projection, last), Some(&choice.next));
                    }
                    check(branch, projection, recs, ids);
                }
            }
            Node::Par { id, branches } => {
                let par = projection.par(id).unwrap();
                assert_eq!(par.branches.len(), branches.len());
                let join = Target::Join { par: id.clone(), state: par.join.clone() };
                let starts: HashSet<_> = par.branches.iter().filter(|t| **t != join).collect();
                let non_empty = branches.iter().filter(|b| !b.nodes.is_empty()).count();
                assert_eq!(starts.len(), non_empty);
                for branch in branches {
                    if let Some(last) = branch.nodes.last() {
                        assert_eq!(next_of(projection, last), Some(&join));
                    }
                    check(branch, projection, recs, ids);
                }
            }
            Node::Rec { id, label, body } => {
                recs.push((label.clone(), id.clone()));
                check(body, projection, recs, ids);
                recs.pop();
            }
            Node::Continue { id, label } => {
                let (_, rec) = recs.iter().rev().find(|(l, _)| l == label).expect("continue outside its rec");
                let record = projection.continues.iter().find(|c| &c.id == id).unwrap();
                match &record.target {
                    Target::Loop { rec: target, state, .. } => {
                        assert_eq!(target, rec);
                        assert_eq!(state, &projection.rec(rec).unwrap().state);
                    }
                    other => panic!("continue resolved to {:?}", other),
                }
            }
            Node::Message { .. } | Node::Do { .. } => {}
        }
    }
}

proptest! {
    #[test]
    fn retokenizing_is_a_fixed_point(text in "[ -~\n]{0,80}") {
        let first: Vec<String> = tokenize_protocol(&text).into_iter().map(|t| t.text).collect();
        let second: Vec<String> = tokenize_protocol(&first.join(" ")).into_iter().map(|t| t.text).collect();
        prop_assert_eq!(first, second);
    }

    #[test]
    fn projection_links_are_consistent(steps in prop::collection::vec(step(), 1..4), parallel in any::<bool>()) {
        let text = protocol_text(&steps);
        let (protocol, projections) = compile_protocol(&text, &ParseOptions { parallel })
            .unwrap_or_else(|err| panic!("{}\n{}", err, text));
        let projection = &projections[0];

        let mut ids = HashSet::new();
        check(&protocol.locals[0].conversation, projection, &mut Vec::new(), &mut ids);

        compile_protocol_to_rust(projection, &GenOptions::default())
            .unwrap_or_else(|err| panic!("{}\n{}", err, text));
    }
}
