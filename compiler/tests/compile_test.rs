#![cfg(test)]

use std::path::PathBuf;

use scrivener_compiler::{
    compile_files, compile_protocol,
    error::CompileError,
    gen_rust::{compile_protocol_to_rust, GenOptions},
    parser::ParseOptions,
    projector::{ChoiceRole, Direction, Projection, Target},
    types::{Node, StepKind},
    CompileOptions,
};

const BUYER: &str = include_str!("../../protocols/buyer.scr");
const NEGOTIATE: &str = include_str!("../../protocols/negotiate.scr");

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../protocols").join(name)
}

fn project(text: &str) -> Projection {
    let (_, mut projections) = compile_protocol(text, &ParseOptions::default()).expect("compile_protocol failed");
    projections.remove(0)
}

fn state_of<'a>(projection: &'a Projection, name: &str) -> &'a str {
    &projection
        .messages
        .iter()
        .find(|m| m.name == name)
        .unwrap_or_else(|| panic!("no message {}", name))
        .state
}

fn next_of<'a>(projection: &'a Projection, name: &str) -> &'a Target {
    &projection
        .messages
        .iter()
        .find(|m| m.name == name)
        .unwrap_or_else(|| panic!("no message {}", name))
        .next
}

#[test]
fn test_scenario_sequence() {
    let (protocol, projections) = compile_protocol(
        "local protocol P at Buyer (role Buyer, role Seller) { price(int) from Seller; accept() to Seller; }",
        &ParseOptions::default(),
    )
    .unwrap();

    let local = &protocol.locals[0];
    assert_eq!(local.protagonist, "Buyer");
    assert_eq!(local.conversation.nodes.len(), 2);
    match (&local.conversation.nodes[0], &local.conversation.nodes[1]) {
        (Node::Message { from: f1, to: t1, .. }, Node::Message { from: f2, to: t2, .. }) => {
            assert_eq!((f1.as_str(), t1.as_str()), ("Seller", "Buyer"));
            assert_eq!((f2.as_str(), t2.as_str()), ("Buyer", "Seller"));
        }
        other => panic!("expected two messages, got {:?}", other),
    }

    let projection = &projections[0];
    let accept_id = local.conversation.nodes[1].id().unwrap().clone();
    assert_eq!(
        *next_of(projection, "price"),
        Target::Step { id: accept_id, kind: StepKind::Message, state: "Buyer_2".to_string() }
    );
    assert_eq!(*next_of(projection, "accept"), Target::End);
}

#[test]
fn test_scenario_loop() {
    let projection = project(
        "local protocol P at Buyer (role Buyer, role Seller) { rec Loop { msg() from Seller; continue Loop; } }",
    );
    let rec = &projection.recs[0];
    match next_of(&projection, "msg") {
        Target::Loop { rec: id, label, state } => {
            assert_eq!(id, &rec.id);
            assert_eq!(label, "Loop");
            assert_eq!(state, &rec.state);
            assert_eq!(state, state_of(&projection, "msg"));
        }
        other => panic!("expected a back-edge, got {:?}", other),
    }
}

#[test]
fn test_scenario_wrapped_choice() {
    let projection = project(NEGOTIATE);
    assert_eq!(projection.module, None);
    let bye = Target::Step {
        id:    projection.messages.iter().find(|m| m.name == "bye").unwrap().id.clone(),
        kind:  StepKind::Message,
        state: "Seller_3".to_string(),
    };
    assert_eq!(*next_of(&projection, "accept"), bye);
    assert_eq!(*next_of(&projection, "reject"), bye);
    assert_eq!(projection.choices[0].next, bye);
}

#[test]
fn test_buyer_fixture_projection() {
    let projection = project(BUYER);
    assert_eq!(projection.module.as_deref(), Some("shop.purchase"));
    assert_eq!(projection.types[0].alias.as_deref(), Some("Item"));

    assert_eq!(state_of(&projection, "request"), "Buyer_1");
    assert_eq!(state_of(&projection, "quote"), "Buyer_2_Haggle_1");
    assert_eq!(state_of(&projection, "counter"), "Buyer_2_Haggle_2_Choice1_1");
    assert_eq!(state_of(&projection, "accept"), "Buyer_2_Haggle_2_Choice2_1");
    assert_eq!(state_of(&projection, "invoice"), "Buyer_3_Par1_1");
    assert_eq!(state_of(&projection, "eta"), "Buyer_3_Par2_1");
    assert_eq!(state_of(&projection, "bye"), "Buyer_5");

    assert_eq!(next_of(&projection, "request").state(), Some("Buyer_2_Haggle_1"));
    assert!(matches!(next_of(&projection, "counter"), Target::Loop { label, .. } if label == "Haggle"));
    assert!(matches!(next_of(&projection, "accept"), Target::RecEnd { label, .. } if label == "Haggle"));
    assert!(matches!(next_of(&projection, "reject"), Target::RecEnd { label, .. } if label == "Haggle"));
    assert!(matches!(next_of(&projection, "invoice"), Target::Join { state, .. } if state == "Buyer_3_Join"));
    assert_eq!(next_of(&projection, "eta"), next_of(&projection, "invoice"));

    assert_eq!(projection.recs[0].next.state(), Some("Buyer_3"));
    assert_eq!(projection.pars[0].next.state(), Some("Buyer_5"));
    assert_eq!(projection.choices[0].role, ChoiceRole::Chooser);
    assert_eq!(projection.calls[0].name, "Feedback");

    let directions: Vec<Direction> = projection.messages.iter().map(|m| m.direction).collect();
    assert_eq!(directions[0], Direction::Send);
    assert_eq!(directions[1], Direction::Receive);
}

#[test]
fn test_generate_buyer_module() {
    let projection = project(BUYER);
    let code = compile_protocol_to_rust(&projection, &GenOptions { module_name: "purchase".to_string(), ..GenOptions::default() }).unwrap();

    assert!(code.starts_with("//! Typestate API `purchase`"));
    assert!(code.contains("pub type Item = String;"));
    assert!(code.contains("pub fn emit_request(self, p0: Item) -> Result<Buyer_2_Haggle_1, SessionError> {"));
    assert!(code.contains("pub fn select_counter(self) -> Result<Buyer_2_Haggle_2_Choice1_1, SessionError> {"));
    assert!(code.contains("pub fn emit_accept(self) -> Result<Buyer_3, SessionError> {"));
    assert!(code.contains("pub fn fork(self) -> Result<(Buyer_3_Join, Buyer_3_Par1_1, Buyer_3_Par2_1), SessionError> {"));
    assert!(code.contains("pub fn await_invoice(self) -> Result<(BranchDone, f64), SessionError> {"));
    assert!(code.contains("pub fn join(self) -> Result<Buyer_5, SessionError> {"));
    assert!(code.contains("pub fn drive_buyer_2_haggle<F>"));
    assert!(code.contains("// do Feedback(Buyer, Seller) at Buyer_4 is an external protocol and is not expanded."));
}

#[test]
fn test_compile_single_file() {
    let code = compile_files(&[fixture("negotiate.scr")], &CompileOptions::default()).unwrap();
    assert!(code.contains("pub const ROLE: &str = \"Seller\";"));
    assert!(!code.contains("pub fn connect()"));
}

#[test]
fn test_compile_combined_files() {
    let paths = vec![fixture("buyer.scr"), fixture("seller.scr"), fixture("shipper.scr")];
    let code = compile_files(&paths, &CompileOptions::default()).unwrap();

    assert_eq!(code.matches("pub enum Msg {").count(), 1);
    assert_eq!(code.matches("pub type Item = String;").count(), 1);
    for module in ["buyer", "seller", "shipper"] {
        assert!(code.contains(&format!("pub mod {} {{", module)), "missing module {}", module);
    }
    assert!(code.contains("let mesh = Mesh::new([\"Buyer\", \"Seller\", \"Shipper\"]);"));
    assert!(code.contains("buyer::Buyer_1, seller::Seller_1, shipper::Shipper_1,"));

    // The seller observes the buyer's choice through the first message of each branch.
    assert!(code.contains("match session.wait_any(\"Buyer\", &[\"counter\", \"accept\", \"reject\"])? {"));
}

#[test]
fn test_parallel_parse_keeps_ids_unique() {
    let (sequential, _) = compile_protocol(BUYER, &ParseOptions::default()).unwrap();
    let (parallel, _) = compile_protocol(BUYER, &ParseOptions { parallel: true }).unwrap();

    fn collect(nodes: &[Node], out: &mut Vec<String>) {
        for node in nodes {
            if let Some(id) = node.id() {
                out.push(id.to_string());
            }
            match node {
                Node::Choice { branches, .. } | Node::Par { branches, .. } => {
                    branches.iter().for_each(|b| collect(&b.nodes, out))
                }
                Node::Rec { body, .. } => collect(&body.nodes, out),
                _ => {}
            }
        }
    }

    let mut seq_ids = Vec::new();
    collect(&sequential.locals[0].conversation.nodes, &mut seq_ids);
    let mut par_ids = Vec::new();
    collect(&parallel.locals[0].conversation.nodes, &mut par_ids);

    assert_eq!(seq_ids.len(), par_ids.len());
    let mut unique = par_ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), par_ids.len());
}

#[test]
fn test_errors_abort_the_run() {
    let err = compile_protocol("protocol X;", &ParseOptions::default()).unwrap_err();
    assert!(matches!(err, CompileError::ParseError { .. }), "{:?}", err);

    let err = compile_protocol(
        "local protocol P at A (role A, role B) { rec L { a() to B; continue M; } }",
        &ParseOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::LinkageError(_)), "{:?}", err);
    assert!(err.to_string().contains("\"M\""));
}
