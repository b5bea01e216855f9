use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::{
    error::CompileError,
    types::{Conversation, Local, Node, NodeId, Protocol, StepKind, TypeImport},
    utils::quote,
};

/// Where control goes once a step has run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum Target {
    /// The next concrete step. For a Rec, `state` is the entry state of its body.
    Step { id: NodeId, kind: StepKind, state: String },
    /// Back-edge to the entry of an enclosing Rec.
    Loop { rec: NodeId, label: String, state: String },
    /// End of a Rec body without a `continue`: the loop driver exits.
    RecEnd { rec: NodeId, label: String },
    /// End of a Par branch.
    Join { par: NodeId, state: String },
    /// End of the root conversation.
    End,
}

impl Target {
    /// State name of the target, if it names a state of its own.
    pub fn state(&self) -> Option<&str> {
        match self {
            Target::Step { state, .. } | Target::Loop { state, .. } | Target::Join { state, .. } => Some(state),
            Target::RecEnd { .. } | Target::End => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChoiceRole {
    Chooser,
    Observer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub id:            NodeId,
    pub name:          String,
    pub from:          String,
    pub to:            String,
    pub payloads:      Vec<String>,
    pub direction:     Direction,
    pub position:      usize,
    pub state:         String,
    pub next:          Target,
    /// The Choice this message selects, when it opens one of its branches.
    pub choice_signal: Option<NodeId>,
}

impl MessageRecord {
    /// The role on the other end of the exchange.
    pub fn peer(&self) -> &str {
        match self.direction {
            Direction::Send => &self.to,
            Direction::Receive => &self.from,
        }
    }
}

/// The first message of a Choice branch, which tells observers the branch was taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    pub id:        NodeId,
    pub label:     String,
    pub from:      String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoiceBranch {
    pub index:  usize,
    pub entry:  Target,
    pub signal: Option<Signal>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChoiceRecord {
    pub id:       NodeId,
    pub position: usize,
    pub state:    String,
    pub chooser:  String,
    pub role:     ChoiceRole,
    pub branches: Vec<ChoiceBranch>,
    pub next:     Target,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParRecord {
    pub id:       NodeId,
    pub position: usize,
    pub state:    String,
    pub branches: Vec<Target>,
    pub join:     String,
    pub next:     Target,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecRecord {
    pub id:       NodeId,
    pub label:    String,
    pub position: usize,
    /// State-name prefix shared by every step of the body, e.g. `Buyer_3_Loop`.
    pub prefix:   String,
    /// Entry state of the body; every `continue` to this Rec lands here.
    pub state:    String,
    pub next:     Target,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinueRecord {
    pub id:       NodeId,
    pub label:    String,
    pub position: usize,
    pub state:    String,
    pub target:   Target,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallRecord {
    pub name:     String,
    pub roles:    Vec<String>,
    pub position: usize,
    pub state:    String,
    pub next:     Target,
}

/// One role's flattened, cross-referenced view of a Local.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    pub module:      Option<String>,
    pub local:       String,
    pub protagonist: String,
    pub roles:       Vec<String>,
    pub types:       Vec<TypeImport>,
    pub start:       Target,
    pub messages:    Vec<MessageRecord>,
    pub choices:     Vec<ChoiceRecord>,
    pub pars:        Vec<ParRecord>,
    pub recs:        Vec<RecRecord>,
    pub continues:   Vec<ContinueRecord>,
    pub calls:       Vec<CallRecord>,
}

impl Projection {
    pub fn message(&self, id: &NodeId) -> Option<&MessageRecord> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn rec(&self, id: &NodeId) -> Option<&RecRecord> {
        self.recs.iter().find(|r| &r.id == id)
    }

    pub fn par(&self, id: &NodeId) -> Option<&ParRecord> {
        self.pars.iter().find(|p| &p.id == id)
    }
}

#[derive(Debug, Clone, Copy)]
enum Owner {
    Root,
    Rec(usize),
    Choice(usize),
    Par(usize),
}

#[derive(Debug)]
enum Children {
    Leaf,
    Body(Option<usize>),
    Branches(Vec<Option<usize>>),
}

#[derive(Debug)]
struct Slot<'a> {
    node:     &'a Node,
    state:    String,
    position: usize,
    owner:    Owner,
    next:     Option<usize>,
    children: Children,
}

enum Scope<'a> {
    Rec { label: &'a str, slot: usize },
    Par,
}

/// Flattened tree: one slot per node in pre-order, with continue labels bound.
struct Layout<'a> {
    protagonist: &'a str,
    slots:       Vec<Slot<'a>>,
    loops:       HashMap<usize, usize>,
    seen:        HashSet<&'a NodeId>,
}

impl<'a> Layout<'a> {
    fn build(local: &'a Local) -> Result<(Self, Option<usize>), CompileError> {
        let mut layout = Layout {
            protagonist: &local.protagonist,
            slots:       Vec::new(),
            loops:       HashMap::new(),
            seen:        HashSet::new(),
        };
        let mut scopes = Vec::new();
        let root = layout.conversation(&local.conversation, &local.protagonist, Owner::Root, &mut scopes)?;
        Ok((layout, root))
    }

    fn conversation(
        &mut self,
        conversation: &'a Conversation,
        prefix: &str,
        owner: Owner,
        scopes: &mut Vec<Scope<'a>>,
    ) -> Result<Option<usize>, CompileError> {
        let mut first = None;
        let mut previous: Option<usize> = None;

        for (i, node) in conversation.nodes.iter().enumerate() {
            let position = i + 1;
            let index = self.slots.len();

            if let Some(prev) = previous {
                if let Node::Continue { label, .. } = self.slots[prev].node {
                    return Err(CompileError::StructuralError(format!(
                        "Step {} after continue {} in {} is unreachable",
                        quote(&describe(node)),
                        quote(label),
                        quote(prefix)
                    )));
                }
                self.slots[prev].next = Some(index);
            }
            if let Some(id) = node.id() {
                if !self.seen.insert(id) {
                    return Err(CompileError::LinkageError(format!(
                        "The identifier {} is used twice",
                        quote(&id.to_string())
                    )));
                }
            }

            let state = format!("{}_{}", prefix, position);
            self.slots.push(Slot {
                node,
                state: state.clone(),
                position,
                owner,
                next: None,
                children: Children::Leaf,
            });
            first.get_or_insert(index);
            previous = Some(index);

            match node {
                Node::Rec { label, body, .. } => {
                    if body.nodes.is_empty() {
                        return Err(CompileError::StructuralError(format!(
                            "The body of rec {} is empty",
                            quote(label)
                        )));
                    }
                    scopes.push(Scope::Rec { label, slot: index });
                    let entry = self.conversation(body, &format!("{}_{}", state, label), Owner::Rec(index), scopes);
                    scopes.pop();
                    self.slots[index].children = Children::Body(entry?);
                }
                Node::Choice { branches, .. } | Node::Par { branches, .. } => {
                    let (tag, branch_owner) = match node {
                        Node::Choice { .. } => ("Choice", Owner::Choice(index)),
                        _ => ("Par", Owner::Par(index)),
                    };
                    if branches.is_empty() {
                        return Err(CompileError::StructuralError(format!(
                            "The {} at {} has no branches",
                            tag.to_lowercase(),
                            quote(&state)
                        )));
                    }
                    let is_par = matches!(node, Node::Par { .. });
                    if is_par {
                        scopes.push(Scope::Par);
                    }
                    let mut entries = Vec::with_capacity(branches.len());
                    let mut result = Ok(());
                    for (b, branch) in branches.iter().enumerate() {
                        let branch_prefix = format!("{}_{}{}", state, tag, b + 1);
                        match self.conversation(branch, &branch_prefix, branch_owner, scopes) {
                            Ok(entry) => entries.push(entry),
                            Err(err) => {
                                result = Err(err);
                                break;
                            }
                        }
                    }
                    if is_par {
                        scopes.pop();
                    }
                    result?;
                    self.slots[index].children = Children::Branches(entries);
                }
                Node::Continue { label, .. } => {
                    let rec = self.bind_continue(label, scopes)?;
                    self.loops.insert(index, rec);
                }
                Node::Message { .. } | Node::Do { .. } => {}
            }
        }

        Ok(first)
    }

    fn bind_continue(&self, label: &str, scopes: &[Scope<'a>]) -> Result<usize, CompileError> {
        for scope in scopes.iter().rev() {
            match scope {
                Scope::Rec { label: rec_label, slot } if *rec_label == label => return Ok(*slot),
                Scope::Rec { .. } => {}
                Scope::Par => {
                    if scopes.iter().any(|s| matches!(s, Scope::Rec { label: l, .. } if *l == label)) {
                        return Err(CompileError::StructuralError(format!(
                            "continue {} cannot leave a par branch",
                            quote(label)
                        )));
                    }
                }
            }
        }
        Err(CompileError::LinkageError(format!(
            "continue {} does not name an enclosing rec",
            quote(label)
        )))
    }

    fn id(&self, slot: usize) -> Result<&'a NodeId, CompileError> {
        self.slots[slot].node.id().ok_or_else(|| {
            CompileError::LinkageError(format!("Step {} has no identifier", quote(&self.slots[slot].state)))
        })
    }

    /// The target reached by entering `slot`.
    fn entry(&self, slot: usize) -> Result<Target, CompileError> {
        let s = &self.slots[slot];
        match s.node {
            Node::Do { .. } => self.follow(slot),
            Node::Continue { label, .. } => {
                let rec = self.loops.get(&slot).copied().ok_or_else(|| {
                    CompileError::LinkageError(format!("continue {} was never bound", quote(label)))
                })?;
                Ok(Target::Loop {
                    rec:   self.id(rec)?.clone(),
                    label: label.clone(),
                    state: self.rec_entry_state(rec)?,
                })
            }
            Node::Rec { .. } => Ok(Target::Step {
                id:    self.id(slot)?.clone(),
                kind:  StepKind::Rec,
                state: self.rec_entry_state(slot)?,
            }),
            node => Ok(Target::Step {
                id:    self.id(slot)?.clone(),
                kind:  node.kind(),
                state: s.state.clone(),
            }),
        }
    }

    /// The target reached once `slot` has run.
    fn follow(&self, slot: usize) -> Result<Target, CompileError> {
        match self.slots[slot].next {
            Some(next) => self.entry(next),
            None => self.exit(self.slots[slot].owner),
        }
    }

    /// The target reached by running off the end of a conversation owned by `owner`.
    fn exit(&self, owner: Owner) -> Result<Target, CompileError> {
        match owner {
            Owner::Root => Ok(Target::End),
            Owner::Rec(rec) => match self.slots[rec].node {
                Node::Rec { id, label, .. } => Ok(Target::RecEnd { rec: id.clone(), label: label.clone() }),
                _ => Err(CompileError::StructuralError("Rec owner is not a rec".to_string())),
            },
            Owner::Choice(choice) => self.follow(choice),
            Owner::Par(par) => Ok(Target::Join {
                par:   self.id(par)?.clone(),
                state: join_state(&self.slots[par].state),
            }),
        }
    }

    fn branch_entry(&self, first: Option<usize>, owner: Owner) -> Result<Target, CompileError> {
        match first {
            Some(first) => self.entry(first),
            None => self.exit(owner),
        }
    }

    /// State of the first observable step in a Rec body.
    ///
    /// Walks the body directly instead of going through `entry`, so a body that
    /// opens with a `continue` is reported rather than chased forever.
    fn rec_entry_state(&self, rec: usize) -> Result<String, CompileError> {
        let label = match self.slots[rec].node {
            Node::Rec { label, .. } => label,
            _ => return Err(CompileError::StructuralError("Loop target is not a rec".to_string())),
        };
        let mut cursor = match self.slots[rec].children {
            Children::Body(first) => first,
            _ => None,
        };
        while let Some(slot) = cursor {
            match self.slots[slot].node {
                Node::Do { .. } => cursor = self.slots[slot].next,
                Node::Continue { .. } => break,
                Node::Rec { .. } => return self.rec_entry_state(slot),
                _ => return Ok(self.slots[slot].state.clone()),
            }
        }
        Err(CompileError::StructuralError(format!(
            "rec {} loops without an observable step",
            quote(label)
        )))
    }

    fn signal(&self, entry: &Target) -> Option<Signal> {
        let Target::Step { id, kind: StepKind::Message, .. } = entry else {
            return None;
        };
        self.slots.iter().find_map(|slot| match slot.node {
            Node::Message { id: mid, name, from, .. } if mid == id => Some(Signal {
                id:        mid.clone(),
                label:     name.clone(),
                from:      from.clone(),
                direction: if from == self.protagonist { Direction::Send } else { Direction::Receive },
            }),
            _ => None,
        })
    }
}

fn join_state(par_state: &str) -> String {
    format!("{}_Join", par_state)
}

fn describe(node: &Node) -> String {
    match node {
        Node::Message { name, .. } => name.clone(),
        Node::Rec { label, .. } | Node::Continue { label, .. } => label.clone(),
        Node::Do { name, .. } => name.clone(),
        other => other.kind().to_string(),
    }
}

/// Projects every Local of `protocol`.
pub fn project_protocol(protocol: &Protocol) -> Result<Vec<Projection>, CompileError> {
    protocol
        .locals
        .iter()
        .map(|local| project_local(local, protocol.module.as_deref(), &protocol.types))
        .collect()
}

/// Assigns state names to every step of `local` and resolves where each one leads.
pub fn project_local(
    local: &Local,
    module: Option<&str>,
    types: &[TypeImport],
) -> Result<Projection, CompileError> {
    let (layout, root) = Layout::build(local)?;

    let mut projection = Projection {
        module:      module.map(str::to_string),
        local:       local.name.clone(),
        protagonist: local.protagonist.clone(),
        roles:       local.roles.iter().map(|r| r.name.clone()).collect(),
        types:       types.to_vec(),
        start:       layout.branch_entry(root, Owner::Root)?,
        messages:    Vec::new(),
        choices:     Vec::new(),
        pars:        Vec::new(),
        recs:        Vec::new(),
        continues:   Vec::new(),
        calls:       Vec::new(),
    };

    for (index, slot) in layout.slots.iter().enumerate() {
        match slot.node {
            Node::Message { id, name, from, to, payloads } => {
                projection.messages.push(MessageRecord {
                    id:            id.clone(),
                    name:          name.clone(),
                    from:          from.clone(),
                    to:            to.clone(),
                    payloads:      payloads.clone(),
                    direction:     if *from == local.protagonist { Direction::Send } else { Direction::Receive },
                    position:      slot.position,
                    state:         slot.state.clone(),
                    next:          layout.follow(index)?,
                    choice_signal: None,
                });
            }
            Node::Choice { id, chooser, .. } => {
                let firsts: &[Option<usize>] = match &slot.children {
                    Children::Branches(firsts) => firsts.as_slice(),
                    _ => &[],
                };
                let mut branches = Vec::with_capacity(firsts.len());
                for (b, first) in firsts.iter().enumerate() {
                    let entry = layout.branch_entry(*first, Owner::Choice(index))?;
                    let signal = layout.signal(&entry);
                    branches.push(ChoiceBranch { index: b + 1, entry, signal });
                }
                projection.choices.push(ChoiceRecord {
                    id:       id.clone(),
                    position: slot.position,
                    state:    slot.state.clone(),
                    chooser:  chooser.clone(),
                    role:     if *chooser == local.protagonist { ChoiceRole::Chooser } else { ChoiceRole::Observer },
                    branches,
                    next:     layout.follow(index)?,
                });
            }
            Node::Par { id, .. } => {
                let firsts: &[Option<usize>] = match &slot.children {
                    Children::Branches(firsts) => firsts.as_slice(),
                    _ => &[],
                };
                let branches = firsts
                    .iter()
                    .map(|first| layout.branch_entry(*first, Owner::Par(index)))
                    .collect::<Result<Vec<_>, _>>()?;
                projection.pars.push(ParRecord {
                    id:       id.clone(),
                    position: slot.position,
                    state:    slot.state.clone(),
                    branches,
                    join:     join_state(&slot.state),
                    next:     layout.follow(index)?,
                });
            }
            Node::Rec { id, label, .. } => {
                projection.recs.push(RecRecord {
                    id:       id.clone(),
                    label:    label.clone(),
                    position: slot.position,
                    prefix:   format!("{}_{}", slot.state, label),
                    state:    layout.rec_entry_state(index)?,
                    next:     layout.follow(index)?,
                });
            }
            Node::Continue { id, label } => {
                projection.continues.push(ContinueRecord {
                    id:       id.clone(),
                    label:    label.clone(),
                    position: slot.position,
                    state:    slot.state.clone(),
                    target:   layout.entry(index)?,
                });
            }
            Node::Do { name, roles } => {
                projection.calls.push(CallRecord {
                    name:     name.clone(),
                    roles:    roles.clone(),
                    position: slot.position,
                    state:    slot.state.clone(),
                    next:     layout.follow(index)?,
                });
            }
        }
    }

    let signals: Vec<(NodeId, NodeId)> = projection
        .choices
        .iter()
        .flat_map(|choice| {
            choice
                .branches
                .iter()
                .filter_map(move |branch| branch.signal.as_ref().map(|s| (s.id.clone(), choice.id.clone())))
        })
        .collect();
    for (message, choice) in signals {
        if let Some(record) = projection.messages.iter_mut().find(|m| m.id == message) {
            record.choice_signal = Some(choice);
        }
    }

    tracing::debug!(
        local = %local.name,
        protagonist = %local.protagonist,
        steps = layout.slots.len(),
        "projected local protocol"
    );
    Ok(projection)
}
