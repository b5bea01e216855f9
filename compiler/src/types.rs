use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Protocol {
    pub module: Option<String>,
    pub types:  Vec<TypeImport>,
    pub locals: Vec<Local>,
}

/// An external payload type, e.g. `type <java> "java.lang.Integer" from "rt.jar" as Int;`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeImport {
    pub schema:    String,
    pub source:    String,
    pub file_name: String,
    pub alias:     Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Role {
    pub name: String,
}

/// One role's view of one protocol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Local {
    pub name:         String,
    pub protagonist:  String,
    pub roles:        Vec<Role>,
    pub conversation: Conversation,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Conversation {
    pub nodes: Vec<Node>,
}

/// Identifier unique among every node of one Local.
///
/// The counter is the last segment of the rendered form, so two ids can never
/// render identically even when labels contain underscores or digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId {
    pub local: String,
    pub label: String,
    pub seq:   u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.local, self.label, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Node {
    Message {
        id:       NodeId,
        name:     String,
        from:     String,
        to:       String,
        payloads: Vec<String>,
    },
    Choice {
        id:       NodeId,
        chooser:  String,
        branches: Vec<Conversation>,
    },
    Par {
        id:       NodeId,
        branches: Vec<Conversation>,
    },
    Rec {
        id:    NodeId,
        label: String,
        body:  Conversation,
    },
    /// Reference to another protocol fragment; kept opaque.
    Do {
        name:  String,
        roles: Vec<String>,
    },
    Continue {
        id:    NodeId,
        label: String,
    },
}

impl Node {
    pub fn id(&self) -> Option<&NodeId> {
        match self {
            Node::Message { id, .. }
            | Node::Choice { id, .. }
            | Node::Par { id, .. }
            | Node::Rec { id, .. }
            | Node::Continue { id, .. } => Some(id),
            Node::Do { .. } => None,
        }
    }

    pub fn id_mut(&mut self) -> Option<&mut NodeId> {
        match self {
            Node::Message { id, .. }
            | Node::Choice { id, .. }
            | Node::Par { id, .. }
            | Node::Rec { id, .. }
            | Node::Continue { id, .. } => Some(id),
            Node::Do { .. } => None,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Node::Message { .. }  => StepKind::Message,
            Node::Choice { .. }   => StepKind::Choice,
            Node::Par { .. }      => StepKind::Par,
            Node::Rec { .. }      => StepKind::Rec,
            Node::Do { .. }       => StepKind::Do,
            Node::Continue { .. } => StepKind::Continue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Message,
    Choice,
    Par,
    Rec,
    Do,
    Continue,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StepKind::Message  => "message",
            StepKind::Choice   => "choice",
            StepKind::Par      => "par",
            StepKind::Rec      => "rec",
            StepKind::Do       => "do",
            StepKind::Continue => "continue",
        };
        f.write_str(text)
    }
}
