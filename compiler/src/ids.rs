use std::sync::Mutex;

use crate::types::NodeId;

/// Hands out node identifiers for one Local.
///
/// The counter sits behind a mutex so branch tasks parsed concurrently can
/// share one generator by reference; every request is serialized, and a value
/// is never handed out twice.
#[derive(Debug)]
pub struct IdGenerator {
    local:   String,
    counter: Mutex<u32>,
}

impl IdGenerator {
    pub fn new(local: &str) -> Self {
        IdGenerator {
            local:   local.to_string(),
            counter: Mutex::new(0),
        }
    }

    pub fn next_id(&self, label: &str) -> NodeId {
        // A poisoned lock still holds a valid counter; recover it rather than abort.
        let mut counter = match self.counter.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let seq = *counter;
        *counter += 1;
        NodeId {
            local: self.local.clone(),
            label: label.to_string(),
            seq,
        }
    }

    /// Number of identifiers handed out so far.
    pub fn issued(&self) -> u32 {
        match self.counter.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
