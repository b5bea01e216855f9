use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SessionError;

/// Completion flags for the branches of one parallel block.
#[derive(Debug)]
pub struct JoinBarrier {
    done: Vec<AtomicBool>,
}

impl JoinBarrier {
    pub fn new(branches: usize) -> Self {
        JoinBarrier {
            done: (0..branches).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn signal(&self, branch: usize) -> Result<(), SessionError> {
        let flag = self.done.get(branch).ok_or(SessionError::JoinMismatch)?;
        flag.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_done(&self, branch: usize) -> bool {
        self.done
            .get(branch)
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    }

    /// Checks every flag once; never waits.
    pub fn try_join(&self) -> Result<(), SessionError> {
        match (0..self.done.len()).find(|&branch| !self.is_done(branch)) {
            Some(branch) => Err(SessionError::BranchIncomplete { branch }),
            None => Ok(()),
        }
    }
}
