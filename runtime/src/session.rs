use std::fmt;
use std::sync::Arc;

use crate::{error::SessionError, join::JoinBarrier, mesh::Endpoint};

/// The handle every generated state wraps.
///
/// Besides the endpoint, a session remembers which parallel branches it is
/// running inside, innermost last, so finishing a branch signals the right barrier.
pub struct Session<M> {
    endpoint: Endpoint<M>,
    joins:    Vec<(Arc<JoinBarrier>, usize)>,
}

impl<M> fmt::Debug for Session<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.endpoint.role())
            .field("depth", &self.joins.len())
            .finish()
    }
}

impl<M> Session<M> {
    pub fn new(endpoint: Endpoint<M>) -> Self {
        Session { endpoint, joins: Vec::new() }
    }

    pub fn role(&self) -> &str {
        self.endpoint.role()
    }

    pub fn send(&self, to: &str, label: &str, msg: M) -> Result<(), SessionError> {
        self.endpoint.send(to, label, msg)
    }

    pub fn recv(&self, from: &str, label: &str) -> Result<M, SessionError> {
        self.endpoint.recv(from, label)
    }

    pub fn wait_any(&self, from: &str, labels: &[&str]) -> Result<usize, SessionError> {
        self.endpoint.wait_any(from, labels)
    }

    /// Splits the session into `N` branch sessions and the joiner that waits for them.
    pub fn fork<const N: usize>(self) -> (Joiner<M>, [Session<M>; N]) {
        let barrier = Arc::new(JoinBarrier::new(N));
        let branches = std::array::from_fn(|branch| {
            let mut joins = self.joins.clone();
            joins.push((Arc::clone(&barrier), branch));
            Session {
                endpoint: self.endpoint.clone(),
                joins,
            }
        });
        tracing::trace!(role = %self.role(), branches = N, "forked session");
        (Joiner { session: self, barrier }, branches)
    }

    /// Marks the innermost parallel branch as complete.
    pub fn complete_branch(mut self) -> Result<BranchDone, SessionError> {
        let (barrier, branch) = self.joins.pop().ok_or(SessionError::JoinMismatch)?;
        barrier.signal(branch)?;
        tracing::trace!(role = %self.role(), branch, "branch complete");
        Ok(BranchDone { branch })
    }

    pub fn finish(self) -> Result<Finished<M>, SessionError> {
        if !self.joins.is_empty() {
            return Err(SessionError::JoinMismatch);
        }
        tracing::trace!(role = %self.role(), "session finished");
        Ok(Finished { session: self })
    }
}

/// Holds the forking session until every branch has completed.
pub struct Joiner<M> {
    session: Session<M>,
    barrier: Arc<JoinBarrier>,
}

impl<M> fmt::Debug for Joiner<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joiner")
            .field("session", &self.session)
            .field("barrier", &self.barrier)
            .finish()
    }
}

impl<M> Joiner<M> {
    pub fn ready(&self) -> bool {
        self.barrier.try_join().is_ok()
    }

    pub fn try_join(&self) -> Result<(), SessionError> {
        self.barrier.try_join()
    }

    /// Returns the session once every branch has completed; errors instead of waiting.
    pub fn join(self) -> Result<Session<M>, SessionError> {
        self.barrier.try_join()?;
        Ok(self.session)
    }
}

/// Proof that a parallel branch ran to its end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchDone {
    branch: usize,
}

impl BranchDone {
    pub fn branch(&self) -> usize {
        self.branch
    }
}

/// Terminal state of a completed protocol.
#[derive(Debug)]
pub struct Finished<M> {
    session: Session<M>,
}

impl<M> Finished<M> {
    pub fn role(&self) -> &str {
        self.session.role()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Mesh;
    use std::thread;

    fn session(mesh: &Mesh<u32>, role: &str) -> Session<u32> {
        Session::new(mesh.endpoint(role).unwrap())
    }

    #[test]
    fn test_fork_join() {
        let mesh = Mesh::new(["A", "B"]);
        let (joiner, [left, right]) = session(&mesh, "A").fork::<2>();
        assert!(!joiner.ready());

        let handle = thread::spawn(move || {
            left.send("B", "x", 1).unwrap();
            left.complete_branch().unwrap()
        });
        assert_eq!(handle.join().unwrap().branch(), 0);
        assert_eq!(joiner.try_join(), Err(SessionError::BranchIncomplete { branch: 1 }));

        right.complete_branch().unwrap();
        let joined = joiner.join().unwrap();
        assert_eq!(joined.finish().unwrap().role(), "A");
        assert_eq!(session(&mesh, "B").recv("A", "x").unwrap(), 1);
    }

    #[test]
    fn test_join_does_not_block() {
        let mesh = Mesh::new(["A"]);
        let (joiner, [_pending]) = session(&mesh, "A").fork::<1>();
        assert_eq!(joiner.join().unwrap_err(), SessionError::BranchIncomplete { branch: 0 });
    }

    #[test]
    fn test_nested_fork_signals_innermost() {
        let mesh = Mesh::new(["A"]);
        let (outer, [branch]) = session(&mesh, "A").fork::<1>();
        let (inner, [nested]) = branch.fork::<1>();
        nested.complete_branch().unwrap();
        assert!(inner.ready());
        assert!(!outer.ready());
        inner.join().unwrap().complete_branch().unwrap();
        assert!(outer.ready());
    }

    #[test]
    fn test_complete_outside_branch() {
        let mesh = Mesh::new(["A"]);
        assert_eq!(session(&mesh, "A").complete_branch().unwrap_err(), SessionError::JoinMismatch);
        let (_joiner, [branch]) = session(&mesh, "A").fork::<1>();
        assert_eq!(branch.finish().unwrap_err(), SessionError::JoinMismatch);
    }
}
