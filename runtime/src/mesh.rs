use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::executor::block_on;
use futures::future::poll_fn;
use futures::StreamExt;

use crate::error::SessionError;

/// `(from, to)`
type Pair = (String, String);

struct Envelope<M> {
    label: String,
    msg:   M,
}

/// Receiving end of one `(from, to)` channel.
///
/// Messages pulled off the channel but not yet taken wait in `pending`, in
/// arrival order. The channel only remembers the last task that polled it, so
/// every blocked task also leaves its waker in `waiting` and is woken whenever
/// `pending` changes.
struct Inbox<M> {
    rx:      UnboundedReceiver<Envelope<M>>,
    pending: VecDeque<Envelope<M>>,
    waiting: Vec<Waker>,
}

impl<M> Inbox<M> {
    fn new(rx: UnboundedReceiver<Envelope<M>>) -> Self {
        Inbox {
            rx,
            pending: VecDeque::new(),
            waiting: Vec::new(),
        }
    }

    fn wake_all(&mut self) {
        for waker in self.waiting.drain(..) {
            waker.wake();
        }
    }

    /// Runs `select` over the pending messages, pulling more off the channel
    /// until it finds something.
    fn poll_select<T, F>(&mut self, cx: &mut Context<'_>, mut select: F, from: &str) -> Poll<Result<T, SessionError>>
    where
        F: FnMut(&mut VecDeque<Envelope<M>>) -> Option<T>,
    {
        loop {
            if let Some(found) = select(&mut self.pending) {
                self.wake_all();
                return Poll::Ready(Ok(found));
            }
            match self.rx.poll_next_unpin(cx) {
                Poll::Ready(Some(envelope)) => {
                    self.pending.push_back(envelope);
                    self.wake_all();
                }
                Poll::Ready(None) => return Poll::Ready(Err(SessionError::Disconnected(from.to_string()))),
                Poll::Pending => {
                    self.waiting.push(cx.waker().clone());
                    return Poll::Pending;
                }
            }
        }
    }
}

struct Shared<M> {
    roles:   Vec<String>,
    senders: HashMap<Pair, UnboundedSender<Envelope<M>>>,
    inboxes: HashMap<Pair, Mutex<Inbox<M>>>,
}

/// In-process transport connecting a fixed set of roles.
///
/// Every ordered pair of roles gets one unbounded channel, so messages from
/// one peer are seen in the order they were sent whatever their labels.
/// Sending never blocks; receiving blocks until a matching message arrives.
pub struct Mesh<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Mesh<M> {
    fn clone(&self) -> Self {
        Mesh { shared: Arc::clone(&self.shared) }
    }
}

impl<M> fmt::Debug for Mesh<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mesh").field("roles", &self.shared.roles).finish()
    }
}

impl<M> Mesh<M> {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let roles: Vec<String> = roles.into_iter().map(Into::into).collect();
        let mut senders = HashMap::new();
        let mut inboxes = HashMap::new();
        for from in &roles {
            for to in &roles {
                let (tx, rx) = unbounded();
                senders.insert((from.clone(), to.clone()), tx);
                inboxes.insert((from.clone(), to.clone()), Mutex::new(Inbox::new(rx)));
            }
        }
        Mesh {
            shared: Arc::new(Shared { roles, senders, inboxes }),
        }
    }

    pub fn roles(&self) -> &[String] {
        &self.shared.roles
    }

    /// Hands out the endpoint through which `role` talks to its peers.
    pub fn endpoint(&self, role: &str) -> Result<Endpoint<M>, SessionError> {
        if !self.shared.roles.iter().any(|r| r == role) {
            return Err(SessionError::UnknownRole(role.to_string()));
        }
        Ok(Endpoint {
            role:   role.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }
}

fn pair(from: &str, to: &str) -> Pair {
    (from.to_string(), to.to_string())
}

/// One role's handle on a [`Mesh`].
pub struct Endpoint<M> {
    role:   String,
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Endpoint<M> {
    fn clone(&self) -> Self {
        Endpoint {
            role:   self.role.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M> fmt::Debug for Endpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint").field("role", &self.role).finish()
    }
}

impl<M> Endpoint<M> {
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Queues `msg` for `to` under `label`. Never blocks on the receiver.
    pub fn send(&self, to: &str, label: &str, msg: M) -> Result<(), SessionError> {
        let sender = self
            .shared
            .senders
            .get(&pair(&self.role, to))
            .ok_or_else(|| SessionError::UnknownRole(to.to_string()))?;
        sender
            .unbounded_send(Envelope { label: label.to_string(), msg })
            .map_err(|_| SessionError::Disconnected(self.role.clone()))?;
        tracing::trace!(from = %self.role, to, label, "message sent");
        Ok(())
    }

    /// Blocks on the inbox from `from` until `select` picks something out of it.
    fn select<T, F>(&self, from: &str, mut select: F) -> Result<T, SessionError>
    where
        F: FnMut(&mut VecDeque<Envelope<M>>) -> Option<T>,
    {
        let inbox = self
            .shared
            .inboxes
            .get(&pair(from, &self.role))
            .ok_or_else(|| SessionError::UnknownRole(from.to_string()))?;
        block_on(poll_fn(|cx| match inbox.lock() {
            Ok(mut inbox) => inbox.poll_select(cx, &mut select, from),
            Err(_) => Poll::Ready(Err(SessionError::Poisoned)),
        }))
    }

    /// Blocks until a message labelled `label` arrives from `from`, then takes
    /// the oldest such message.
    pub fn recv(&self, from: &str, label: &str) -> Result<M, SessionError> {
        let msg = self.select(from, |pending| {
            let index = pending.iter().position(|envelope| envelope.label == label)?;
            pending.remove(index).map(|envelope| envelope.msg)
        })?;
        tracing::trace!(from, to = %self.role, label, "message received");
        Ok(msg)
    }

    /// Blocks until a message carrying one of `labels` arrives from `from` and
    /// returns the index of the earliest one's label. The message stays queued
    /// for the following `recv`.
    pub fn wait_any(&self, from: &str, labels: &[&str]) -> Result<usize, SessionError> {
        let index = self.select(from, |pending| {
            pending
                .iter()
                .find_map(|envelope| labels.iter().position(|label| *label == envelope.label))
        })?;
        tracing::trace!(from, to = %self.role, label = labels[index], "branch selected");
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_unknown_role() {
        let mesh: Mesh<u32> = Mesh::new(["A", "B"]);
        assert_eq!(mesh.endpoint("C").unwrap_err(), SessionError::UnknownRole("C".into()));
        let a = mesh.endpoint("A").unwrap();
        assert_eq!(a.send("C", "x", 1).unwrap_err(), SessionError::UnknownRole("C".into()));
        assert_eq!(a.recv("C", "x").unwrap_err(), SessionError::UnknownRole("C".into()));
    }

    #[test]
    fn test_recv_takes_oldest_with_label() {
        let mesh: Mesh<u32> = Mesh::new(["A", "B"]);
        let a = mesh.endpoint("A").unwrap();
        let b = mesh.endpoint("B").unwrap();
        a.send("B", "x", 1).unwrap();
        a.send("B", "y", 2).unwrap();
        a.send("B", "x", 3).unwrap();
        assert_eq!(b.recv("A", "y").unwrap(), 2);
        assert_eq!(b.recv("A", "x").unwrap(), 1);
        assert_eq!(b.recv("A", "x").unwrap(), 3);
    }

    #[test]
    fn test_recv_blocks_until_delivery() {
        let mesh: Mesh<String> = Mesh::new(["Buyer", "Seller"]);
        let buyer = mesh.endpoint("Buyer").unwrap();
        let seller = mesh.endpoint("Seller").unwrap();

        let handle = thread::spawn(move || buyer.recv("Seller", "price").unwrap());
        seller.send("Buyer", "price", "42".to_string()).unwrap();
        assert_eq!(handle.join().unwrap(), "42");
    }

    #[test]
    fn test_wait_any_does_not_consume() {
        let mesh: Mesh<u32> = Mesh::new(["A", "B"]);
        let a = mesh.endpoint("A").unwrap();
        let b = mesh.endpoint("B").unwrap();

        let handle = thread::spawn(move || {
            let index = b.wait_any("A", &["accept", "reject"]).unwrap();
            let value = b.recv("A", ["accept", "reject"][index]).unwrap();
            (index, value)
        });
        a.send("B", "reject", 7).unwrap();
        assert_eq!(handle.join().unwrap(), (1, 7));
    }

    #[test]
    fn test_wait_any_follows_arrival_order() {
        let mesh: Mesh<u32> = Mesh::new(["A", "B"]);
        let a = mesh.endpoint("A").unwrap();
        let b = mesh.endpoint("B").unwrap();

        let chooser = thread::spawn(move || {
            b.send("A", "more", 1).unwrap();
            b.send("A", "more", 2).unwrap();
            b.send("A", "stop", 3).unwrap();
        });

        let labels = ["stop", "more"];
        let mut observed = Vec::new();
        loop {
            let label = labels[a.wait_any("B", &labels).unwrap()];
            observed.push((label, a.recv("B", label).unwrap()));
            if label == "stop" {
                break;
            }
        }
        chooser.join().unwrap();
        assert_eq!(observed, vec![("more", 1), ("more", 2), ("stop", 3)]);
    }

    #[test]
    fn test_concurrent_receivers_share_a_peer() {
        let mesh: Mesh<u32> = Mesh::new(["A", "B"]);
        let a = mesh.endpoint("A").unwrap();
        let b = mesh.endpoint("B").unwrap();

        let left = {
            let b = b.clone();
            thread::spawn(move || b.recv("A", "x").unwrap())
        };
        let right = thread::spawn(move || b.recv("A", "y").unwrap());
        a.send("B", "y", 2).unwrap();
        a.send("B", "x", 1).unwrap();
        assert_eq!((left.join().unwrap(), right.join().unwrap()), (1, 2));
    }
}
