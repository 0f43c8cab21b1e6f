//! The outbound half of the transport boundary.
//!
//! A session never receives on its own: inbound bytes are pushed into
//! [`Session::handle_message`](crate::session::Session::handle_message) by
//! whatever owns the transport. Sending is the only direction the engine
//! initiates, through the [`Channel`] callback supplied to
//! [`join`](crate::session::join). The callback is invoked synchronously
//! while a message is produced; delivery, retries and reconnects are the
//! caller's responsibility.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::circuit::PartyId;

/// A callback used to hand outbound protocol messages to the transport.
///
/// Implementations may write to a socket, push onto a queue, or call the
/// peer directly. Returning an error signals a hard transport failure and
/// aborts the session.
pub trait Channel {
    /// The error that can occur handing a message to the transport.
    type SendError: fmt::Debug;

    /// Hands one opaque message addressed to `party` to the transport.
    fn send_bytes_to(&mut self, party: &PartyId, msg: Vec<u8>) -> Result<(), Self::SendError>;
}

impl<F, E> Channel for F
where
    F: FnMut(&PartyId, Vec<u8>) -> Result<(), E>,
    E: fmt::Debug,
{
    type SendError = E;

    fn send_bytes_to(&mut self, party: &PartyId, msg: Vec<u8>) -> Result<(), E> {
        self(party, msg)
    }
}

/// An in-process channel that queues messages for manual delivery.
///
/// Cloning yields a handle onto the same queue, so the caller can keep one
/// clone and [`drain`](QueueChannel::drain) what the session sent. Used by
/// [`simulate`](crate::session::simulate) and by tests that want to delay,
/// reorder or duplicate deliveries.
#[derive(Debug, Clone, Default)]
pub struct QueueChannel {
    queue: Arc<Mutex<VecDeque<(PartyId, Vec<u8>)>>>,
}

impl QueueChannel {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes all queued `(destination, message)` pairs, in send order.
    pub fn drain(&self) -> Vec<(PartyId, Vec<u8>)> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.drain(..).collect()
    }
}

impl Channel for QueueChannel {
    type SendError = Infallible;

    fn send_bytes_to(&mut self, party: &PartyId, msg: Vec<u8>) -> Result<(), Infallible> {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        queue.push_back((party.clone(), msg));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_preserves_send_order() {
        let handle = QueueChannel::new();
        let mut channel = handle.clone();
        let bob = PartyId::from("bob");
        channel.send_bytes_to(&bob, vec![1]).unwrap();
        channel.send_bytes_to(&bob, vec![2]).unwrap();
        let drained = handle.drain();
        assert_eq!(drained, vec![(bob.clone(), vec![1]), (bob, vec![2])]);
        assert!(handle.drain().is_empty());
    }

    #[test]
    fn closures_are_channels() {
        let mut seen = Vec::new();
        let mut channel = |party: &PartyId, msg: Vec<u8>| -> Result<(), Infallible> {
            seen.push((party.clone(), msg));
            Ok(())
        };
        channel
            .send_bytes_to(&PartyId::from("alice"), vec![7])
            .unwrap();
        assert_eq!(seen.len(), 1);
    }
}
