//! Buffering for protocol messages that arrive ahead of their unit.
//!
//! Transports are allowed to reorder messages across different gates, so a
//! session keeps an [`Inbox`] of envelopes addressed to units (or rounds)
//! that are not ready to consume them yet. The inbox is bounded: a peer
//! that floods us with far-future messages exhausts the bound and the
//! session aborts instead of growing without limit.

use std::collections::{BTreeMap, VecDeque};

use crate::message::{Payload, UnitId};

/// The inbox bound was exceeded; the session must abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InboxFull {
    pub(crate) limit: usize,
}

/// A bounded store of out-of-order round payloads, keyed by unit.
#[derive(Debug)]
pub(crate) struct Inbox {
    buffered: BTreeMap<UnitId, VecDeque<(u8, Payload)>>,
    len: usize,
    limit: usize,
}

impl Inbox {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buffered: BTreeMap::new(),
            len: 0,
            limit,
        }
    }

    /// The number of currently buffered payloads.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Buffers a payload for a unit that cannot consume it yet.
    pub(crate) fn buffer(
        &mut self,
        unit: UnitId,
        round: u8,
        payload: Payload,
    ) -> Result<(), InboxFull> {
        if self.len >= self.limit {
            return Err(InboxFull { limit: self.limit });
        }
        self.len += 1;
        self.buffered
            .entry(unit)
            .or_default()
            .push_back((round, payload));
        Ok(())
    }

    /// Takes the buffered payload for `unit` at exactly `round`, if present.
    pub(crate) fn take(&mut self, unit: UnitId, round: u8) -> Option<Payload> {
        let queue = self.buffered.get_mut(&unit)?;
        let position = queue.iter().position(|(r, _)| *r == round)?;
        let (_, payload) = queue.remove(position)?;
        if queue.is_empty() {
            self.buffered.remove(&unit);
        }
        self.len -= 1;
        Some(payload)
    }

    /// Drops everything still buffered for a completed unit, returning how
    /// many payloads were discarded.
    pub(crate) fn purge(&mut self, unit: UnitId) -> usize {
        let Some(queue) = self.buffered.remove(&unit) else {
            return 0;
        };
        self.len -= queue.len();
        queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masks() -> Payload {
        Payload::InputMasks(vec![true])
    }

    #[test]
    fn takes_by_unit_and_round() {
        let mut inbox = Inbox::new(8);
        inbox.buffer(UnitId::Gate(1), 2, masks()).unwrap();
        inbox.buffer(UnitId::Gate(1), 0, masks()).unwrap();
        inbox.buffer(UnitId::Gate(2), 0, masks()).unwrap();
        assert!(inbox.take(UnitId::Gate(1), 1).is_none());
        assert!(inbox.take(UnitId::Gate(1), 0).is_some());
        assert!(inbox.take(UnitId::Gate(1), 2).is_some());
        assert!(inbox.take(UnitId::Gate(1), 0).is_none());
        assert_eq!(inbox.len(), 1);
    }

    #[test]
    fn enforces_the_bound() {
        let mut inbox = Inbox::new(2);
        inbox.buffer(UnitId::Gate(0), 0, masks()).unwrap();
        inbox.buffer(UnitId::Gate(1), 0, masks()).unwrap();
        assert_eq!(
            inbox.buffer(UnitId::Gate(2), 0, masks()),
            Err(InboxFull { limit: 2 })
        );
        // Taking frees capacity again.
        inbox.take(UnitId::Gate(0), 0).unwrap();
        inbox.buffer(UnitId::Gate(2), 0, masks()).unwrap();
    }

    #[test]
    fn purge_discards_leftovers() {
        let mut inbox = Inbox::new(8);
        inbox.buffer(UnitId::Output(0), 1, masks()).unwrap();
        inbox.buffer(UnitId::Output(0), 1, masks()).unwrap();
        assert_eq!(inbox.purge(UnitId::Output(0)), 2);
        assert_eq!(inbox.len(), 0);
        assert_eq!(inbox.purge(UnitId::Output(0)), 0);
    }
}
