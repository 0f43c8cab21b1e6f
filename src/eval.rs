//! The interactive sub-protocol run for each unit of the schedule.
//!
//! Wires carry XOR shares: each party holds one boolean per wire and the
//! cleartext value is the XOR of both. XOR and NOT gates are evaluated
//! locally by the session; the units here cover the three interactions:
//!
//! * input seeding: the owner masks its bits and ships the masks as the
//!   peer's shares (one round),
//! * AND gates: a 1-of-4 [oblivious transfer](crate::ot) in which the
//!   receiver's choice is its two input shares and the sender's table row
//!   for choice `(x_r, y_r)` is `r XOR ((x_s XOR x_r) AND (y_s XOR y_r))`,
//!   with `r` the sender's fresh output share (three rounds),
//! * output reveal: commit-then-open share exchange so neither party can
//!   pick its opening after seeing the other's (two rounds per direction).
//!
//! Every unit is a small sans-io state machine: it consumes exactly the
//! round payloads it expects and returns outbound envelopes plus resolved
//! wire shares. The first roster party acts as the OT sender for all AND
//! gates; both parties run the reveal symmetrically.

use std::ops::Range;

use rand::RngCore;
use rand_chacha::ChaCha20Rng;
use subtle::ConstantTimeEq;

use crate::circuit::bits_to_value;
use crate::message::{Envelope, Payload, UnitId};
use crate::ot::{OtError, OtReceiver, OtSender};

/// A fatal failure inside a unit, mapped to a session fault by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitError {
    /// The payload cannot be the product of duplication or reordering.
    Malformed(String),
    /// A cryptographic check failed.
    Crypto(String),
}

impl From<OtError> for UnitError {
    fn from(e: OtError) -> Self {
        match e {
            OtError::InvalidPoint => UnitError::Malformed(e.to_string()),
            OtError::Encryption | OtError::Decryption => UnitError::Crypto(e.to_string()),
        }
    }
}

/// What a unit produced while handling a step.
#[derive(Debug, Default)]
pub(crate) struct UnitOutput {
    /// Outbound envelopes for the peer, in emit order.
    pub(crate) messages: Vec<Envelope>,
    /// Wire shares resolved by this step.
    pub(crate) resolved: Vec<(usize, bool)>,
    /// A fully revealed output value, as `(output binding index, value)`.
    pub(crate) revealed: Option<(u32, u64)>,
    /// Whether the unit finished with this step.
    pub(crate) done: bool,
}

/// One interactive unit of the schedule.
pub(crate) enum Unit {
    InputOwner(InputOwner),
    InputPeer(InputPeer),
    AndSender(AndSender),
    AndReceiver(AndReceiver),
    Reveal(Reveal),
}

impl Unit {
    /// The round this unit currently expects from the peer, if any.
    pub(crate) fn expected_round(&self) -> Option<u8> {
        match self {
            Unit::InputOwner(_) => None,
            Unit::InputPeer(_) => Some(0),
            Unit::AndSender(u) => u.sent_point.then_some(1),
            Unit::AndReceiver(u) => Some(if u.ot.is_some() { 2 } else { 0 }),
            Unit::Reveal(u) => Some(if u.peer_committed { 1 } else { 0 }),
        }
    }

    /// Runs the unit's creation-time step (which may already emit messages).
    pub(crate) fn start(&mut self, rng: &mut ChaCha20Rng) -> Result<UnitOutput, UnitError> {
        match self {
            Unit::InputOwner(u) => u.start(rng),
            Unit::AndSender(u) => u.start(rng),
            Unit::Reveal(u) => u.start(rng),
            Unit::InputPeer(_) | Unit::AndReceiver(_) => Ok(UnitOutput::default()),
        }
    }

    /// Feeds the expected round's payload into the unit.
    pub(crate) fn on_round(
        &mut self,
        round: u8,
        payload: Payload,
        rng: &mut ChaCha20Rng,
    ) -> Result<UnitOutput, UnitError> {
        debug_assert_eq!(self.expected_round(), Some(round));
        match self {
            Unit::InputOwner(_) => Err(UnitError::Malformed(
                "input owner expects no rounds".into(),
            )),
            Unit::InputPeer(u) => u.on_masks(payload),
            Unit::AndSender(u) => u.on_choice(payload, rng),
            Unit::AndReceiver(u) => u.on_round(round, payload, rng),
            Unit::Reveal(u) => u.on_round(round, payload),
        }
    }
}

fn unexpected(unit: UnitId, payload: &Payload) -> UnitError {
    UnitError::Malformed(format!("{:?} cannot consume {}", unit, payload.kind()))
}

/// Seeds the shares of an input binding this party owns.
pub(crate) struct InputOwner {
    pub(crate) unit: UnitId,
    pub(crate) wires: Range<usize>,
    pub(crate) bits: Vec<bool>,
}

impl InputOwner {
    fn start(&mut self, rng: &mut ChaCha20Rng) -> Result<UnitOutput, UnitError> {
        let masks: Vec<bool> = self.bits.iter().map(|_| random_bool(rng)).collect();
        let resolved = self
            .wires
            .clone()
            .zip(self.bits.iter().zip(&masks))
            .map(|(wire, (&bit, &mask))| (wire, bit ^ mask))
            .collect();
        Ok(UnitOutput {
            messages: vec![Envelope {
                unit: self.unit,
                round: 0,
                payload: Payload::InputMasks(masks),
            }],
            resolved,
            revealed: None,
            done: true,
        })
    }
}

/// Receives the shares of an input binding the peer owns.
pub(crate) struct InputPeer {
    pub(crate) unit: UnitId,
    pub(crate) wires: Range<usize>,
}

impl InputPeer {
    fn on_masks(&mut self, payload: Payload) -> Result<UnitOutput, UnitError> {
        let masks = match payload {
            Payload::InputMasks(masks) => masks,
            other => return Err(unexpected(self.unit, &other)),
        };
        if masks.len() != self.wires.len() {
            return Err(UnitError::Malformed(format!(
                "{:?}: expected {} input shares, got {}",
                self.unit,
                self.wires.len(),
                masks.len()
            )));
        }
        Ok(UnitOutput {
            resolved: self.wires.clone().zip(masks).collect(),
            done: true,
            ..UnitOutput::default()
        })
    }
}

/// The OT sender side of an AND gate (the first roster party).
pub(crate) struct AndSender {
    pub(crate) unit: UnitId,
    pub(crate) gate: u32,
    pub(crate) x_share: bool,
    pub(crate) y_share: bool,
    pub(crate) out_wire: usize,
    ot: Option<OtSender>,
    sent_point: bool,
}

impl AndSender {
    pub(crate) fn new(unit: UnitId, gate: u32, x_share: bool, y_share: bool, out_wire: usize) -> Self {
        Self {
            unit,
            gate,
            x_share,
            y_share,
            out_wire,
            ot: None,
            sent_point: false,
        }
    }

    fn start(&mut self, rng: &mut ChaCha20Rng) -> Result<UnitOutput, UnitError> {
        let (ot, point) = OtSender::new(self.gate, rng);
        self.ot = Some(ot);
        self.sent_point = true;
        Ok(UnitOutput {
            messages: vec![Envelope {
                unit: self.unit,
                round: 0,
                payload: Payload::OtPoint(point),
            }],
            ..UnitOutput::default()
        })
    }

    fn on_choice(&mut self, payload: Payload, rng: &mut ChaCha20Rng) -> Result<UnitOutput, UnitError> {
        let point = match payload {
            Payload::OtChoice(point) => point,
            other => return Err(unexpected(self.unit, &other)),
        };
        let Some(ot) = self.ot.take() else {
            return Err(UnitError::Malformed(format!(
                "{:?}: choice before transfer setup",
                self.unit
            )));
        };
        let r = random_bool(rng);
        let mut rows = [false; 4];
        for (c, row) in rows.iter_mut().enumerate() {
            let x_r = c >> 1 & 1 == 1;
            let y_r = c & 1 == 1;
            *row = r ^ ((self.x_share ^ x_r) & (self.y_share ^ y_r));
        }
        let table = ot.seal_table(&point, rows)?;
        Ok(UnitOutput {
            messages: vec![Envelope {
                unit: self.unit,
                round: 2,
                payload: Payload::OtTable(table),
            }],
            resolved: vec![(self.out_wire, r)],
            revealed: None,
            done: true,
        })
    }
}

/// The OT receiver side of an AND gate (the second roster party).
pub(crate) struct AndReceiver {
    pub(crate) unit: UnitId,
    pub(crate) gate: u32,
    pub(crate) x_share: bool,
    pub(crate) y_share: bool,
    pub(crate) out_wire: usize,
    ot: Option<OtReceiver>,
}

impl AndReceiver {
    pub(crate) fn new(unit: UnitId, gate: u32, x_share: bool, y_share: bool, out_wire: usize) -> Self {
        Self {
            unit,
            gate,
            x_share,
            y_share,
            out_wire,
            ot: None,
        }
    }

    fn on_round(
        &mut self,
        round: u8,
        payload: Payload,
        rng: &mut ChaCha20Rng,
    ) -> Result<UnitOutput, UnitError> {
        match (round, payload) {
            (0, Payload::OtPoint(point)) => {
                let choice = (self.x_share as u8) << 1 | self.y_share as u8;
                let (ot, blinded) = OtReceiver::new(self.gate, choice, &point, rng)?;
                self.ot = Some(ot);
                Ok(UnitOutput {
                    messages: vec![Envelope {
                        unit: self.unit,
                        round: 1,
                        payload: Payload::OtChoice(blinded),
                    }],
                    ..UnitOutput::default()
                })
            }
            (2, Payload::OtTable(table)) => {
                let Some(ot) = self.ot.take() else {
                    return Err(UnitError::Malformed(format!(
                        "{:?}: table before transfer setup",
                        self.unit
                    )));
                };
                let share = ot.open_table(&table)?;
                Ok(UnitOutput {
                    resolved: vec![(self.out_wire, share)],
                    done: true,
                    ..UnitOutput::default()
                })
            }
            (_, payload) => Err(unexpected(self.unit, &payload)),
        }
    }
}

/// The commit-then-open reveal of one named output.
pub(crate) struct Reveal {
    pub(crate) unit: UnitId,
    pub(crate) index: u32,
    pub(crate) shares: Vec<bool>,
    nonce: [u8; 32],
    peer_committed: bool,
    peer_commitment: [u8; 32],
}

impl Reveal {
    pub(crate) fn new(unit: UnitId, index: u32, shares: Vec<bool>) -> Self {
        Self {
            unit,
            index,
            shares,
            nonce: [0; 32],
            peer_committed: false,
            peer_commitment: [0; 32],
        }
    }

    fn start(&mut self, rng: &mut ChaCha20Rng) -> Result<UnitOutput, UnitError> {
        rng.fill_bytes(&mut self.nonce);
        let commitment = commit(self.index, &self.shares, &self.nonce);
        Ok(UnitOutput {
            messages: vec![Envelope {
                unit: self.unit,
                round: 0,
                payload: Payload::OutputCommit(commitment),
            }],
            ..UnitOutput::default()
        })
    }

    fn on_round(&mut self, round: u8, payload: Payload) -> Result<UnitOutput, UnitError> {
        match (round, payload) {
            (0, Payload::OutputCommit(commitment)) => {
                self.peer_commitment = commitment;
                self.peer_committed = true;
                // Only open once the peer is committed.
                Ok(UnitOutput {
                    messages: vec![Envelope {
                        unit: self.unit,
                        round: 1,
                        payload: Payload::OutputOpen {
                            shares: self.shares.clone(),
                            nonce: self.nonce,
                        },
                    }],
                    ..UnitOutput::default()
                })
            }
            (1, Payload::OutputOpen { shares, nonce }) => {
                if shares.len() != self.shares.len() {
                    return Err(UnitError::Malformed(format!(
                        "{:?}: expected {} output shares, got {}",
                        self.unit,
                        self.shares.len(),
                        shares.len()
                    )));
                }
                let expected = commit(self.index, &shares, &nonce);
                if !bool::from(expected.ct_eq(&self.peer_commitment)) {
                    return Err(UnitError::Crypto(format!(
                        "{:?}: output opening does not match commitment",
                        self.unit
                    )));
                }
                let bits: Vec<bool> = self
                    .shares
                    .iter()
                    .zip(shares)
                    .map(|(&mine, theirs)| mine ^ theirs)
                    .collect();
                Ok(UnitOutput {
                    revealed: Some((self.index, bits_to_value(&bits))),
                    done: true,
                    ..UnitOutput::default()
                })
            }
            (_, payload) => Err(unexpected(self.unit, &payload)),
        }
    }
}

fn commit(index: u32, shares: &[bool], nonce: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key("duotune v1 output reveal");
    hasher.update(&index.to_le_bytes());
    let bytes: Vec<u8> = shares.iter().map(|&b| b as u8).collect();
    hasher.update(&bytes);
    hasher.update(nonce);
    *hasher.finalize().as_bytes()
}

fn random_bool(rng: &mut ChaCha20Rng) -> bool {
    rng.next_u32() & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn step(unit: &mut Unit, envelope: Envelope, rng: &mut ChaCha20Rng) -> UnitOutput {
        unit.on_round(envelope.round, envelope.payload, rng).unwrap()
    }

    #[test]
    fn and_units_multiply_shares() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        for x in [false, true] {
            for y in [false, true] {
                // Random share split of the cleartext inputs.
                let x0 = random_bool(&mut rng);
                let y0 = random_bool(&mut rng);
                let (x1, y1) = (x ^ x0, y ^ y0);
                let id = UnitId::Gate(5);
                let mut sender = Unit::AndSender(AndSender::new(id, 5, x0, y0, 9));
                let mut receiver = Unit::AndReceiver(AndReceiver::new(id, 5, x1, y1, 9));

                let mut out = sender.start(&mut rng).unwrap();
                let point = out.messages.remove(0);
                let mut out = step(&mut receiver, point, &mut rng);
                let choice = out.messages.remove(0);
                let mut out = step(&mut sender, choice, &mut rng);
                let s0 = out.resolved[0].1;
                assert!(out.done);
                let table = out.messages.remove(0);
                let out = step(&mut receiver, table, &mut rng);
                let s1 = out.resolved[0].1;
                assert!(out.done);
                assert_eq!(s0 ^ s1, x & y);
            }
        }
    }

    #[test]
    fn reveal_combines_and_checks_commitments() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let id = UnitId::Output(0);
        let mine = vec![true, false, true];
        let theirs = vec![true, true, false];
        let mut a = Unit::Reveal(Reveal::new(id, 0, mine.clone()));
        let mut b = Unit::Reveal(Reveal::new(id, 0, theirs.clone()));
        let mut a_out = a.start(&mut rng).unwrap();
        let mut b_out = b.start(&mut rng).unwrap();
        let mut a_open = step(&mut a, b_out.messages.remove(0), &mut rng);
        let mut b_open = step(&mut b, a_out.messages.remove(0), &mut rng);
        let a_final = step(&mut a, b_open.messages.remove(0), &mut rng);
        let b_final = step(&mut b, a_open.messages.remove(0), &mut rng);
        // Shares XOR to (false, true, true), LSB first.
        assert_eq!(a_final.revealed, Some((0, 0b110)));
        assert_eq!(b_final.revealed, Some((0, 0b110)));
    }

    #[test]
    fn reveal_rejects_forged_opening() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let id = UnitId::Output(1);
        let mut a = Unit::Reveal(Reveal::new(id, 1, vec![false]));
        let mut b = Unit::Reveal(Reveal::new(id, 1, vec![true]));
        let mut b_out = b.start(&mut rng).unwrap();
        a.start(&mut rng).unwrap();
        step(&mut a, b_out.messages.remove(0), &mut rng);
        // The peer opens with a flipped share not matching its commitment.
        let forged = Envelope {
            unit: id,
            round: 1,
            payload: Payload::OutputOpen {
                shares: vec![false],
                nonce: [0; 32],
            },
        };
        let err = a.on_round(1, forged.payload, &mut rng).unwrap_err();
        assert!(matches!(err, UnitError::Crypto(_)));
    }
}
