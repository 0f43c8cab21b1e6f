//! The wire format exchanged between two session engines.
//!
//! Every protocol message is a bincode-encoded [`Envelope`] addressing one
//! interactive unit of the shared schedule at one round. The encoding must
//! be identical across engine implementations for interoperability, so the
//! types here are the format's definition: a change to them is a wire
//! format change.

use serde::{Deserialize, Serialize};

/// Addresses one interactive unit of the deterministic schedule.
///
/// Units are derived from the compiled circuit in declared order: one per
/// input binding, one per AND gate (indexed by gate position), one per
/// output binding. The derived `Ord` matches schedule order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) enum UnitId {
    /// Seeding of the input binding at this index.
    Input(u32),
    /// The oblivious transfer for the AND gate at this gate index.
    Gate(u32),
    /// The reveal of the output binding at this index.
    Output(u32),
}

/// One protocol message: a round payload addressed to a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) unit: UnitId,
    pub(crate) round: u8,
    pub(crate) payload: Payload,
}

/// The per-round payloads of the interactive sub-protocols.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Payload {
    /// Input seeding round 0: the peer's shares of the owner's input wires.
    InputMasks(Vec<bool>),
    /// AND round 0, sender to receiver: the OT public point.
    OtPoint([u8; 32]),
    /// AND round 1, receiver to sender: the blinded choice point.
    OtChoice([u8; 32]),
    /// AND round 2, sender to receiver: the four sealed table rows.
    OtTable([Vec<u8>; 4]),
    /// Output reveal round 0: commitment to the sender's output shares.
    OutputCommit([u8; 32]),
    /// Output reveal round 1: the opening for the commitment.
    OutputOpen {
        /// The sender's shares of the output wires, LSB first.
        shares: Vec<bool>,
        /// The commitment nonce.
        nonce: [u8; 32],
    },
}

impl Payload {
    /// A short name for diagnostics.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Payload::InputMasks(_) => "input masks",
            Payload::OtPoint(_) => "OT point",
            Payload::OtChoice(_) => "OT choice",
            Payload::OtTable(_) => "OT table",
            Payload::OutputCommit(_) => "output commitment",
            Payload::OutputOpen { .. } => "output opening",
        }
    }
}

/// Serializes an envelope for the transport.
pub(crate) fn encode(envelope: &Envelope) -> Result<Vec<u8>, String> {
    bincode::serialize(envelope).map_err(|e| format!("{e:?}"))
}

/// Deserializes an inbound envelope.
pub(crate) fn decode(bytes: &[u8]) -> Result<Envelope, String> {
    bincode::deserialize(bytes).map_err(|e| format!("{e:?}"))
}
