//! One party's live execution of the protocol for one circuit run.
//!
//! A [`Session`] is created by [`join`] and driven entirely by messages: it
//! emits outbound protocol messages through the caller's
//! [`Channel`](crate::channel::Channel) the moment they are ready (possibly
//! already during `join`), consumes inbound peer messages in whatever order
//! the transport delivers them, and resolves the revealed [`Output`] exactly
//! once through [`Session::output`].
//!
//! The session is an explicit state machine, `Running` until every named
//! output is revealed (`Completed`) or a fatal fault occurs (`Aborted`).
//! All calls are non-blocking: [`Session::handle_message`] either makes
//! progress, buffers, or discards, and returns. `&mut self` makes steps
//! atomic with respect to the session's own state; independent sessions
//! share nothing but the read-only circuit.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, QueueChannel};
use crate::circuit::{CircuitError, CompiledCircuit, Gate, InputError, Output, PartyId, PrivateInput};
use crate::eval::{AndReceiver, AndSender, InputOwner, InputPeer, Reveal, Unit, UnitError, UnitOutput};
use crate::message::{self, Envelope, Payload, UnitId};
use crate::router::Inbox;

/// Tunables of a single session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How many out-of-order messages may be buffered before the session
    /// aborts with [`Fault::BufferOverflow`].
    pub max_buffered_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_buffered_messages: 1024,
        }
    }
}

/// The lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// The session is exchanging protocol messages.
    Running,
    /// Every output has been revealed; [`Session::output`] is resolved.
    Completed,
    /// A fatal fault occurred; [`Session::output`] is rejected.
    Aborted,
}

/// A fatal session fault, surfaced exactly once through [`Session::output`].
#[derive(Debug, Clone, Error)]
pub enum Fault {
    /// The out-of-order message buffer bound was exceeded.
    #[error("more than {limit} out-of-order messages buffered")]
    BufferOverflow {
        /// The configured bound.
        limit: usize,
    },
    /// A cryptographic check failed; the peer misbehaved or the transport
    /// corrupted a payload.
    #[error("cryptographic check failed: {detail}")]
    CryptoCheckFailed {
        /// What failed.
        detail: String,
    },
    /// A payload that cannot be explained by duplication or reordering.
    #[error("malformed payload: {detail}")]
    MalformedPayload {
        /// What was wrong with it.
        detail: String,
    },
    /// The send callback reported a hard transport failure.
    #[error("transport failure: {detail}")]
    TransportFailure {
        /// The transport's error.
        detail: String,
    },
    /// The caller aborted the session.
    #[error("session cancelled: {reason}")]
    Cancelled {
        /// The caller-supplied reason.
        reason: String,
    },
}

/// An error raised synchronously by [`join`], before any message is sent.
#[derive(Debug, Error)]
pub enum JoinError {
    /// The private input record does not match the circuit's bindings.
    #[error(transparent)]
    Input(#[from] InputError),
    /// The circuit itself is invalid.
    #[error(transparent)]
    Circuit(#[from] CircuitError),
}

/// An error raised by [`Session::handle_message`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The message was discarded; the session keeps running. Raised for
    /// duplicate deliveries, messages for already-completed units and
    /// messages from senders not part of the session.
    #[error("unexpected message from {from}: {reason}")]
    UnexpectedMessage {
        /// The claimed sender.
        from: PartyId,
        /// Why the message was discarded.
        reason: String,
    },
    /// The session is `Completed` or `Aborted` and accepts no messages.
    #[error("the session no longer accepts messages")]
    SessionClosed,
    /// A fatal fault; the session is now `Aborted`.
    #[error(transparent)]
    Fault(#[from] Fault),
}

/// Counters kept for diagnostics; inspectable even after an abort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Messages discarded as [`SessionError::UnexpectedMessage`].
    pub discarded_messages: u64,
    /// Messages currently buffered for units not ready to consume them.
    pub buffered_messages: usize,
}

enum Slot {
    /// The unit's input wires are not all resolved yet.
    Pending,
    Active(Unit),
    Done,
}

enum Disposition {
    Dispatch(Payload),
    Buffer(Payload),
    Discard(&'static str),
}

/// One party's session; see the [module docs](self).
pub struct Session<C: Channel> {
    party: PartyId,
    peer: PartyId,
    my_index: usize,
    circuit: Arc<CompiledCircuit>,
    channel: C,
    rng: ChaCha20Rng,
    /// This party's share of each wire, resolved at most once.
    shares: Vec<Option<bool>>,
    /// Bits of our own inputs, consumed when their seeding unit starts.
    my_bits: BTreeMap<u32, Vec<bool>>,
    schedule: Vec<UnitId>,
    slots: BTreeMap<UnitId, Slot>,
    inbox: Inbox,
    /// Revealed outputs by name; only exposed once complete.
    revealed: BTreeMap<String, u64>,
    phase: SessionPhase,
    fault: Option<Fault>,
    result_tx: watch::Sender<Option<Result<Output, Fault>>>,
    discarded: u64,
}

impl<C: Channel> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("party", &self.party)
            .field("peer", &self.peer)
            .field("my_index", &self.my_index)
            .field("phase", &self.phase)
            .field("fault", &self.fault)
            .field("discarded", &self.discarded)
            .finish_non_exhaustive()
    }
}

/// Instantiates this party's session for one run of the circuit.
///
/// `party` must own input wires declared in the circuit and `input` must
/// carry a value for each of them; violations fail here, synchronously,
/// before anything is sent. On success the session immediately evaluates
/// everything that depends only on its own input, so the send callback may
/// already be invoked before `join` returns.
pub fn join<C: Channel>(
    circuit: Arc<CompiledCircuit>,
    party: impl Into<PartyId>,
    input: PrivateInput,
    channel: C,
) -> Result<Session<C>, JoinError> {
    join_with(circuit, party, input, channel, SessionConfig::default())
}

/// Like [`join`], with explicit [`SessionConfig`].
pub fn join_with<C: Channel>(
    circuit: Arc<CompiledCircuit>,
    party: impl Into<PartyId>,
    input: PrivateInput,
    channel: C,
    config: SessionConfig,
) -> Result<Session<C>, JoinError> {
    let party = party.into();
    circuit.validate()?;
    let input_bits = circuit.input_bits(&party, &input)?;
    let roster = circuit.parties();
    let Some(my_index) = roster.iter().position(|p| **p == party) else {
        return Err(InputError::UnknownParty(party).into());
    };
    let peer = roster[1 - my_index].clone();

    let mut schedule = Vec::new();
    for index in 0..circuit.inputs().len() {
        schedule.push(UnitId::Input(index as u32));
    }
    for (gate, kind) in circuit.gates().iter().enumerate() {
        if matches!(kind, Gate::And(_, _)) {
            schedule.push(UnitId::Gate(gate as u32));
        }
    }
    for index in 0..circuit.outputs().len() {
        schedule.push(UnitId::Output(index as u32));
    }
    let slots = schedule.iter().map(|&id| (id, Slot::Pending)).collect();

    let mut session = Session {
        shares: vec![None; circuit.wire_count()],
        my_bits: input_bits
            .into_iter()
            .map(|(index, bits)| (index as u32, bits))
            .collect(),
        party,
        peer,
        my_index,
        circuit,
        channel,
        rng: ChaCha20Rng::from_os_rng(),
        schedule,
        slots,
        inbox: Inbox::new(config.max_buffered_messages),
        revealed: BTreeMap::new(),
        phase: SessionPhase::Running,
        fault: None,
        result_tx: watch::channel(None).0,
        discarded: 0,
    };
    debug!(
        party = %session.party,
        gates = session.circuit.gates().len(),
        "joined session"
    );
    if let Err(fault) = session.pump() {
        session.abort_with(fault);
    }
    Ok(session)
}

impl<C: Channel> Session<C> {
    /// The party this session belongs to.
    pub fn party(&self) -> &PartyId {
        &self.party
    }

    /// The peer this session exchanges messages with.
    pub fn peer(&self) -> &PartyId {
        &self.peer
    }

    /// The session's lifecycle state.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The fault that aborted the session, if any.
    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            discarded_messages: self.discarded,
            buffered_messages: self.inbox.len(),
        }
    }

    /// Feeds one inbound message into the session.
    ///
    /// Never blocks: the message is either consumed (possibly cascading
    /// further evaluation and outbound sends), buffered for a unit that is
    /// not ready yet, or discarded as
    /// [`SessionError::UnexpectedMessage`] (recoverable — the session stays
    /// `Running`). Fatal faults abort the session and are also surfaced
    /// through the pending [`Session::output`].
    pub fn handle_message(&mut self, from: &PartyId, bytes: &[u8]) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Running {
            return Err(SessionError::SessionClosed);
        }
        if from != &self.peer {
            return Err(self.discard(from.clone(), "sender is not part of this session".into()));
        }
        let Envelope {
            unit,
            round,
            payload,
        } = match message::decode(bytes) {
            Ok(envelope) => envelope,
            Err(detail) => {
                return Err(self
                    .abort_with(Fault::MalformedPayload {
                        detail: format!("undecodable message: {detail}"),
                    })
                    .into());
            }
        };
        trace!(unit = ?unit, round, "inbound message");
        let disposition = match self.slots.get(&unit) {
            None => {
                // Not a unit of this circuit: cannot be duplication or
                // reordering of a message we will ever expect.
                return Err(self
                    .abort_with(Fault::MalformedPayload {
                        detail: format!("message for unknown unit {unit:?}"),
                    })
                    .into());
            }
            Some(Slot::Done) => Disposition::Discard("unit already completed"),
            Some(Slot::Pending) => Disposition::Buffer(payload),
            Some(Slot::Active(active)) => match active.expected_round() {
                Some(expected) if round == expected => Disposition::Dispatch(payload),
                Some(expected) if round < expected => {
                    Disposition::Discard("stale round, duplicate delivery")
                }
                Some(_) => Disposition::Buffer(payload),
                None => Disposition::Discard("unit expects no messages"),
            },
        };
        match disposition {
            Disposition::Dispatch(payload) => {
                let step = self
                    .dispatch(unit, round, payload)
                    .and_then(|()| self.pump());
                if let Err(fault) = step {
                    return Err(self.abort_with(fault).into());
                }
                Ok(())
            }
            Disposition::Buffer(payload) => {
                if let Err(full) = self.inbox.buffer(unit, round, payload) {
                    return Err(self
                        .abort_with(Fault::BufferOverflow { limit: full.limit })
                        .into());
                }
                trace!(unit = ?unit, "buffered out-of-order message");
                Ok(())
            }
            Disposition::Discard(reason) => Err(self.discard(self.peer.clone(), reason.into())),
        }
    }

    /// Resolves to the completed [`Output`] or the session's [`Fault`].
    ///
    /// The returned future is independent of the session borrow, never
    /// yields a value before the session completes, and every call observes
    /// the identical terminal result. No implicit timeout is applied;
    /// callers that need one should race the future themselves and call
    /// [`Session::abort`] on expiry.
    pub fn output(&self) -> impl Future<Output = Result<Output, Fault>> + Send + 'static + use<C> {
        let mut rx = self.result_tx.subscribe();
        async move {
            loop {
                let current = rx.borrow_and_update().clone();
                if let Some(result) = current {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(Fault::Cancelled {
                        reason: "session dropped before completion".into(),
                    });
                }
            }
        }
    }

    /// Non-blocking probe of the terminal result.
    pub fn try_output(&self) -> Option<Result<Output, Fault>> {
        self.result_tx.borrow().clone()
    }

    /// Aborts the session.
    ///
    /// Idempotent, and a no-op after natural completion; the pending
    /// [`Session::output`] rejects with [`Fault::Cancelled`].
    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.phase == SessionPhase::Running {
            self.abort_with(Fault::Cancelled {
                reason: reason.into(),
            });
        }
    }

    fn discard(&mut self, from: PartyId, reason: String) -> SessionError {
        self.discarded += 1;
        debug!(%from, %reason, "discarding unexpected message");
        SessionError::UnexpectedMessage { from, reason }
    }

    fn abort_with(&mut self, fault: Fault) -> Fault {
        if self.phase == SessionPhase::Running {
            warn!(party = %self.party, %fault, "session aborted");
            self.phase = SessionPhase::Aborted;
            self.fault = Some(fault.clone());
            self.result_tx.send_replace(Some(Err(fault.clone())));
        }
        fault
    }

    /// Feeds an expected round into an active unit and applies its output.
    fn dispatch(&mut self, id: UnitId, round: u8, payload: Payload) -> Result<(), Fault> {
        let Some(Slot::Active(unit)) = self.slots.get_mut(&id) else {
            return Ok(());
        };
        trace!(unit = ?id, round, "dispatching");
        let out = unit
            .on_round(round, payload, &mut self.rng)
            .map_err(unit_fault)?;
        self.finish_step(id, out)
    }

    /// Evaluates until no further progress is possible without new input:
    /// resolves local gates, activates units whose wires are ready, and
    /// drains buffered messages those units can now consume.
    fn pump(&mut self) -> Result<(), Fault> {
        loop {
            let mut progressed = false;
            let n_inputs = self.circuit.input_wire_count();
            for (k, gate) in self.circuit.gates().iter().enumerate() {
                if self.shares[n_inputs + k].is_some() {
                    continue;
                }
                let share = match *gate {
                    Gate::Xor(x, y) => match (self.shares[x], self.shares[y]) {
                        (Some(a), Some(b)) => Some(a ^ b),
                        _ => None,
                    },
                    // Only the first roster party flips, so the XOR of both
                    // shares flips exactly once.
                    Gate::Not(x) => self.shares[x].map(|a| if self.my_index == 0 { !a } else { a }),
                    Gate::And(_, _) => None,
                };
                if let Some(share) = share {
                    self.shares[n_inputs + k] = Some(share);
                    progressed = true;
                }
            }
            for index in 0..self.schedule.len() {
                let id = self.schedule[index];
                if !matches!(self.slots.get(&id), Some(Slot::Pending)) {
                    continue;
                }
                if let Some(out) = self.try_activate(id)? {
                    self.finish_step(id, out)?;
                    progressed = true;
                }
            }
            for index in 0..self.schedule.len() {
                let id = self.schedule[index];
                let Some(Slot::Active(unit)) = self.slots.get(&id) else {
                    continue;
                };
                let Some(round) = unit.expected_round() else {
                    continue;
                };
                if let Some(payload) = self.inbox.take(id, round) {
                    self.dispatch(id, round, payload)?;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        self.check_completion();
        Ok(())
    }

    /// Builds and starts the unit if its wires are resolved.
    fn try_activate(&mut self, id: UnitId) -> Result<Option<UnitOutput>, Fault> {
        let mut unit = match id {
            UnitId::Input(index) => {
                let binding = &self.circuit.inputs()[index as usize];
                if binding.party() == &self.party {
                    let bits = self.my_bits.remove(&index).unwrap_or_default();
                    Unit::InputOwner(InputOwner {
                        unit: id,
                        wires: binding.wires(),
                        bits,
                    })
                } else {
                    Unit::InputPeer(InputPeer {
                        unit: id,
                        wires: binding.wires(),
                    })
                }
            }
            UnitId::Gate(gate) => {
                let Gate::And(x, y) = self.circuit.gates()[gate as usize] else {
                    return Ok(None);
                };
                let (Some(x_share), Some(y_share)) = (self.shares[x], self.shares[y]) else {
                    return Ok(None);
                };
                let out_wire = self.circuit.input_wire_count() + gate as usize;
                if self.my_index == 0 {
                    Unit::AndSender(AndSender::new(id, gate, x_share, y_share, out_wire))
                } else {
                    Unit::AndReceiver(AndReceiver::new(id, gate, x_share, y_share, out_wire))
                }
            }
            UnitId::Output(index) => {
                let binding = &self.circuit.outputs()[index as usize];
                let shares: Option<Vec<bool>> =
                    binding.wires().iter().map(|&wire| self.shares[wire]).collect();
                let Some(shares) = shares else {
                    return Ok(None);
                };
                Unit::Reveal(Reveal::new(id, index, shares))
            }
        };
        trace!(unit = ?id, "activating");
        let out = unit.start(&mut self.rng).map_err(unit_fault)?;
        self.slots.insert(id, Slot::Active(unit));
        Ok(Some(out))
    }

    /// Applies a unit step: resolved wires, revealed outputs, sends.
    fn finish_step(&mut self, id: UnitId, out: UnitOutput) -> Result<(), Fault> {
        if out.done {
            self.slots.insert(id, Slot::Done);
            let purged = self.inbox.purge(id);
            if purged > 0 {
                self.discarded += purged as u64;
                debug!(unit = ?id, purged, "discarded leftovers of completed unit");
            }
        }
        for (wire, share) in out.resolved {
            self.resolve(wire, share)?;
        }
        if let Some((index, value)) = out.revealed {
            let name = self.circuit.outputs()[index as usize].name().to_string();
            debug!(output = %name, "output revealed");
            self.revealed.insert(name, value);
        }
        for envelope in out.messages {
            self.send(envelope)?;
        }
        Ok(())
    }

    fn resolve(&mut self, wire: usize, share: bool) -> Result<(), Fault> {
        if self.shares[wire].is_some() {
            // Re-resolution is a protocol violation, not a duplicate: the
            // router discards duplicates before they reach a unit.
            return Err(Fault::MalformedPayload {
                detail: format!("wire {wire} resolved twice"),
            });
        }
        self.shares[wire] = Some(share);
        Ok(())
    }

    fn send(&mut self, envelope: Envelope) -> Result<(), Fault> {
        let bytes = message::encode(&envelope).map_err(|detail| Fault::TransportFailure {
            detail: format!("encoding outbound message: {detail}"),
        })?;
        trace!(unit = ?envelope.unit, round = envelope.round, "sending");
        self.channel
            .send_bytes_to(&self.peer, bytes)
            .map_err(|e| Fault::TransportFailure {
                detail: format!("{e:?}"),
            })
    }

    fn check_completion(&mut self) {
        if self.phase != SessionPhase::Running
            || self.revealed.len() != self.circuit.outputs().len()
        {
            return;
        }
        let output = Output::from_values(std::mem::take(&mut self.revealed));
        debug!(party = %self.party, "session completed");
        self.phase = SessionPhase::Completed;
        self.result_tx.send_replace(Some(Ok(output)));
    }
}

impl<C: Channel> Drop for Session<C> {
    fn drop(&mut self) {
        if self.phase == SessionPhase::Running {
            self.result_tx.send_replace(Some(Err(Fault::Cancelled {
                reason: "session dropped before completion".into(),
            })));
        }
    }
}

fn unit_fault(e: UnitError) -> Fault {
    match e {
        UnitError::Malformed(detail) => Fault::MalformedPayload { detail },
        UnitError::Crypto(detail) => Fault::CryptoCheckFailed { detail },
    }
}

/// An error raised by [`simulate`].
#[derive(Debug, Error)]
pub enum SimulateError {
    /// A party failed to join.
    #[error(transparent)]
    Join(#[from] JoinError),
    /// A session rejected a delivered message.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// No input was provided for a declared party.
    #[error("no input provided for party {0}")]
    MissingParty(PartyId),
    /// The sessions stopped exchanging messages before completing.
    #[error("sessions stalled before completing")]
    Stalled,
    /// The two parties revealed different outputs.
    #[error("parties disagree on the revealed output")]
    Mismatch,
}

/// Runs both parties' sessions in-process over loss-free, order-preserving
/// queues and returns the revealed output.
///
/// Useful for tests and for evaluating a circuit without a transport; the
/// networked path is the same code driven by [`handle_message`](Session::handle_message).
pub fn simulate(
    circuit: &Arc<CompiledCircuit>,
    inputs: &[(PartyId, PrivateInput)],
) -> Result<Output, SimulateError> {
    let roster: Vec<PartyId> = circuit.parties().into_iter().cloned().collect();
    let mut handles = Vec::new();
    let mut sessions = Vec::new();
    for party in &roster {
        let Some((_, input)) = inputs.iter().find(|(p, _)| p == party) else {
            return Err(SimulateError::MissingParty(party.clone()));
        };
        let handle = QueueChannel::new();
        handles.push(handle.clone());
        sessions.push(join(
            Arc::clone(circuit),
            party.clone(),
            input.clone(),
            handle,
        )?);
    }
    loop {
        let mut delivered = false;
        for i in 0..sessions.len() {
            for (to, bytes) in handles[i].drain() {
                let Some(j) = roster.iter().position(|p| *p == to) else {
                    return Err(SimulateError::MissingParty(to));
                };
                let from = roster[i].clone();
                sessions[j].handle_message(&from, &bytes)?;
                delivered = true;
            }
        }
        if !delivered {
            break;
        }
    }
    let mut outputs = Vec::new();
    for session in &sessions {
        match session.try_output() {
            Some(Ok(output)) => outputs.push(output),
            Some(Err(fault)) => return Err(SessionError::from(fault).into()),
            None => return Err(SimulateError::Stalled),
        }
    }
    if outputs[0] != outputs[1] {
        return Err(SimulateError::Mismatch);
    }
    Ok(outputs.remove(0))
}
