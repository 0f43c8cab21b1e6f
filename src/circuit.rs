//! The compiled circuit representation consumed by sessions.
//!
//! A [`CompiledCircuit`] is the immutable output of an (external) circuit
//! compiler: a topologically ordered list of boolean gates plus named,
//! per-party input bindings and named output bindings. Sessions only ever
//! read it, so a single circuit can be shared across many concurrent
//! sessions behind an [`Arc`](std::sync::Arc).
//!
//! Wire numbering follows the usual convention for compiled boolean
//! circuits: wires `0..n` (with `n` the total number of input bits) are
//! input wires, laid out in input-binding declaration order, and the gate at
//! index `k` drives wire `n + k`.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies one party of a computation, unique within a circuit.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartyId(String);

impl PartyId {
    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PartyId {
    fn from(id: &str) -> Self {
        PartyId(id.into())
    }
}

impl From<String> for PartyId {
    fn from(id: String) -> Self {
        PartyId(id)
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PartyId({})", self.0)
    }
}

/// A boolean gate, referring to its input wires by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gate {
    /// XOR of the two wires (evaluated locally by both parties).
    Xor(usize, usize),
    /// AND of the two wires (requires an interactive sub-protocol).
    And(usize, usize),
    /// Negation of the wire (evaluated locally).
    Not(usize),
}

/// Binds one named input of one party to a contiguous range of input wires.
///
/// The value is encoded little-endian: the first wire of the range carries
/// the least significant bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    party: PartyId,
    name: String,
    first_wire: usize,
    width: usize,
}

impl InputBinding {
    /// The party owning this input.
    pub fn party(&self) -> &PartyId {
        &self.party
    }

    /// The input's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of bits this input occupies.
    pub fn width(&self) -> usize {
        self.width
    }

    /// The input wires carrying this value, least significant bit first.
    pub fn wires(&self) -> Range<usize> {
        self.first_wire..self.first_wire + self.width
    }
}

/// Binds one named output to an ordered list of wires (LSB first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBinding {
    name: String,
    wires: Vec<usize>,
}

impl OutputBinding {
    /// The output's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wires carrying this value, least significant bit first.
    pub fn wires(&self) -> &[usize] {
        &self.wires
    }
}

/// An immutable, compiled boolean circuit with named inputs and outputs.
///
/// Produced by [`CircuitBuilder`] (or deserialized from a compiler's
/// output). Circuits that cross a serialization boundary should be
/// [validated](CompiledCircuit::validate) before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledCircuit {
    inputs: Vec<InputBinding>,
    gates: Vec<Gate>,
    outputs: Vec<OutputBinding>,
}

impl CompiledCircuit {
    /// The input bindings, in declaration (= wire layout) order.
    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    /// The gates, in topological order.
    pub fn gates(&self) -> &[Gate] {
        &self.gates
    }

    /// The output bindings, in declaration order.
    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }

    /// The number of input wires.
    pub fn input_wire_count(&self) -> usize {
        self.inputs.iter().map(|b| b.width).sum()
    }

    /// The total number of wires (inputs plus one per gate).
    pub fn wire_count(&self) -> usize {
        self.input_wire_count() + self.gates.len()
    }

    /// The number of AND gates, i.e. interactive gates.
    pub fn and_gates(&self) -> usize {
        self.gates.iter().filter(|g| matches!(g, Gate::And(_, _))).count()
    }

    /// The distinct parties declared by the input bindings, in first-use order.
    pub fn parties(&self) -> Vec<&PartyId> {
        let mut parties: Vec<&PartyId> = Vec::new();
        for binding in &self.inputs {
            if !parties.contains(&&binding.party) {
                parties.push(&binding.party);
            }
        }
        parties
    }

    /// Checks that the circuit is well-formed: two distinct parties, unique
    /// binding names, topological gate wiring and in-range output wires.
    pub fn validate(&self) -> Result<(), CircuitError> {
        let parties = self.parties();
        if parties.len() != 2 {
            return Err(CircuitError::PartyCount(parties.len()));
        }
        let mut seen_inputs: BTreeMap<(&PartyId, &str), ()> = BTreeMap::new();
        for binding in &self.inputs {
            if binding.width == 0 || binding.width > 64 {
                return Err(CircuitError::InvalidWidth {
                    name: binding.name.clone(),
                    width: binding.width,
                });
            }
            if seen_inputs
                .insert((&binding.party, binding.name.as_str()), ())
                .is_some()
            {
                return Err(CircuitError::DuplicateInput {
                    party: binding.party.clone(),
                    name: binding.name.clone(),
                });
            }
        }
        let n_inputs = self.input_wire_count();
        for (k, gate) in self.gates.iter().enumerate() {
            let out = n_inputs + k;
            let refs = match *gate {
                Gate::Xor(x, y) | Gate::And(x, y) => [Some(x), Some(y)],
                Gate::Not(x) => [Some(x), None],
            };
            for wire in refs.into_iter().flatten() {
                if wire >= out {
                    return Err(CircuitError::InvalidWire { gate: k, wire });
                }
            }
        }
        if self.outputs.is_empty() {
            return Err(CircuitError::NoOutputs);
        }
        let mut seen_outputs: BTreeMap<&str, ()> = BTreeMap::new();
        let wire_count = self.wire_count();
        for binding in &self.outputs {
            if binding.wires.is_empty() || binding.wires.len() > 64 {
                return Err(CircuitError::InvalidWidth {
                    name: binding.name.clone(),
                    width: binding.wires.len(),
                });
            }
            if seen_outputs.insert(binding.name.as_str(), ()).is_some() {
                return Err(CircuitError::DuplicateOutput(binding.name.clone()));
            }
            for &wire in &binding.wires {
                if wire >= wire_count {
                    return Err(CircuitError::InvalidWire {
                        gate: self.gates.len(),
                        wire,
                    });
                }
            }
        }
        Ok(())
    }

    /// Encodes a party's private input record into per-binding bit vectors,
    /// in input declaration order of that party.
    pub(crate) fn input_bits(
        &self,
        party: &PartyId,
        input: &PrivateInput,
    ) -> Result<Vec<(usize, Vec<bool>)>, InputError> {
        if !self.parties().contains(&party) {
            return Err(InputError::UnknownParty(party.clone()));
        }
        for name in input.values.keys() {
            let declared = self
                .inputs
                .iter()
                .any(|b| &b.party == party && &b.name == name);
            if !declared {
                return Err(InputError::UndeclaredInput(name.clone()));
            }
        }
        let mut bits = Vec::new();
        for (index, binding) in self.inputs.iter().enumerate() {
            if &binding.party != party {
                continue;
            }
            let Some(&value) = input.values.get(&binding.name) else {
                return Err(InputError::MissingInput {
                    party: party.clone(),
                    name: binding.name.clone(),
                });
            };
            if binding.width < 64 && value >> binding.width != 0 {
                return Err(InputError::OutOfRange {
                    name: binding.name.clone(),
                    width: binding.width,
                });
            }
            bits.push((index, value_to_bits(value, binding.width)));
        }
        Ok(bits)
    }

    /// Evaluates the circuit on cleartext inputs.
    ///
    /// This is the reference semantics of the circuit, useful for tests and
    /// diagnostics; it involves no secret sharing and no communication.
    pub fn eval(&self, inputs: &[(PartyId, PrivateInput)]) -> Result<Output, InputError> {
        let mut wires = vec![false; self.wire_count()];
        for party in self.parties() {
            let Some((_, input)) = inputs.iter().find(|(p, _)| p == party) else {
                return Err(InputError::UnknownParty(party.clone()));
            };
            for (index, bits) in self.input_bits(party, input)? {
                for (wire, bit) in self.inputs[index].wires().zip(bits) {
                    wires[wire] = bit;
                }
            }
        }
        let n_inputs = self.input_wire_count();
        for (k, gate) in self.gates.iter().enumerate() {
            wires[n_inputs + k] = match *gate {
                Gate::Xor(x, y) => wires[x] ^ wires[y],
                Gate::And(x, y) => wires[x] & wires[y],
                Gate::Not(x) => !wires[x],
            };
        }
        let mut values = BTreeMap::new();
        for binding in &self.outputs {
            let bits: Vec<bool> = binding.wires.iter().map(|&w| wires[w]).collect();
            values.insert(binding.name.clone(), bits_to_value(&bits));
        }
        Ok(Output { values })
    }
}

pub(crate) fn value_to_bits(value: u64, width: usize) -> Vec<bool> {
    (0..width).map(|j| value >> j & 1 == 1).collect()
}

pub(crate) fn bits_to_value(bits: &[bool]) -> u64 {
    bits.iter()
        .enumerate()
        .fold(0, |acc, (j, &bit)| acc | (bit as u64) << j)
}

/// Builds a [`CompiledCircuit`] gate by gate.
///
/// This is the construction interface a circuit compiler targets. Inputs
/// must all be declared before the first gate is emitted so that they occupy
/// the lowest wire indices.
#[derive(Debug, Default)]
pub struct CircuitBuilder {
    inputs: Vec<InputBinding>,
    gates: Vec<Gate>,
    outputs: Vec<OutputBinding>,
    next_wire: usize,
    misuse: Option<CircuitError>,
}

impl CircuitBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a named input of `width` bits for `party` and returns its
    /// wires, least significant bit first.
    pub fn input(&mut self, party: impl Into<PartyId>, name: &str, width: usize) -> Vec<usize> {
        if !self.gates.is_empty() && self.misuse.is_none() {
            self.misuse = Some(CircuitError::InputAfterGates(name.into()));
        }
        let binding = InputBinding {
            party: party.into(),
            name: name.into(),
            first_wire: self.next_wire,
            width,
        };
        let wires = binding.wires().collect();
        self.next_wire += width;
        self.inputs.push(binding);
        wires
    }

    fn push(&mut self, gate: Gate) -> usize {
        self.gates.push(gate);
        let wire = self.next_wire;
        self.next_wire += 1;
        wire
    }

    /// Emits an XOR gate and returns its output wire.
    pub fn xor(&mut self, x: usize, y: usize) -> usize {
        self.push(Gate::Xor(x, y))
    }

    /// Emits an AND gate and returns its output wire.
    pub fn and(&mut self, x: usize, y: usize) -> usize {
        self.push(Gate::And(x, y))
    }

    /// Emits a NOT gate and returns its output wire.
    pub fn not(&mut self, x: usize) -> usize {
        self.push(Gate::Not(x))
    }

    /// Emits `x OR y` as `(x XOR y) XOR (x AND y)` and returns its output wire.
    pub fn or(&mut self, x: usize, y: usize) -> usize {
        let xor = self.xor(x, y);
        let and = self.and(x, y);
        self.xor(xor, and)
    }

    /// Declares a named output over the given wires (LSB first).
    pub fn output(&mut self, name: &str, wires: Vec<usize>) {
        self.outputs.push(OutputBinding {
            name: name.into(),
            wires,
        });
    }

    /// Finishes and validates the circuit.
    pub fn finish(self) -> Result<CompiledCircuit, CircuitError> {
        if let Some(misuse) = self.misuse {
            return Err(misuse);
        }
        let circuit = CompiledCircuit {
            inputs: self.inputs,
            gates: self.gates,
            outputs: self.outputs,
        };
        circuit.validate()?;
        Ok(circuit)
    }
}

/// A record of named private input values for one party.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivateInput {
    values: BTreeMap<String, u64>,
}

impl PrivateInput {
    /// Creates an empty input record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a named value, returning the record for chaining.
    pub fn with(mut self, name: &str, value: u64) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

impl<const N: usize> From<[(&str, u64); N]> for PrivateInput {
    fn from(entries: [(&str, u64); N]) -> Self {
        let values = entries
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        PrivateInput { values }
    }
}

/// The revealed result of a completed session: every declared output by name.
///
/// An output is only ever observed fully populated; sessions never expose a
/// partial mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    values: BTreeMap<String, u64>,
}

impl Output {
    pub(crate) fn from_values(values: BTreeMap<String, u64>) -> Self {
        Output { values }
    }

    /// The revealed value of the named output, if declared.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    /// Iterates over all `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// The specified circuit is invalid (e.g. cyclic / contains invalid wirings).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitError {
    /// The circuit does not declare exactly two parties.
    #[error("expected exactly 2 parties, circuit declares {0}")]
    PartyCount(usize),
    /// A gate refers to a wire at or after its own output wire.
    #[error("gate {gate} refers to wire {wire}, which is not before it")]
    InvalidWire {
        /// The offending gate index.
        gate: usize,
        /// The out-of-range wire.
        wire: usize,
    },
    /// A binding is zero-width or wider than 64 bits.
    #[error("binding {name} has unsupported width {width}")]
    InvalidWidth {
        /// The binding's name.
        name: String,
        /// The declared width.
        width: usize,
    },
    /// The same input name was declared twice for one party.
    #[error("duplicate input {name} for party {party}")]
    DuplicateInput {
        /// The declaring party.
        party: PartyId,
        /// The duplicated name.
        name: String,
    },
    /// The same output name was declared twice.
    #[error("duplicate output {0}")]
    DuplicateOutput(String),
    /// An input was declared after the first gate was emitted.
    #[error("input {0} declared after gates were emitted")]
    InputAfterGates(String),
    /// The circuit declares no outputs.
    #[error("circuit declares no outputs")]
    NoOutputs,
}

/// A private input record does not match the circuit's declared bindings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    /// The party does not own any input wires in the circuit.
    #[error("party {0} is not declared in the circuit")]
    UnknownParty(PartyId),
    /// A declared input has no corresponding value in the record.
    #[error("missing value for input {name} of party {party}")]
    MissingInput {
        /// The party whose input is missing.
        party: PartyId,
        /// The missing input's name.
        name: String,
    },
    /// A value does not fit into its binding's declared width.
    #[error("value for input {name} does not fit into {width} bits")]
    OutOfRange {
        /// The binding's name.
        name: String,
        /// The binding's width in bits.
        width: usize,
    },
    /// The record contains a value for a name the circuit never declared.
    #[error("input {0} is not declared in the circuit")]
    UndeclaredInput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xor_circuit() -> CompiledCircuit {
        let mut builder = CircuitBuilder::new();
        let a = builder.input("alice", "a", 4);
        let b = builder.input("bob", "b", 4);
        let out: Vec<usize> = a
            .iter()
            .zip(&b)
            .map(|(&x, &y)| builder.xor(x, y))
            .collect();
        builder.output("out", out);
        builder.finish().unwrap()
    }

    #[test]
    fn wire_layout() {
        let circuit = xor_circuit();
        assert_eq!(circuit.input_wire_count(), 8);
        assert_eq!(circuit.wire_count(), 12);
        assert_eq!(circuit.and_gates(), 0);
        assert_eq!(
            circuit.parties(),
            vec![&PartyId::from("alice"), &PartyId::from("bob")]
        );
    }

    #[test]
    fn eval_xor() {
        let circuit = xor_circuit();
        let output = circuit
            .eval(&[
                ("alice".into(), PrivateInput::from([("a", 0b1100)])),
                ("bob".into(), PrivateInput::from([("b", 0b1010)])),
            ])
            .unwrap();
        assert_eq!(output.get("out"), Some(0b0110));
    }

    #[test]
    fn eval_and_not_or() {
        let mut builder = CircuitBuilder::new();
        let a = builder.input("alice", "a", 1);
        let b = builder.input("bob", "b", 1);
        let and = builder.and(a[0], b[0]);
        let or = builder.or(a[0], b[0]);
        let not = builder.not(a[0]);
        builder.output("and", vec![and]);
        builder.output("or", vec![or]);
        builder.output("not_a", vec![not]);
        let circuit = builder.finish().unwrap();
        for x in [0u64, 1] {
            for y in [0u64, 1] {
                let output = circuit
                    .eval(&[
                        ("alice".into(), PrivateInput::from([("a", x)])),
                        ("bob".into(), PrivateInput::from([("b", y)])),
                    ])
                    .unwrap();
                assert_eq!(output.get("and"), Some(x & y));
                assert_eq!(output.get("or"), Some(x | y));
                assert_eq!(output.get("not_a"), Some(1 - x));
            }
        }
    }

    #[test]
    fn rejects_single_party() {
        let mut builder = CircuitBuilder::new();
        let a = builder.input("alice", "a", 1);
        builder.output("out", a);
        assert_eq!(builder.finish(), Err(CircuitError::PartyCount(1)));
    }

    #[test]
    fn rejects_forward_wire_reference() {
        let mut builder = CircuitBuilder::new();
        let a = builder.input("alice", "a", 1);
        builder.input("bob", "b", 1);
        let bad = builder.xor(a[0], 5);
        builder.output("out", vec![bad]);
        assert!(matches!(
            builder.finish(),
            Err(CircuitError::InvalidWire { gate: 0, wire: 5 })
        ));
    }

    #[test]
    fn rejects_input_after_gates() {
        let mut builder = CircuitBuilder::new();
        let a = builder.input("alice", "a", 1);
        let b = builder.input("bob", "b", 1);
        let x = builder.xor(a[0], b[0]);
        builder.input("alice", "late", 1);
        builder.output("out", vec![x]);
        assert!(matches!(
            builder.finish(),
            Err(CircuitError::InputAfterGates(_))
        ));
    }

    #[test]
    fn input_record_mismatches() {
        let circuit = xor_circuit();
        let alice = PartyId::from("alice");
        let err = circuit
            .input_bits(&alice, &PrivateInput::new())
            .unwrap_err();
        assert!(matches!(err, InputError::MissingInput { .. }));
        let err = circuit
            .input_bits(&alice, &PrivateInput::from([("a", 16)]))
            .unwrap_err();
        assert!(matches!(err, InputError::OutOfRange { width: 4, .. }));
        let err = circuit
            .input_bits(&alice, &PrivateInput::from([("a", 1), ("oops", 0)]))
            .unwrap_err();
        assert!(matches!(err, InputError::UndeclaredInput(_)));
        let err = circuit
            .input_bits(&PartyId::from("carol"), &PrivateInput::new())
            .unwrap_err();
        assert!(matches!(err, InputError::UnknownParty(_)));
    }
}
