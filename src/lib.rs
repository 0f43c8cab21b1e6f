//! A secure two-party computation engine driven by message-passing
//! sessions.
//!
//! Two parties jointly evaluate a compiled boolean circuit over their
//! private inputs without revealing those inputs to each other. This crate
//! is the runtime for one party's side of the protocol: it turns a
//! [`CompiledCircuit`](circuit::CompiledCircuit) plus a private input into
//! a live [`Session`](session::Session) that emits outbound protocol
//! messages through a caller-supplied send callback, consumes inbound peer
//! messages in whatever order they arrive, and eventually resolves a
//! verified output. The circuit compiler and the byte transport between the
//! parties are deliberately outside this crate.
//!
//! ## Features
//!
//! - XOR-secret-sharing based evaluation of boolean circuits, with one
//!   oblivious transfer per AND gate
//! - Sans-io sessions: no sockets, no runtime requirements, no blocking —
//!   any byte pipe that can call a function works as a transport
//! - Tolerates reordered and duplicated deliveries across gates, with a
//!   bounded buffer against misbehaving peers
//! - Commit-then-open output reveal with constant-time verification
//!
//! ## Main Components
//!
//! * [`circuit`]: the compiled circuit representation, its builder, and the
//!   private input / revealed output records.
//! * [`session`]: [`session::join`] to create a session,
//!   [`Session::handle_message`](session::Session::handle_message) to feed
//!   it, [`Session::output`](session::Session::output) to await the result,
//!   and [`session::simulate`] to run both parties in-process.
//! * [`channel`]: the outbound transport callback.
//!
//! ## Basic Usage
//!
//! Each participating party needs to:
//!
//! 1. Obtain the same [`CompiledCircuit`](circuit::CompiledCircuit)
//! 2. Call [`session::join`] with its party id, private input and a send
//!    callback wired to the transport
//! 3. Forward every inbound transport message into
//!    [`Session::handle_message`](session::Session::handle_message)
//! 4. Await [`Session::output`](session::Session::output)
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use duotune::{circuit::PrivateInput, session};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let circuit = Arc::new(/* produced by a circuit compiler */);
//!
//! // The send callback hands outbound messages to the transport.
//! let send = |to: &duotune::circuit::PartyId, msg: Vec<u8>| {
//!     websocket.send(to, msg)
//! };
//! let mut session = session::join(
//!     Arc::clone(&circuit),
//!     "alice",
//!     PrivateInput::from([("a", 42)]),
//!     send,
//! )?;
//!
//! // Feed inbound messages as they arrive, from any task that owns the
//! // session...
//! session.handle_message(&"bob".into(), &bytes)?;
//!
//! // ...and await the revealed output.
//! let output = session.output().await?;
//! println!("equal = {:?}", output.get("equal"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Properties
//!
//! The engine targets semi-honest peers over untrusted transports: private
//! inputs never leave a session unmasked, intermediate wire values are
//! meaningless XOR shares, output openings are checked against prior
//! commitments, and a session resolves exactly once — either the complete
//! output or a single descriptive fault.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod circuit;
pub mod session;

mod eval;
mod message;
mod ot;
mod router;
