//! Egalitarian Paxos consensus crate.
//!
//! This crate provides the EPaxos replica core used by keel nodes. The API
//! surface is intentionally small: higher layers supply a `StateMachine` and
//! a `Transport`, then feed typed messages and client requests through a
//! replica's mailbox and run its event loop.

pub mod epaxos;
