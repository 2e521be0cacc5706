//! EPaxos module wiring.
//!
//! `replica` contains the event loop, the leader and acceptor paths, and
//! recovery; `state` holds the command log and the conflict indexes;
//! `executor` and `graph` linearise committed instances into an apply
//! stream; `types` defines the shared message/config/trait contracts.

mod executor;
mod graph;
mod replica;
mod state;
mod types;

pub use executor::Executor;
pub use replica::{
    mailbox, Event, Handle, MetricsSnapshot, Replica, ReplicaMetrics, TimerEvent,
};
pub use state::{CmdLogEntry, State};
pub use types::{
    Accept, AcceptOk, Ballot, ClientAddr, ClientReply, ClientRequest, Command, CommandOrNoop,
    CommandTriple, Commit, Config, Instance, Message, Nack, PreAccept, PreAcceptOk, Prepare,
    PrepareOk, PrepareStatus, ReplicaIndex, StateMachine, Transport,
};
