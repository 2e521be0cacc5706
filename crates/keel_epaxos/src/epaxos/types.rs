//! Shared types for the EPaxos replica core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the consensus logic and the transport/state-machine layers.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Index of a replica in the cluster configuration.
///
/// Signed so that the null ballot `(-1, -1)` is representable.
pub type ReplicaIndex = i32;

/// Logs the violation and aborts the process.
///
/// Protocol handlers never unwind; an impossible state means this replica
/// can no longer be trusted and an operator must restart it with a recovery
/// peer taking over.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        tracing::error!($($arg)*);
        panic!($($arg)*);
    }};
}
pub(crate) use fatal;

/// Ballot used to resolve conflicts between competing leaders of one
/// instance. Ordered lexicographically on `(ordering, replica)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub ordering: i32,
    pub replica: ReplicaIndex,
}

impl Ballot {
    /// Strictly less than every ballot a replica can issue.
    pub const NULL: Ballot = Ballot {
        ordering: -1,
        replica: -1,
    };

    /// The default ballot an instance's leader proposes in.
    pub const fn initial(leader: ReplicaIndex) -> Self {
        Ballot {
            ordering: 0,
            replica: leader,
        }
    }

    /// The smallest ballot owned by `owner` that is larger than `self`.
    pub fn next(self, owner: ReplicaIndex) -> Self {
        Ballot {
            ordering: self.ordering + 1,
            replica: owner,
        }
    }

    pub fn is_null(self) -> bool {
        self == Ballot::NULL
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.ordering, self.replica).cmp(&(other.ordering, other.replica))
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Identity of a consensus slot. Replica `r` owns the column
/// `(r, 0), (r, 1), ...` and allocates instance numbers monotonically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instance {
    pub leader: ReplicaIndex,
    pub number: i32,
}

impl Instance {
    pub fn initial_ballot(self) -> Ballot {
        Ballot::initial(self.leader)
    }
}

/// Opaque client address with byte serialisation and total equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientAddr(pub Bytes);

/// A client command routed through consensus.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub client: ClientAddr,
    pub pseudonym: i32,
    pub client_id: i32,
    pub payload: Bytes,
}

/// Either a client command or a noop. Noops are committed by recovery when
/// no command is recoverable; applying one does not touch the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOrNoop {
    Command(Command),
    Noop,
}

/// The value decided for an instance: the command plus the ordering
/// metadata the executor needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTriple {
    pub cmd: CommandOrNoop,
    pub seq: i32,
    pub deps: BTreeSet<Instance>,
}

/// Vote status reported in a `PrepareOk`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareStatus {
    NotSeen,
    PreAccepted,
    Accepted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAccept {
    pub instance: Instance,
    pub ballot: Ballot,
    pub cmd: CommandOrNoop,
    pub seq: i32,
    pub deps: BTreeSet<Instance>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreAcceptOk {
    pub instance: Instance,
    pub ballot: Ballot,
    pub replica: ReplicaIndex,
    pub seq: i32,
    pub deps: BTreeSet<Instance>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accept {
    pub instance: Instance,
    pub ballot: Ballot,
    pub cmd: CommandOrNoop,
    pub seq: i32,
    pub deps: BTreeSet<Instance>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptOk {
    pub instance: Instance,
    pub ballot: Ballot,
    pub replica: ReplicaIndex,
}

/// A decision announcement. Carries no ballot: a commit is final.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub instance: Instance,
    pub cmd: CommandOrNoop,
    pub seq: i32,
    pub deps: BTreeSet<Instance>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub instance: Instance,
    pub ballot: Ballot,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOk {
    pub instance: Instance,
    pub ballot: Ballot,
    pub replica: ReplicaIndex,
    pub vote_ballot: Ballot,
    pub status: PrepareStatus,
    pub triple: Option<CommandTriple>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nack {
    pub instance: Instance,
    pub largest_ballot: Ballot,
}

/// Replica-to-replica message envelope.
///
/// Client traffic (`ClientRequest` in, `ClientReply` out) does not travel in
/// this envelope; it enters through the replica's mailbox and leaves through
/// `Transport::reply`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    PreAccept(PreAccept),
    PreAcceptOk(PreAcceptOk),
    Accept(Accept),
    AcceptOk(AcceptOk),
    Commit(Commit),
    Prepare(Prepare),
    PrepareOk(PrepareOk),
    Nack(Nack),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::PreAccept(_) => "pre_accept",
            Message::PreAcceptOk(_) => "pre_accept_ok",
            Message::Accept(_) => "accept",
            Message::AcceptOk(_) => "accept_ok",
            Message::Commit(_) => "commit",
            Message::Prepare(_) => "prepare",
            Message::PrepareOk(_) => "prepare_ok",
            Message::Nack(_) => "nack",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client: ClientAddr,
    pub pseudonym: i32,
    pub client_id: i32,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReply {
    pub pseudonym: i32,
    pub client_id: i32,
    pub result: Bytes,
}

/// Cluster configuration and operational tuning.
///
/// A replica's index is its position in `addresses`; quorum sizes derive
/// from the address count.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub addresses: Vec<String>,

    /// Re-send period for outstanding PreAccept/Accept/Prepare rounds.
    #[serde(default = "default_resend_interval")]
    pub resend_interval: Duration,
    /// How long to keep waiting for a fast quorum once a slow quorum of
    /// pre-accept responses is in hand.
    #[serde(default = "default_slow_path_delay")]
    pub slow_path_delay: Duration,
    /// Base delay before retrying recovery after losing a ballot duel.
    #[serde(default = "default_recovery_backoff")]
    pub recovery_backoff: Duration,
    /// Upper bound for the exponential recovery backoff.
    #[serde(default = "default_recovery_backoff_cap")]
    pub recovery_backoff_cap: Duration,
}

fn default_resend_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_slow_path_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_recovery_backoff() -> Duration {
    Duration::from_millis(150)
}

fn default_recovery_backoff_cap() -> Duration {
    Duration::from_secs(5)
}

impl Config {
    pub fn new(addresses: Vec<String>) -> Self {
        Config {
            addresses,
            resend_interval: default_resend_interval(),
            slow_path_delay: default_slow_path_delay(),
            recovery_backoff: default_recovery_backoff(),
            recovery_backoff_cap: default_recovery_backoff_cap(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.addresses.is_empty(),
            "config must list at least one replica address"
        );
        Ok(())
    }

    pub fn replica_count(&self) -> usize {
        self.addresses.len()
    }

    /// Tolerated failures: `⌊N/2⌋`.
    pub fn f(&self) -> usize {
        self.replica_count() / 2
    }

    /// Simple majority: `⌊N/2⌋ + 1`.
    pub fn slow_quorum(&self) -> usize {
        self.replica_count() / 2 + 1
    }

    /// EPaxos fast quorum: `N − ⌊N/4⌋`.
    pub fn fast_quorum(&self) -> usize {
        let n = self.replica_count();
        n - n / 4
    }
}

/// Application state machine driven by the executor.
///
/// Commands are opaque bytes; `conflict_keys` feeds the interference oracle
/// and must be a pure function of the payload so every replica computes the
/// same interference relation. An empty key set interferes with nothing; a
/// state machine that cannot classify its commands can return one constant
/// key to serialise everything.
pub trait StateMachine: Send + 'static {
    fn conflict_keys(&self, payload: &Bytes) -> Vec<Bytes>;

    /// Deterministic apply. Must be total: apply failures are not part of
    /// the protocol.
    fn apply(&mut self, payload: &Bytes) -> Bytes;
}

/// Outbound side of the transport.
///
/// Sends are fire-and-forget and must never block; handlers run to
/// completion on the replica's event loop. A message addressed to the local
/// replica must loop back through its own mailbox.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: ReplicaIndex, msg: Message);
    fn reply(&self, to: &ClientAddr, reply: ClientReply);
}
