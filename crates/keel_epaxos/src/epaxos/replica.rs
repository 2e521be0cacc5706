//! The EPaxos replica: acceptor paths, leader paths, recovery, and the
//! event loop that ties them to the executor.
//!
//! The replica is a single-threaded cooperative event loop. One task owns
//! all state and drains a mailbox of inbound messages, client requests, and
//! recovery triggers; timers fire on the same loop through a `DelayQueue`.
//! Handlers run to completion and never block, so none of the state needs a
//! lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::time::{delay_queue, DelayQueue};

use super::executor::Executor;
use super::state::{CmdLogEntry, State};
use super::types::{
    fatal, Accept, AcceptOk, Ballot, ClientReply, ClientRequest, Command, CommandOrNoop,
    CommandTriple, Commit, Config, Instance, Message, Nack, PreAccept, PreAcceptOk, Prepare,
    PrepareOk, PrepareStatus, ReplicaIndex, StateMachine, Transport,
};

/// Inputs accepted by the replica mailbox.
#[derive(Clone, Debug)]
pub enum Event {
    /// A replica-to-replica message delivered by the transport.
    Inbound { from: ReplicaIndex, msg: Message },
    /// A client request delivered by the serving layer.
    Request(ClientRequest),
    /// An external failure-detection trigger: recover this instance.
    Recover(Instance),
}

/// Timer fires routed back into the event loop.
///
/// Each armed timer carries a generation token; a fire whose token does not
/// match the currently armed timer is stale and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    ResendPreAccepts { instance: Instance, token: u64 },
    ResendAccepts { instance: Instance, token: u64 },
    ResendPrepares { instance: Instance, token: u64 },
    SlowPath { instance: Instance, token: u64 },
    RecoveryBackoff { instance: Instance, token: u64 },
}

/// Lightweight handle used to feed a replica's mailbox.
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::UnboundedSender<Event>,
}

impl Handle {
    /// Deliver a replica-to-replica message. Returns false once the event
    /// loop has shut down.
    pub fn deliver(&self, from: ReplicaIndex, msg: Message) -> bool {
        self.tx.send(Event::Inbound { from, msg }).is_ok()
    }

    pub fn request(&self, req: ClientRequest) -> bool {
        self.tx.send(Event::Request(req)).is_ok()
    }

    pub fn recover(&self, instance: Instance) -> bool {
        self.tx.send(Event::Recover(instance)).is_ok()
    }
}

/// Create a mailbox pair: the handle goes to the transport/serving layer,
/// the receiver to `Replica::run`.
pub fn mailbox() -> (Handle, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Handle { tx }, rx)
}

/// Lock-free counters exposed for scraping.
#[derive(Default)]
pub struct ReplicaMetrics {
    pre_accepts: AtomicU64,
    pre_accept_oks: AtomicU64,
    accepts: AtomicU64,
    accept_oks: AtomicU64,
    commits: AtomicU64,
    prepares: AtomicU64,
    prepare_oks: AtomicU64,
    nacks: AtomicU64,
    client_requests: AtomicU64,
    fast_path_commits: AtomicU64,
    slow_path_commits: AtomicU64,
    recovery_commits: AtomicU64,
    learned_commits: AtomicU64,
    executed: AtomicU64,
    graph_vertices: AtomicU64,
    committed_pending: AtomicU64,
}

/// Point-in-time copy of `ReplicaMetrics`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pre_accepts: u64,
    pub pre_accept_oks: u64,
    pub accepts: u64,
    pub accept_oks: u64,
    pub commits: u64,
    pub prepares: u64,
    pub prepare_oks: u64,
    pub nacks: u64,
    pub client_requests: u64,
    pub fast_path_commits: u64,
    pub slow_path_commits: u64,
    pub recovery_commits: u64,
    pub learned_commits: u64,
    pub executed: u64,
    pub graph_vertices: u64,
    pub committed_pending: u64,
}

impl ReplicaMetrics {
    fn record_inbound(&self, msg: &Message) {
        let counter = match msg {
            Message::PreAccept(_) => &self.pre_accepts,
            Message::PreAcceptOk(_) => &self.pre_accept_oks,
            Message::Accept(_) => &self.accepts,
            Message::AcceptOk(_) => &self.accept_oks,
            Message::Commit(_) => &self.commits,
            Message::Prepare(_) => &self.prepares,
            Message::PrepareOk(_) => &self.prepare_oks,
            Message::Nack(_) => &self.nacks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pre_accepts: self.pre_accepts.load(Ordering::Relaxed),
            pre_accept_oks: self.pre_accept_oks.load(Ordering::Relaxed),
            accepts: self.accepts.load(Ordering::Relaxed),
            accept_oks: self.accept_oks.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            prepares: self.prepares.load(Ordering::Relaxed),
            prepare_oks: self.prepare_oks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            client_requests: self.client_requests.load(Ordering::Relaxed),
            fast_path_commits: self.fast_path_commits.load(Ordering::Relaxed),
            slow_path_commits: self.slow_path_commits.load(Ordering::Relaxed),
            recovery_commits: self.recovery_commits.load(Ordering::Relaxed),
            learned_commits: self.learned_commits.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            graph_vertices: self.graph_vertices.load(Ordering::Relaxed),
            committed_pending: self.committed_pending.load(Ordering::Relaxed),
        }
    }
}

/// How an instance reached its decision, for the commit counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommitPath {
    Fast,
    Slow,
    Recovery,
    /// Learned from another replica's Commit broadcast.
    Learned,
}

struct TimerRef {
    key: delay_queue::Key,
    token: u64,
}

struct PreAccepting {
    ballot: Ballot,
    cmd: CommandOrNoop,
    /// The proposal as sent, kept for re-sends.
    seq: i32,
    deps: BTreeSet<Instance>,
    responses: BTreeMap<ReplicaIndex, (i32, BTreeSet<Instance>)>,
    avoid_fast_path: bool,
    resend: TimerRef,
    slow_path: Option<TimerRef>,
}

struct Accepting {
    ballot: Ballot,
    triple: CommandTriple,
    responses: BTreeSet<ReplicaIndex>,
    resend: TimerRef,
}

struct Preparing {
    ballot: Ballot,
    responses: BTreeMap<ReplicaIndex, PrepareOk>,
    resend: TimerRef,
}

/// The role this replica currently plays for an instance it is driving.
/// Exactly one role exists per instance; transitions tear one down and
/// install the next.
enum LeaderRole {
    PreAccepting(PreAccepting),
    Accepting(Accepting),
    Preparing(Preparing),
}

impl LeaderRole {
    fn ballot(&self) -> Ballot {
        match self {
            LeaderRole::PreAccepting(p) => p.ballot,
            LeaderRole::Accepting(a) => a.ballot,
            LeaderRole::Preparing(p) => p.ballot,
        }
    }
}

pub struct Replica {
    index: ReplicaIndex,
    config: Config,
    transport: Arc<dyn Transport>,
    sm: Box<dyn StateMachine>,
    state: State,
    leading: HashMap<Instance, LeaderRole>,
    executor: Executor,
    timers: DelayQueue<TimerEvent>,
    next_token: u64,
    /// Pending recovery retries after a lost ballot duel.
    backoffs: HashMap<Instance, TimerRef>,
    recovery_attempts: HashMap<Instance, u32>,
    rng: StdRng,
    metrics: Arc<ReplicaMetrics>,
}

impl Replica {
    pub fn new(
        config: Config,
        index: ReplicaIndex,
        transport: Arc<dyn Transport>,
        sm: Box<dyn StateMachine>,
    ) -> anyhow::Result<Replica> {
        config.validate()?;
        anyhow::ensure!(
            (0..config.replica_count() as ReplicaIndex).contains(&index),
            "replica index {} out of range for {} addresses",
            index,
            config.replica_count()
        );
        Ok(Replica {
            index,
            config,
            transport,
            sm,
            state: State::new(),
            leading: HashMap::new(),
            executor: Executor::new(),
            timers: DelayQueue::new(),
            next_token: 0,
            backoffs: HashMap::new(),
            recovery_attempts: HashMap::new(),
            rng: StdRng::from_entropy(),
            metrics: Arc::new(ReplicaMetrics::default()),
        })
    }

    pub fn index(&self) -> ReplicaIndex {
        self.index
    }

    pub fn metrics(&self) -> Arc<ReplicaMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn log_entry(&self, instance: Instance) -> Option<&CmdLogEntry> {
        self.state.entry(instance)
    }

    pub fn is_leading(&self, instance: Instance) -> bool {
        self.leading.contains_key(&instance)
    }

    pub fn largest_ballot(&self) -> Ballot {
        self.state.largest_ballot()
    }

    /// Drive the replica until its mailbox closes.
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Event>) {
        loop {
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.handle_timer(expired.into_inner());
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Inbound { from, msg } => self.receive(from, msg),
            Event::Request(req) => self.handle_request(req),
            Event::Recover(instance) => self.recover(instance),
        }
    }

    /// Synchronous entry point for one inbound replica-to-replica message.
    pub fn receive(&mut self, from: ReplicaIndex, msg: Message) {
        self.metrics.record_inbound(&msg);
        match msg {
            Message::PreAccept(m) => self.on_pre_accept(from, m),
            Message::PreAcceptOk(m) => self.on_pre_accept_ok(m),
            Message::Accept(m) => self.on_accept(from, m),
            Message::AcceptOk(m) => self.on_accept_ok(m),
            Message::Commit(m) => self.on_commit(m),
            Message::Prepare(m) => self.on_prepare(from, m),
            Message::PrepareOk(m) => self.on_prepare_ok(m),
            Message::Nack(m) => self.on_nack(m),
        }
    }

    // ---- client path ----------------------------------------------------

    pub fn handle_request(&mut self, req: ClientRequest) {
        self.metrics.client_requests.fetch_add(1, Ordering::Relaxed);

        // At-least-once retry: answer from the client table without
        // consuming a new instance.
        if let Some((highest, result)) = self.state.client_lookup(&req.client, req.pseudonym) {
            if req.client_id <= *highest {
                let reply = ClientReply {
                    pseudonym: req.pseudonym,
                    client_id: *highest,
                    result: result.clone(),
                };
                self.transport.reply(&req.client, reply);
                return;
            }
        }

        let instance = self.state.allocate_instance(self.index);
        let ballot = instance.initial_ballot();
        self.state.observe_ballot(ballot);
        let cmd = CommandOrNoop::Command(Command {
            client: req.client,
            pseudonym: req.pseudonym,
            client_id: req.client_id,
            payload: req.payload,
        });
        tracing::debug!(instance = ?instance, "leading new instance");
        self.begin_pre_accept(instance, ballot, cmd, false);
    }

    // ---- acceptor paths -------------------------------------------------

    /// Shared PreAccept/Accept preamble. Returns false when the message was
    /// fully handled (committed answer or nack).
    fn acceptor_preamble(&mut self, from: ReplicaIndex, instance: Instance, ballot: Ballot) -> bool {
        if let Some(entry) = self.state.entry(instance) {
            if entry.is_decided() {
                let triple = entry.triple().expect("decided entries carry a triple").clone();
                self.send_commit(from, instance, triple);
                return false;
            }
        }
        self.state.observe_ballot(ballot);
        if ballot < self.state.current_ballot(instance) {
            tracing::warn!(
                instance = ?instance,
                ballot = ?ballot,
                current = ?self.state.current_ballot(instance),
                "nacking stale ballot"
            );
            let nack = Message::Nack(Nack {
                instance,
                largest_ballot: self.state.largest_ballot(),
            });
            self.transport.send(from, nack);
            return false;
        }
        // A higher ballot took over an instance we were driving.
        if let Some(role) = self.leading.get(&instance) {
            if ballot > role.ballot() {
                tracing::warn!(instance = ?instance, ballot = ?ballot, "yielding leadership");
                self.drop_role(instance);
            }
        }
        true
    }

    fn on_pre_accept(&mut self, from: ReplicaIndex, m: PreAccept) {
        let instance = m.instance;
        if !self.acceptor_preamble(from, instance, m.ballot) {
            return;
        }

        // Already voted in this ballot: re-send the recorded vote.
        if let Some(entry) = self.state.entry(instance) {
            if entry.vote_ballot() == m.ballot {
                match entry {
                    CmdLogEntry::PreAccepted { triple, .. } => {
                        let reply = Message::PreAcceptOk(PreAcceptOk {
                            instance,
                            ballot: m.ballot,
                            replica: self.index,
                            seq: triple.seq,
                            deps: triple.deps.clone(),
                        });
                        self.transport.send(from, reply);
                        return;
                    }
                    CmdLogEntry::Accepted { .. } => {
                        let reply = Message::AcceptOk(AcceptOk {
                            instance,
                            ballot: m.ballot,
                            replica: self.index,
                        });
                        self.transport.send(from, reply);
                        return;
                    }
                    _ => {}
                }
            }
        }

        let keys = self.conflict_keys_of(&m.cmd);
        let (seq, deps) = self.state.extend(instance, &keys, m.seq, &m.deps);
        let triple = CommandTriple {
            cmd: m.cmd,
            seq,
            deps: deps.clone(),
        };
        self.state.set_pre_accepted(instance, m.ballot, m.ballot, triple);
        self.state.observe(instance, &keys, &deps);
        let reply = Message::PreAcceptOk(PreAcceptOk {
            instance,
            ballot: m.ballot,
            replica: self.index,
            seq,
            deps,
        });
        self.transport.send(from, reply);
    }

    fn on_accept(&mut self, from: ReplicaIndex, m: Accept) {
        let instance = m.instance;
        if !self.acceptor_preamble(from, instance, m.ballot) {
            return;
        }

        if let Some(CmdLogEntry::Accepted { vote_ballot, .. }) = self.state.entry(instance) {
            if *vote_ballot == m.ballot {
                let reply = Message::AcceptOk(AcceptOk {
                    instance,
                    ballot: m.ballot,
                    replica: self.index,
                });
                self.transport.send(from, reply);
                return;
            }
        }

        let keys = self.conflict_keys_of(&m.cmd);
        let deps = m.deps.clone();
        let triple = CommandTriple {
            cmd: m.cmd,
            seq: m.seq,
            deps: m.deps,
        };
        self.state.set_accepted(instance, m.ballot, m.ballot, triple);
        self.state.observe(instance, &keys, &deps);
        let reply = Message::AcceptOk(AcceptOk {
            instance,
            ballot: m.ballot,
            replica: self.index,
        });
        self.transport.send(from, reply);
    }

    fn on_commit(&mut self, m: Commit) {
        let triple = CommandTriple {
            cmd: m.cmd,
            seq: m.seq,
            deps: m.deps,
        };
        self.commit_instance(m.instance, triple, false, CommitPath::Learned);
    }

    fn on_prepare(&mut self, from: ReplicaIndex, m: Prepare) {
        let instance = m.instance;
        self.state.observe_ballot(m.ballot);

        let entry = self.state.entry(instance).cloned();
        if let Some(entry) = &entry {
            if entry.is_decided() {
                let triple = entry.triple().expect("decided entries carry a triple").clone();
                self.send_commit(from, instance, triple);
                return;
            }
        }

        if let Some(role) = self.leading.get(&instance) {
            if role.ballot() < m.ballot {
                tracing::warn!(instance = ?instance, ballot = ?m.ballot, "yielding to prepare");
                self.drop_role(instance);
            }
        }

        let reply = match entry {
            None => {
                self.state.install_no_command(instance, m.ballot);
                PrepareOk {
                    instance,
                    ballot: m.ballot,
                    replica: self.index,
                    vote_ballot: Ballot::NULL,
                    status: PrepareStatus::NotSeen,
                    triple: None,
                }
            }
            Some(CmdLogEntry::NoCommand { ballot }) => {
                if ballot > m.ballot {
                    self.send_nack(from, instance);
                    return;
                }
                self.state.install_no_command(instance, m.ballot);
                PrepareOk {
                    instance,
                    ballot: m.ballot,
                    replica: self.index,
                    vote_ballot: Ballot::NULL,
                    status: PrepareStatus::NotSeen,
                    triple: None,
                }
            }
            Some(CmdLogEntry::PreAccepted {
                ballot,
                vote_ballot,
                triple,
            }) => {
                if ballot > m.ballot {
                    self.send_nack(from, instance);
                    return;
                }
                self.state.bump_ballot(instance, m.ballot);
                PrepareOk {
                    instance,
                    ballot: m.ballot,
                    replica: self.index,
                    vote_ballot,
                    status: PrepareStatus::PreAccepted,
                    triple: Some(triple),
                }
            }
            Some(CmdLogEntry::Accepted {
                ballot,
                vote_ballot,
                triple,
            }) => {
                if ballot > m.ballot {
                    self.send_nack(from, instance);
                    return;
                }
                self.state.bump_ballot(instance, m.ballot);
                PrepareOk {
                    instance,
                    ballot: m.ballot,
                    replica: self.index,
                    vote_ballot,
                    status: PrepareStatus::Accepted,
                    triple: Some(triple),
                }
            }
            Some(decided) => fatal!("prepare fell through decided entry {:?}", decided),
        };
        self.transport.send(from, Message::PrepareOk(reply));
    }

    // ---- leader paths ---------------------------------------------------

    fn on_pre_accept_ok(&mut self, m: PreAcceptOk) {
        let instance = m.instance;
        let Some(role) = self.leading.remove(&instance) else {
            tracing::warn!(instance = ?instance, "pre-accept vote for instance we no longer lead");
            return;
        };
        match role {
            LeaderRole::PreAccepting(mut p) => {
                if m.ballot != p.ballot {
                    tracing::warn!(instance = ?instance, ballot = ?m.ballot, "stale pre-accept vote");
                    self.leading.insert(instance, LeaderRole::PreAccepting(p));
                    return;
                }
                // Duplicates keep the latest copy; the value is monotone at
                // a fixed ballot.
                p.responses.insert(m.replica, (m.seq, m.deps));
                self.pre_accept_progress(instance, p);
            }
            LeaderRole::Accepting(a) => {
                // A straggler from the pre-accept round: the slow path was
                // taken before every responder reported back.
                tracing::warn!(instance = ?instance, ballot = ?m.ballot, "late pre-accept vote");
                self.leading.insert(instance, LeaderRole::Accepting(a));
            }
            LeaderRole::Preparing(p) => {
                tracing::warn!(instance = ?instance, "pre-accept vote while preparing");
                self.leading.insert(instance, LeaderRole::Preparing(p));
            }
        }
    }

    /// Run the quorum checks for a pre-accept round, committing on the fast
    /// path, falling to the slow path, or re-installing the role to wait.
    fn pre_accept_progress(&mut self, instance: Instance, mut p: PreAccepting) {
        let responses = p.responses.len();
        let fast_quorum = self.config.fast_quorum();
        let slow_quorum = self.config.slow_quorum();

        if responses >= fast_quorum {
            if !p.avoid_fast_path && p.ballot == instance.initial_ballot() {
                if let Some((seq, deps)) = Self::fast_path_value(&p, instance, fast_quorum) {
                    self.cancel_pre_accepting(&p);
                    let triple = CommandTriple {
                        cmd: p.cmd,
                        seq,
                        deps,
                    };
                    self.commit_instance(instance, triple, true, CommitPath::Fast);
                    return;
                }
            }
            self.take_slow_path(instance, p);
            return;
        }

        if responses >= slow_quorum {
            if p.avoid_fast_path {
                self.take_slow_path(instance, p);
                return;
            }
            if p.slow_path.is_none() {
                let delay = self.config.slow_path_delay;
                p.slow_path = Some(self.arm_timer(delay, |token| TimerEvent::SlowPath {
                    instance,
                    token,
                }));
            }
        }
        self.leading.insert(instance, LeaderRole::PreAccepting(p));
    }

    /// The fast path needs one `(seq, deps)` value voted by at least
    /// `fast_quorum − 1` responders other than the instance's leader.
    fn fast_path_value(
        p: &PreAccepting,
        instance: Instance,
        fast_quorum: usize,
    ) -> Option<(i32, BTreeSet<Instance>)> {
        let mut counts: BTreeMap<&(i32, BTreeSet<Instance>), usize> = BTreeMap::new();
        for (replica, value) in &p.responses {
            if *replica == instance.leader {
                continue;
            }
            *counts.entry(value).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count + 1 >= fast_quorum)
            .map(|(value, _)| value.clone())
    }

    fn take_slow_path(&mut self, instance: Instance, p: PreAccepting) {
        self.cancel_pre_accepting(&p);
        let seq = p
            .responses
            .values()
            .map(|(seq, _)| *seq)
            .max()
            .expect("leader records its own pre-accept response");
        let mut deps = BTreeSet::new();
        for (_, response_deps) in p.responses.values() {
            deps.extend(response_deps.iter().copied());
        }
        let triple = CommandTriple {
            cmd: p.cmd,
            seq,
            deps,
        };
        self.become_accepting(instance, p.ballot, triple);
    }

    fn become_accepting(&mut self, instance: Instance, ballot: Ballot, triple: CommandTriple) {
        let keys = self.conflict_keys_of(&triple.cmd);
        self.state
            .set_accepted(instance, ballot, ballot, triple.clone());
        self.state.observe(instance, &keys, &triple.deps);

        let interval = self.config.resend_interval;
        let resend = self.arm_timer(interval, |token| TimerEvent::ResendAccepts {
            instance,
            token,
        });
        let mut responses = BTreeSet::new();
        responses.insert(self.index);
        self.leading.insert(
            instance,
            LeaderRole::Accepting(Accepting {
                ballot,
                triple: triple.clone(),
                responses,
                resend,
            }),
        );

        let msg = Message::Accept(Accept {
            instance,
            ballot,
            cmd: triple.cmd,
            seq: triple.seq,
            deps: triple.deps,
        });
        for peer in self.peers() {
            self.transport.send(peer, msg.clone());
        }
        self.accept_progress(instance);
    }

    fn on_accept_ok(&mut self, m: AcceptOk) {
        let instance = m.instance;
        let Some(role) = self.leading.remove(&instance) else {
            tracing::warn!(instance = ?instance, "accept vote for instance we no longer lead");
            return;
        };
        match role {
            LeaderRole::Accepting(mut a) => {
                if m.ballot != a.ballot {
                    tracing::warn!(instance = ?instance, ballot = ?m.ballot, "stale accept vote");
                    self.leading.insert(instance, LeaderRole::Accepting(a));
                    return;
                }
                a.responses.insert(m.replica);
                self.leading.insert(instance, LeaderRole::Accepting(a));
                self.accept_progress(instance);
            }
            LeaderRole::PreAccepting(p) => {
                if m.ballot == p.ballot {
                    fatal!(
                        "accept vote in ballot {:?} while pre-accepting {:?}",
                        m.ballot,
                        instance
                    );
                }
                tracing::warn!(instance = ?instance, ballot = ?m.ballot, "stale accept vote");
                self.leading.insert(instance, LeaderRole::PreAccepting(p));
            }
            LeaderRole::Preparing(p) => {
                tracing::warn!(instance = ?instance, "accept vote while preparing");
                self.leading.insert(instance, LeaderRole::Preparing(p));
            }
        }
    }

    fn accept_progress(&mut self, instance: Instance) {
        let slow_quorum = self.config.slow_quorum();
        match self.leading.get(&instance) {
            Some(LeaderRole::Accepting(a)) if a.responses.len() >= slow_quorum => {}
            _ => return,
        }
        let Some(LeaderRole::Accepting(a)) = self.leading.remove(&instance) else {
            unreachable!("role checked above");
        };
        self.cancel(&a.resend);
        let path = if a.ballot == instance.initial_ballot() {
            CommitPath::Slow
        } else {
            CommitPath::Recovery
        };
        self.commit_instance(instance, a.triple, true, path);
    }

    // ---- recovery -------------------------------------------------------

    /// Start (or restart) recovery for an instance whose leader is
    /// suspected to have failed.
    pub fn recover(&mut self, instance: Instance) {
        if let Some(entry) = self.state.entry(instance) {
            if entry.is_decided() {
                return;
            }
        }
        self.start_prepare(instance);
    }

    fn start_prepare(&mut self, instance: Instance) {
        self.drop_role(instance);
        if let Some(timer) = self.backoffs.remove(&instance) {
            self.cancel(&timer);
        }

        let ballot = self.state.largest_ballot().next(self.index);
        self.state.observe_ballot(ballot);
        tracing::debug!(instance = ?instance, ballot = ?ballot, "preparing recovery");

        let interval = self.config.resend_interval;
        let resend = self.arm_timer(interval, |token| TimerEvent::ResendPrepares {
            instance,
            token,
        });
        self.leading.insert(
            instance,
            LeaderRole::Preparing(Preparing {
                ballot,
                responses: BTreeMap::new(),
                resend,
            }),
        );

        // Including ourselves: our own acceptor state enters the analysis
        // through a looped-back PrepareOk like everyone else's.
        let msg = Message::Prepare(Prepare { instance, ballot });
        for replica in 0..self.config.replica_count() as ReplicaIndex {
            self.transport.send(replica, msg.clone());
        }
    }

    fn on_prepare_ok(&mut self, m: PrepareOk) {
        let instance = m.instance;
        let Some(role) = self.leading.remove(&instance) else {
            tracing::warn!(instance = ?instance, "prepare response for instance we no longer lead");
            return;
        };
        match role {
            LeaderRole::Preparing(mut p) => {
                if m.ballot != p.ballot {
                    tracing::warn!(instance = ?instance, ballot = ?m.ballot, "stale prepare response");
                    self.leading.insert(instance, LeaderRole::Preparing(p));
                    return;
                }
                p.responses.insert(m.replica, m);
                if p.responses.len() >= self.config.slow_quorum() {
                    self.cancel(&p.resend);
                    self.finish_prepare(instance, p);
                } else {
                    self.leading.insert(instance, LeaderRole::Preparing(p));
                }
            }
            other => {
                // Stragglers beyond the quorum arrive after the transition.
                tracing::warn!(instance = ?instance, "late prepare response");
                self.leading.insert(instance, other);
            }
        }
    }

    /// The recovery case analysis over a slow quorum of prepare responses.
    fn finish_prepare(&mut self, instance: Instance, p: Preparing) {
        let max_vote = p
            .responses
            .values()
            .map(|ok| ok.vote_ballot)
            .max()
            .expect("prepare quorum is non-empty");
        let retained: Vec<&PrepareOk> = p
            .responses
            .values()
            .filter(|ok| ok.vote_ballot == max_vote)
            .collect();

        // An accepted vote at the highest ballot wins outright.
        if let Some(ok) = retained
            .iter()
            .find(|ok| ok.status == PrepareStatus::Accepted)
        {
            let triple = match &ok.triple {
                Some(triple) => triple.clone(),
                None => fatal!("accepted prepare response without a triple for {:?}", instance),
            };
            tracing::debug!(instance = ?instance, "recovery found accepted value");
            self.become_accepting(instance, p.ballot, triple);
            return;
        }

        // Fast-Paxos-like rule: a value pre-accepted in the instance's
        // initial ballot by f responders other than the original leader may
        // have fast-committed, so it must be finished, not restarted.
        let initial = instance.initial_ballot();
        let f = self.config.f();
        let mut matching: BTreeMap<(i32, &BTreeSet<Instance>), (usize, &PrepareOk)> =
            BTreeMap::new();
        for ok in &retained {
            if ok.status != PrepareStatus::PreAccepted
                || ok.vote_ballot != initial
                || ok.replica == instance.leader
            {
                continue;
            }
            let triple = match &ok.triple {
                Some(triple) => triple,
                None => fatal!("pre-accepted prepare response without a triple for {:?}", instance),
            };
            let entry = matching
                .entry((triple.seq, &triple.deps))
                .or_insert((0, ok));
            entry.0 += 1;
        }
        if let Some((_, (_, ok))) = matching.iter().find(|(_, (count, _))| *count >= f) {
            let triple = ok.triple.clone().expect("matched responses carry triples");
            tracing::debug!(instance = ?instance, "recovery found possible fast commit");
            self.become_accepting(instance, p.ballot, triple);
            return;
        }

        // Some replica pre-accepted the command: re-run it from the top,
        // without the fast path.
        if let Some(ok) = retained
            .iter()
            .find(|ok| ok.status == PrepareStatus::PreAccepted)
        {
            let cmd = match &ok.triple {
                Some(triple) => triple.cmd.clone(),
                None => fatal!("pre-accepted prepare response without a triple for {:?}", instance),
            };
            tracing::debug!(instance = ?instance, "recovery restarting pre-accept");
            self.begin_pre_accept(instance, p.ballot, cmd, true);
            return;
        }

        // Nothing recoverable: close the instance with a noop.
        tracing::debug!(instance = ?instance, "recovery committing noop");
        self.begin_pre_accept(instance, p.ballot, CommandOrNoop::Noop, true);
    }

    fn on_nack(&mut self, m: Nack) {
        self.state.observe_ballot(m.largest_ballot);
        let instance = m.instance;
        if !self.leading.contains_key(&instance) {
            return;
        }
        tracing::warn!(
            instance = ?instance,
            largest = ?m.largest_ballot,
            "lost ballot, backing off before recovery"
        );
        self.drop_role(instance);
        self.schedule_recovery_backoff(instance);
    }

    /// Randomised exponential backoff before re-preparing, to break
    /// recovery duels.
    fn schedule_recovery_backoff(&mut self, instance: Instance) {
        if let Some(entry) = self.state.entry(instance) {
            if entry.is_decided() {
                return;
            }
        }
        let attempt = {
            let counter = self.recovery_attempts.entry(instance).or_insert(0);
            let attempt = *counter;
            *counter = counter.saturating_add(1);
            attempt
        };
        let ceiling = self
            .config
            .recovery_backoff
            .saturating_mul(1u32 << attempt.min(6))
            .min(self.config.recovery_backoff_cap);
        let half = ceiling / 2;
        let jitter = Duration::from_millis(self.rng.gen_range(0..=half.as_millis().max(1) as u64));
        let delay = half + jitter;

        if let Some(old) = self.backoffs.remove(&instance) {
            self.cancel(&old);
        }
        let timer = self.arm_timer(delay, |token| TimerEvent::RecoveryBackoff {
            instance,
            token,
        });
        self.backoffs.insert(instance, timer);
    }

    // ---- shared transitions ---------------------------------------------

    /// Vote for our own proposal and fan the pre-accept round out.
    fn begin_pre_accept(
        &mut self,
        instance: Instance,
        ballot: Ballot,
        cmd: CommandOrNoop,
        avoid_fast_path: bool,
    ) {
        let keys = self.conflict_keys_of(&cmd);
        let (seq, deps) = self.state.extend(instance, &keys, 0, &BTreeSet::new());
        let triple = CommandTriple {
            cmd: cmd.clone(),
            seq,
            deps: deps.clone(),
        };
        self.state.set_pre_accepted(instance, ballot, ballot, triple);
        self.state.observe(instance, &keys, &deps);

        let interval = self.config.resend_interval;
        let resend = self.arm_timer(interval, |token| TimerEvent::ResendPreAccepts {
            instance,
            token,
        });
        let mut responses = BTreeMap::new();
        responses.insert(self.index, (seq, deps.clone()));
        let p = PreAccepting {
            ballot,
            cmd: cmd.clone(),
            seq,
            deps: deps.clone(),
            responses,
            avoid_fast_path,
            resend,
            slow_path: None,
        };

        let msg = Message::PreAccept(PreAccept {
            instance,
            ballot,
            cmd,
            seq,
            deps,
        });
        for peer in self.peers() {
            self.transport.send(peer, msg.clone());
        }
        self.pre_accept_progress(instance, p);
    }

    fn commit_instance(
        &mut self,
        instance: Instance,
        triple: CommandTriple,
        inform_others: bool,
        path: CommitPath,
    ) {
        self.drop_role(instance);
        if let Some(timer) = self.backoffs.remove(&instance) {
            self.cancel(&timer);
        }
        self.recovery_attempts.remove(&instance);

        if !self.state.set_committed(instance, triple.clone()) {
            return;
        }
        let keys = self.conflict_keys_of(&triple.cmd);
        self.state.observe(instance, &keys, &triple.deps);

        let counter = match path {
            CommitPath::Fast => &self.metrics.fast_path_commits,
            CommitPath::Slow => &self.metrics.slow_path_commits,
            CommitPath::Recovery => &self.metrics.recovery_commits,
            CommitPath::Learned => &self.metrics.learned_commits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            instance = ?instance,
            seq = triple.seq,
            deps = triple.deps.len(),
            path = ?path,
            "committed"
        );

        if inform_others {
            let msg = Message::Commit(Commit {
                instance,
                cmd: triple.cmd.clone(),
                seq: triple.seq,
                deps: triple.deps.clone(),
            });
            for peer in self.peers() {
                self.transport.send(peer, msg.clone());
            }
        }

        let ready = self.executor.commit(instance, triple.seq, &triple.deps);
        self.apply_ready(ready);
    }

    /// Apply instances the executor released, answer their clients, and
    /// mark them executed.
    fn apply_ready(&mut self, ready: Vec<Instance>) {
        for instance in ready {
            let triple = match self.state.entry(instance) {
                Some(CmdLogEntry::Committed { triple }) => triple.clone(),
                other => fatal!("executor released {:?} in state {:?}", instance, other),
            };
            match triple.cmd {
                CommandOrNoop::Noop => {}
                CommandOrNoop::Command(cmd) => {
                    let cached = self.state.client_lookup(&cmd.client, cmd.pseudonym).cloned();
                    match cached {
                        // A retry of an already-applied command: answer from
                        // the cache without touching the state machine.
                        Some((highest, result)) if cmd.client_id <= highest => {
                            let reply = ClientReply {
                                pseudonym: cmd.pseudonym,
                                client_id: highest,
                                result,
                            };
                            self.transport.reply(&cmd.client, reply);
                        }
                        _ => {
                            let result = self.sm.apply(&cmd.payload);
                            self.state.client_update(
                                &cmd.client,
                                cmd.pseudonym,
                                cmd.client_id,
                                result.clone(),
                            );
                            let reply = ClientReply {
                                pseudonym: cmd.pseudonym,
                                client_id: cmd.client_id,
                                result,
                            };
                            self.transport.reply(&cmd.client, reply);
                        }
                    }
                }
            }
            self.state.mark_executed(instance);
            self.metrics.executed.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics
            .graph_vertices
            .store(self.executor.graph_len() as u64, Ordering::Relaxed);
        self.metrics
            .committed_pending
            .store(self.executor.committed_len() as u64, Ordering::Relaxed);
    }

    // ---- timers ---------------------------------------------------------

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::ResendPreAccepts { instance, token } => {
                let interval = self.config.resend_interval;
                let peers = self.peers();
                let Some(LeaderRole::PreAccepting(p)) = self.leading.get_mut(&instance) else {
                    return;
                };
                if p.resend.token != token {
                    return;
                }
                let msg = Message::PreAccept(PreAccept {
                    instance,
                    ballot: p.ballot,
                    cmd: p.cmd.clone(),
                    seq: p.seq,
                    deps: p.deps.clone(),
                });
                let targets: Vec<ReplicaIndex> = peers
                    .into_iter()
                    .filter(|r| !p.responses.contains_key(r))
                    .collect();
                let token = self.next_token;
                self.next_token += 1;
                let key = self
                    .timers
                    .insert(TimerEvent::ResendPreAccepts { instance, token }, interval);
                p.resend = TimerRef { key, token };
                for target in targets {
                    self.transport.send(target, msg.clone());
                }
            }
            TimerEvent::ResendAccepts { instance, token } => {
                let interval = self.config.resend_interval;
                let peers = self.peers();
                let Some(LeaderRole::Accepting(a)) = self.leading.get_mut(&instance) else {
                    return;
                };
                if a.resend.token != token {
                    return;
                }
                let msg = Message::Accept(Accept {
                    instance,
                    ballot: a.ballot,
                    cmd: a.triple.cmd.clone(),
                    seq: a.triple.seq,
                    deps: a.triple.deps.clone(),
                });
                let targets: Vec<ReplicaIndex> = peers
                    .into_iter()
                    .filter(|r| !a.responses.contains(r))
                    .collect();
                let token = self.next_token;
                self.next_token += 1;
                let key = self
                    .timers
                    .insert(TimerEvent::ResendAccepts { instance, token }, interval);
                a.resend = TimerRef { key, token };
                for target in targets {
                    self.transport.send(target, msg.clone());
                }
            }
            TimerEvent::ResendPrepares { instance, token } => {
                let interval = self.config.resend_interval;
                let all: Vec<ReplicaIndex> =
                    (0..self.config.replica_count() as ReplicaIndex).collect();
                let Some(LeaderRole::Preparing(p)) = self.leading.get_mut(&instance) else {
                    return;
                };
                if p.resend.token != token {
                    return;
                }
                let msg = Message::Prepare(Prepare {
                    instance,
                    ballot: p.ballot,
                });
                let targets: Vec<ReplicaIndex> = all
                    .into_iter()
                    .filter(|r| !p.responses.contains_key(r))
                    .collect();
                let token = self.next_token;
                self.next_token += 1;
                let key = self
                    .timers
                    .insert(TimerEvent::ResendPrepares { instance, token }, interval);
                p.resend = TimerRef { key, token };
                for target in targets {
                    self.transport.send(target, msg.clone());
                }
            }
            TimerEvent::SlowPath { instance, token } => {
                match self.leading.get(&instance) {
                    Some(LeaderRole::PreAccepting(p))
                        if p.slow_path.as_ref().map(|t| t.token) == Some(token) => {}
                    _ => return,
                }
                let Some(LeaderRole::PreAccepting(p)) = self.leading.remove(&instance) else {
                    unreachable!("role checked above");
                };
                tracing::debug!(instance = ?instance, "fast quorum timed out, taking slow path");
                self.take_slow_path(instance, p);
            }
            TimerEvent::RecoveryBackoff { instance, token } => {
                match self.backoffs.get(&instance) {
                    Some(timer) if timer.token == token => {}
                    _ => return,
                }
                self.backoffs.remove(&instance);
                self.recover(instance);
            }
        }
    }

    fn arm_timer(
        &mut self,
        delay: Duration,
        make: impl FnOnce(u64) -> TimerEvent,
    ) -> TimerRef {
        let token = self.next_token;
        self.next_token += 1;
        let key = self.timers.insert(make(token), delay);
        TimerRef { key, token }
    }

    fn cancel(&mut self, timer: &TimerRef) {
        // try_remove: the timer may already have fired or been drained.
        let _ = self.timers.try_remove(&timer.key);
    }

    fn cancel_pre_accepting(&mut self, p: &PreAccepting) {
        let _ = self.timers.try_remove(&p.resend.key);
        if let Some(slow_path) = &p.slow_path {
            let _ = self.timers.try_remove(&slow_path.key);
        }
    }

    fn drop_role(&mut self, instance: Instance) {
        let Some(role) = self.leading.remove(&instance) else {
            return;
        };
        match &role {
            LeaderRole::PreAccepting(p) => self.cancel_pre_accepting(p),
            LeaderRole::Accepting(a) => self.cancel(&a.resend),
            LeaderRole::Preparing(p) => self.cancel(&p.resend),
        }
    }

    // ---- helpers --------------------------------------------------------

    fn conflict_keys_of(&self, cmd: &CommandOrNoop) -> Vec<Bytes> {
        match cmd {
            CommandOrNoop::Command(c) => self.sm.conflict_keys(&c.payload),
            CommandOrNoop::Noop => Vec::new(),
        }
    }

    fn peers(&self) -> Vec<ReplicaIndex> {
        (0..self.config.replica_count() as ReplicaIndex)
            .filter(|r| *r != self.index)
            .collect()
    }

    fn send_commit(&self, to: ReplicaIndex, instance: Instance, triple: CommandTriple) {
        let msg = Message::Commit(Commit {
            instance,
            cmd: triple.cmd,
            seq: triple.seq,
            deps: triple.deps,
        });
        self.transport.send(to, msg);
    }

    fn send_nack(&self, to: ReplicaIndex, instance: Instance) {
        let msg = Message::Nack(Nack {
            instance,
            largest_ballot: self.state.largest_ballot(),
        });
        self.transport.send(to, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epaxos::types::ClientAddr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(ReplicaIndex, Message)>>,
        replies: Mutex<Vec<(ClientAddr, ClientReply)>>,
    }

    impl Transport for RecordingTransport {
        fn send(&self, to: ReplicaIndex, msg: Message) {
            self.sent.lock().unwrap().push((to, msg));
        }

        fn reply(&self, to: &ClientAddr, reply: ClientReply) {
            self.replies.lock().unwrap().push((to.clone(), reply));
        }
    }

    impl RecordingTransport {
        fn drain(&self) -> Vec<(ReplicaIndex, Message)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }

        fn drain_replies(&self) -> Vec<(ClientAddr, ClientReply)> {
            std::mem::take(&mut self.replies.lock().unwrap())
        }
    }

    /// Conflicts on the part of the payload before `=`; applies by echoing
    /// the payload.
    struct KeyedSm {
        applied: Arc<Mutex<Vec<Bytes>>>,
    }

    impl StateMachine for KeyedSm {
        fn conflict_keys(&self, payload: &Bytes) -> Vec<Bytes> {
            match payload.iter().position(|b| *b == b'=') {
                Some(split) => vec![payload.slice(..split)],
                None => vec![payload.clone()],
            }
        }

        fn apply(&mut self, payload: &Bytes) -> Bytes {
            self.applied.lock().unwrap().push(payload.clone());
            payload.clone()
        }
    }

    fn replica(
        n: usize,
        index: ReplicaIndex,
    ) -> (Replica, Arc<RecordingTransport>, Arc<Mutex<Vec<Bytes>>>) {
        let transport = Arc::new(RecordingTransport::default());
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sm = Box::new(KeyedSm {
            applied: Arc::clone(&applied),
        });
        let config = Config::new((0..n).map(|i| format!("node-{i}")).collect());
        let r = Replica::new(config, index, transport.clone(), sm).expect("valid config");
        (r, transport, applied)
    }

    fn inst(leader: ReplicaIndex, number: i32) -> Instance {
        Instance { leader, number }
    }

    fn ballot(ordering: i32, replica: ReplicaIndex) -> Ballot {
        Ballot { ordering, replica }
    }

    fn client(name: &str) -> ClientAddr {
        ClientAddr(Bytes::copy_from_slice(name.as_bytes()))
    }

    fn command(name: &str, pseudonym: i32, client_id: i32, payload: &str) -> CommandOrNoop {
        CommandOrNoop::Command(Command {
            client: client(name),
            pseudonym,
            client_id,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        })
    }

    fn pre_accept(instance: Instance, b: Ballot, cmd: CommandOrNoop) -> Message {
        Message::PreAccept(PreAccept {
            instance,
            ballot: b,
            cmd,
            seq: 0,
            deps: BTreeSet::new(),
        })
    }

    fn pre_accept_ok(
        instance: Instance,
        b: Ballot,
        replica: ReplicaIndex,
        seq: i32,
        deps: &[Instance],
    ) -> Message {
        Message::PreAcceptOk(PreAcceptOk {
            instance,
            ballot: b,
            replica,
            seq,
            deps: deps.iter().copied().collect(),
        })
    }

    fn prepare_ok(
        instance: Instance,
        b: Ballot,
        replica: ReplicaIndex,
        vote_ballot: Ballot,
        status: PrepareStatus,
        triple: Option<CommandTriple>,
    ) -> Message {
        Message::PrepareOk(PrepareOk {
            instance,
            ballot: b,
            replica,
            vote_ballot,
            status,
            triple,
        })
    }

    async fn fire_next_timer(r: &mut Replica) {
        let expired = futures_util::future::poll_fn(|cx| r.timers.poll_expired(cx))
            .await
            .expect("a timer is armed");
        r.handle_timer(expired.into_inner());
    }

    #[test]
    fn pre_accept_vote_extends_dependencies() {
        let (mut r, transport, _) = replica(3, 1);
        let first = inst(0, 0);
        r.receive(0, pre_accept(first, ballot(0, 0), command("c1", 1, 1, "k=a")));

        let sent = transport.drain();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            (0, Message::PreAcceptOk(ok)) => {
                assert_eq!(ok.seq, 0);
                assert!(ok.deps.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }

        // An interfering command from another leader picks up the first as
        // a dependency and a larger sequence number.
        let second = inst(2, 0);
        r.receive(2, pre_accept(second, ballot(0, 2), command("c2", 2, 1, "k=b")));
        let sent = transport.drain();
        match &sent[0] {
            (2, Message::PreAcceptOk(ok)) => {
                assert_eq!(ok.seq, 1);
                assert_eq!(ok.deps.iter().copied().collect::<Vec<_>>(), vec![first]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn pre_accept_replay_resends_recorded_vote() {
        let (mut r, transport, _) = replica(3, 1);
        let i = inst(0, 0);
        let msg = pre_accept(i, ballot(0, 0), command("c1", 1, 1, "k=a"));
        r.receive(0, msg.clone());
        let first = transport.drain();

        r.receive(0, msg);
        let second = transport.drain();
        assert_eq!(first, second);
        assert!(matches!(
            r.log_entry(i),
            Some(CmdLogEntry::PreAccepted { .. })
        ));
    }

    #[test]
    fn accept_replay_resends_recorded_vote() {
        let (mut r, transport, _) = replica(3, 1);
        let i = inst(0, 0);
        let msg = Message::Accept(Accept {
            instance: i,
            ballot: ballot(0, 0),
            cmd: command("c1", 1, 1, "k=a"),
            seq: 2,
            deps: BTreeSet::new(),
        });
        r.receive(0, msg.clone());
        let first = transport.drain();
        assert!(matches!(&first[0], (0, Message::AcceptOk(_))));

        r.receive(0, msg);
        let second = transport.drain();
        assert_eq!(first, second);
        let entry = r.log_entry(i).unwrap();
        assert!(matches!(entry, CmdLogEntry::Accepted { .. }));
        assert_eq!(entry.triple().unwrap().seq, 2);
    }

    #[test]
    fn stale_ballot_is_nacked_with_largest() {
        let (mut r, transport, _) = replica(3, 1);
        let i = inst(0, 0);
        r.receive(2, pre_accept(i, ballot(1, 2), command("c1", 1, 1, "k=a")));
        transport.drain();

        r.receive(0, pre_accept(i, ballot(0, 0), command("c1", 1, 1, "k=a")));
        let sent = transport.drain();
        match &sent[0] {
            (0, Message::Nack(nack)) => {
                assert_eq!(nack.instance, i);
                assert_eq!(nack.largest_ballot, ballot(1, 2));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn commit_applies_and_answers_client() {
        let (mut r, transport, applied) = replica(3, 1);
        let i = inst(0, 0);
        r.receive(
            0,
            Message::Commit(Commit {
                instance: i,
                cmd: command("c1", 7, 1, "k=a"),
                seq: 0,
                deps: BTreeSet::new(),
            }),
        );

        assert_eq!(applied.lock().unwrap().len(), 1);
        let replies = transport.drain_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, client("c1"));
        assert_eq!(replies[0].1.pseudonym, 7);
        assert_eq!(replies[0].1.client_id, 1);
        assert!(matches!(r.log_entry(i), Some(CmdLogEntry::Executed { .. })));

        let snapshot = r.metrics().snapshot();
        assert_eq!(snapshot.learned_commits, 1);
        assert_eq!(snapshot.executed, 1);
    }

    #[test]
    fn replayed_commit_is_ignored() {
        let (mut r, transport, applied) = replica(3, 1);
        let i = inst(0, 0);
        let msg = Message::Commit(Commit {
            instance: i,
            cmd: command("c1", 7, 1, "k=a"),
            seq: 0,
            deps: BTreeSet::new(),
        });
        r.receive(0, msg.clone());
        transport.drain_replies();

        r.receive(0, msg);
        assert_eq!(applied.lock().unwrap().len(), 1);
        assert!(transport.drain_replies().is_empty());
        assert_eq!(r.metrics().snapshot().executed, 1);
    }

    #[test]
    fn decided_instance_answers_pre_accept_with_commit() {
        let (mut r, transport, _) = replica(3, 1);
        let i = inst(0, 0);
        r.receive(
            0,
            Message::Commit(Commit {
                instance: i,
                cmd: command("c1", 7, 1, "k=a"),
                seq: 0,
                deps: BTreeSet::new(),
            }),
        );
        transport.drain();

        r.receive(2, pre_accept(i, ballot(5, 2), command("c1", 7, 1, "k=a")));
        let sent = transport.drain();
        assert!(matches!(&sent[0], (2, Message::Commit(_))));
    }

    #[test]
    fn duplicate_command_is_deduplicated_at_apply() {
        let (mut r, transport, applied) = replica(3, 1);
        r.receive(
            0,
            Message::Commit(Commit {
                instance: inst(0, 0),
                cmd: command("c1", 7, 42, "k=a"),
                seq: 0,
                deps: BTreeSet::new(),
            }),
        );
        transport.drain_replies();

        // The client retried and the retry was committed as a new instance.
        r.receive(
            0,
            Message::Commit(Commit {
                instance: inst(0, 1),
                cmd: command("c1", 7, 42, "k=a"),
                seq: 1,
                deps: [inst(0, 0)].into_iter().collect(),
            }),
        );
        assert_eq!(applied.lock().unwrap().len(), 1);
        let replies = transport.drain_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.client_id, 42);
    }

    #[test]
    fn retried_request_is_answered_from_the_client_table() {
        let (mut r, transport, applied) = replica(3, 1);
        r.receive(
            0,
            Message::Commit(Commit {
                instance: inst(0, 0),
                cmd: command("c1", 7, 42, "k=a"),
                seq: 0,
                deps: BTreeSet::new(),
            }),
        );
        transport.drain_replies();

        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 7,
            client_id: 42,
            payload: Bytes::from_static(b"k=a"),
        });
        assert!(transport.drain().is_empty(), "no new round should start");
        let replies = transport.drain_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.client_id, 42);
        assert_eq!(applied.lock().unwrap().len(), 1);
    }

    #[test]
    fn prepare_installs_marker_and_reports_not_seen() {
        let (mut r, transport, _) = replica(3, 1);
        let i = inst(0, 0);
        r.receive(2, Message::Prepare(Prepare { instance: i, ballot: ballot(1, 2) }));

        let sent = transport.drain();
        match &sent[0] {
            (2, Message::PrepareOk(ok)) => {
                assert_eq!(ok.status, PrepareStatus::NotSeen);
                assert!(ok.vote_ballot.is_null());
                assert!(ok.triple.is_none());
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(matches!(r.log_entry(i), Some(CmdLogEntry::NoCommand { .. })));

        // A lower-ballot prepare is rejected outright.
        r.receive(0, Message::Prepare(Prepare { instance: i, ballot: ballot(0, 0) }));
        let sent = transport.drain();
        assert!(matches!(&sent[0], (0, Message::Nack(_))));
    }

    #[test]
    fn prepare_reports_recorded_vote_and_bumps_ballot() {
        let (mut r, transport, _) = replica(3, 1);
        let i = inst(0, 0);
        r.receive(0, pre_accept(i, ballot(0, 0), command("c1", 1, 1, "k=a")));
        transport.drain();

        r.receive(2, Message::Prepare(Prepare { instance: i, ballot: ballot(1, 2) }));
        let sent = transport.drain();
        match &sent[0] {
            (2, Message::PrepareOk(ok)) => {
                assert_eq!(ok.status, PrepareStatus::PreAccepted);
                assert_eq!(ok.vote_ballot, ballot(0, 0));
                assert!(ok.triple.is_some());
            }
            other => panic!("unexpected message {other:?}"),
        }
        let entry = r.log_entry(i).unwrap();
        assert_eq!(entry.ballot(), ballot(1, 2));
        assert_eq!(entry.vote_ballot(), ballot(0, 0));
    }

    #[tokio::test]
    async fn fast_path_commits_after_matching_quorum() {
        let (mut r, transport, applied) = replica(5, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        let sent = transport.drain();
        assert_eq!(sent.len(), 4, "pre-accept fans out to the other replicas");

        let i = inst(0, 0);
        r.receive(1, pre_accept_ok(i, ballot(0, 0), 1, 0, &[]));
        r.receive(2, pre_accept_ok(i, ballot(0, 0), 2, 0, &[]));
        assert!(r.is_leading(i));
        r.receive(3, pre_accept_ok(i, ballot(0, 0), 3, 0, &[]));

        assert!(!r.is_leading(i));
        assert!(matches!(r.log_entry(i), Some(CmdLogEntry::Executed { .. })));
        assert_eq!(applied.lock().unwrap().len(), 1);
        assert_eq!(r.metrics().snapshot().fast_path_commits, 1);

        let sent = transport.drain();
        let commits = sent
            .iter()
            .filter(|(_, m)| matches!(m, Message::Commit(_)))
            .count();
        assert_eq!(commits, 4);
        assert_eq!(transport.drain_replies().len(), 1);
    }

    #[tokio::test]
    async fn divergent_votes_fall_to_the_slow_path() {
        let (mut r, transport, _) = replica(5, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        transport.drain();

        let i = inst(0, 0);
        let other_a = inst(1, 7);
        let other_b = inst(2, 3);
        r.receive(1, pre_accept_ok(i, ballot(0, 0), 1, 0, &[]));
        r.receive(2, pre_accept_ok(i, ballot(0, 0), 2, 1, &[other_a]));
        r.receive(3, pre_accept_ok(i, ballot(0, 0), 3, 1, &[other_b]));

        // Slow path: the union of every response.
        let sent = transport.drain();
        let accepts: Vec<&Accept> = sent
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Accept(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(accepts.len(), 4);
        assert_eq!(accepts[0].seq, 1);
        assert_eq!(
            accepts[0].deps.iter().copied().collect::<Vec<_>>(),
            vec![other_a, other_b]
        );

        r.receive(1, Message::AcceptOk(AcceptOk { instance: i, ballot: ballot(0, 0), replica: 1 }));
        r.receive(2, Message::AcceptOk(AcceptOk { instance: i, ballot: ballot(0, 0), replica: 2 }));
        assert!(matches!(r.log_entry(i), Some(CmdLogEntry::Committed { .. })));
        assert_eq!(r.metrics().snapshot().slow_path_commits, 1);
        // Dependencies are not locally committed, so execution waits.
        assert_eq!(r.metrics().snapshot().executed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_quorum_timeout_takes_the_slow_path() {
        let (mut r, transport, _) = replica(5, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        transport.drain();

        let i = inst(0, 0);
        r.receive(1, pre_accept_ok(i, ballot(0, 0), 1, 0, &[]));
        r.receive(2, pre_accept_ok(i, ballot(0, 0), 2, 0, &[]));

        // The slow-path timer expires before the resend timer.
        fire_next_timer(&mut r).await;

        let sent = transport.drain();
        assert!(
            sent.iter().any(|(_, m)| matches!(m, Message::Accept(_))),
            "slow path should broadcast accepts, got {sent:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resend_targets_only_non_responders() {
        let (mut r, transport, _) = replica(3, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        transport.drain();

        fire_next_timer(&mut r).await;
        let sent = transport.drain();
        assert_eq!(sent.len(), 2, "both peers are outstanding: {sent:?}");
        assert!(sent.iter().all(|(_, m)| matches!(m, Message::PreAccept(_))));
    }

    #[tokio::test]
    async fn stale_timer_tokens_are_ignored() {
        let (mut r, transport, _) = replica(3, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        transport.drain();

        let i = inst(0, 0);
        r.handle_timer(TimerEvent::ResendPreAccepts { instance: i, token: u64::MAX });
        r.handle_timer(TimerEvent::SlowPath { instance: i, token: u64::MAX });
        assert!(transport.drain().is_empty());
        assert!(r.is_leading(i));
    }

    #[tokio::test(start_paused = true)]
    async fn nack_backs_off_then_restarts_recovery() {
        let (mut r, transport, _) = replica(3, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        transport.drain();

        let i = inst(0, 0);
        r.receive(1, Message::Nack(Nack { instance: i, largest_ballot: ballot(1, 1) }));
        assert!(!r.is_leading(i), "ballot loss demotes the leader");
        assert!(transport.drain().is_empty());

        // The backoff timer is the only one left armed.
        fire_next_timer(&mut r).await;
        assert!(r.is_leading(i));
        let sent = transport.drain();
        let prepares: Vec<&Prepare> = sent
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Prepare(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(prepares.len(), 3, "prepare goes to every replica");
        assert_eq!(prepares[0].ballot, ballot(2, 0));
    }

    #[tokio::test]
    async fn recovery_finishes_an_accepted_value() {
        let (mut r, transport, _) = replica(3, 2);
        let i = inst(0, 0);
        r.recover(i);
        transport.drain();
        let b = ballot(0, 2);

        let triple = CommandTriple {
            cmd: command("c1", 1, 1, "k=v"),
            seq: 4,
            deps: BTreeSet::new(),
        };
        r.receive(
            1,
            prepare_ok(i, b, 1, ballot(0, 0), PrepareStatus::Accepted, Some(triple.clone())),
        );
        r.receive(2, prepare_ok(i, b, 2, Ballot::NULL, PrepareStatus::NotSeen, None));

        let sent = transport.drain();
        let accepts: Vec<&Accept> = sent
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Accept(a) => Some(a),
                _ => None,
            })
            .collect();
        assert!(!accepts.is_empty());
        assert_eq!(accepts[0].seq, 4);
        assert_eq!(accepts[0].ballot, b);
    }

    #[tokio::test]
    async fn recovery_adopts_a_possible_fast_commit() {
        let (mut r, transport, _) = replica(5, 4);
        let i = inst(0, 0);
        // Ballots from the crashed leader's round were observed earlier.
        r.receive(0, pre_accept(inst(0, 9), ballot(0, 0), command("cx", 9, 1, "other=x")));
        transport.drain();

        r.recover(i);
        transport.drain();
        let b = ballot(1, 4);

        let triple = CommandTriple {
            cmd: command("c1", 1, 1, "k=v"),
            seq: 3,
            deps: [inst(1, 2)].into_iter().collect(),
        };
        r.receive(
            1,
            prepare_ok(i, b, 1, ballot(0, 0), PrepareStatus::PreAccepted, Some(triple.clone())),
        );
        r.receive(4, prepare_ok(i, b, 4, Ballot::NULL, PrepareStatus::NotSeen, None));
        r.receive(
            2,
            prepare_ok(i, b, 2, ballot(0, 0), PrepareStatus::PreAccepted, Some(triple.clone())),
        );

        // f = 2 matching pre-accepts from non-leader replicas: the value may
        // have fast-committed, so it is finished with an accept round.
        let sent = transport.drain();
        let accepts: Vec<&Accept> = sent
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Accept(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(accepts.len(), 4);
        assert_eq!(accepts[0].seq, 3);
        assert_eq!(accepts[0].deps, triple.deps);
    }

    #[tokio::test]
    async fn recovery_commits_noop_when_nothing_was_seen() {
        let (mut r, transport, applied) = replica(3, 1);
        let i = inst(0, 0);
        r.recover(i);
        transport.drain();
        let b = ballot(0, 1);

        r.receive(1, prepare_ok(i, b, 1, Ballot::NULL, PrepareStatus::NotSeen, None));
        r.receive(2, prepare_ok(i, b, 2, Ballot::NULL, PrepareStatus::NotSeen, None));

        // Nothing recoverable: a noop pre-accept round starts in the
        // recovery ballot.
        let sent = transport.drain();
        let noop_pre_accepts: Vec<&PreAccept> = sent
            .iter()
            .filter_map(|(_, m)| match m {
                Message::PreAccept(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(noop_pre_accepts.len(), 2);
        assert_eq!(noop_pre_accepts[0].ballot, b);
        assert!(matches!(noop_pre_accepts[0].cmd, CommandOrNoop::Noop));

        r.receive(2, pre_accept_ok(i, b, 2, 0, &[]));
        // avoid_fast_path: a slow quorum goes straight to accepts.
        let sent = transport.drain();
        assert!(sent.iter().any(|(_, m)| matches!(m, Message::Accept(_))));

        r.receive(2, Message::AcceptOk(AcceptOk { instance: i, ballot: b, replica: 2 }));
        assert!(matches!(r.log_entry(i), Some(CmdLogEntry::Executed { .. })));
        assert!(applied.lock().unwrap().is_empty(), "noops do not touch the state machine");
        assert_eq!(r.metrics().snapshot().recovery_commits, 1);
    }

    #[tokio::test]
    async fn straggling_pre_accept_vote_after_slow_path_is_ignored() {
        let (mut r, transport, _) = replica(5, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        transport.drain();

        let i = inst(0, 0);
        r.receive(1, pre_accept_ok(i, ballot(0, 0), 1, 0, &[]));
        r.receive(2, pre_accept_ok(i, ballot(0, 0), 2, 1, &[inst(1, 1)]));
        r.receive(3, pre_accept_ok(i, ballot(0, 0), 3, 1, &[inst(2, 2)]));
        transport.drain();

        // The slow path went out before the last responder reported back;
        // its vote must not disturb the accept round.
        r.receive(4, pre_accept_ok(i, ballot(0, 0), 4, 0, &[]));
        assert!(transport.drain().is_empty());
        assert!(r.is_leading(i));
    }

    #[tokio::test]
    #[should_panic(expected = "accept vote in ballot")]
    async fn matching_ballot_accept_vote_while_pre_accepting_aborts() {
        let (mut r, transport, _) = replica(5, 0);
        r.handle_request(ClientRequest {
            client: client("c1"),
            pseudonym: 1,
            client_id: 1,
            payload: Bytes::from_static(b"k=v"),
        });
        transport.drain();

        // No accept round ever ran in this ballot, so an accept vote is a
        // protocol violation.
        let i = inst(0, 0);
        r.receive(1, Message::AcceptOk(AcceptOk { instance: i, ballot: ballot(0, 0), replica: 1 }));
    }
}
