//! Per-replica consensus state: the command log, the interference frontier
//! used to compute dependencies, and the client dedup table.
//!
//! This module holds no protocol logic; the mutators enforce the ballot and
//! status invariants and abort on transitions the protocol cannot produce,
//! which keeps the handlers in `replica` free of defensive bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;

use super::types::{fatal, Ballot, ClientAddr, CommandTriple, Instance, ReplicaIndex};

/// Lifecycle of one instance in the command log.
///
/// `ballot` is the largest ballot this replica has joined for the instance;
/// `vote_ballot` is the ballot of the vote it actually cast. Commits are
/// final, so decided entries carry no ballots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmdLogEntry {
    NoCommand {
        ballot: Ballot,
    },
    PreAccepted {
        ballot: Ballot,
        vote_ballot: Ballot,
        triple: CommandTriple,
    },
    Accepted {
        ballot: Ballot,
        vote_ballot: Ballot,
        triple: CommandTriple,
    },
    Committed {
        triple: CommandTriple,
    },
    Executed {
        triple: CommandTriple,
    },
}

impl CmdLogEntry {
    /// The joined ballot, or `Ballot::NULL` for decided entries (ballots no
    /// longer matter once an instance is committed).
    pub fn ballot(&self) -> Ballot {
        match self {
            CmdLogEntry::NoCommand { ballot } => *ballot,
            CmdLogEntry::PreAccepted { ballot, .. } => *ballot,
            CmdLogEntry::Accepted { ballot, .. } => *ballot,
            CmdLogEntry::Committed { .. } | CmdLogEntry::Executed { .. } => Ballot::NULL,
        }
    }

    pub fn vote_ballot(&self) -> Ballot {
        match self {
            CmdLogEntry::PreAccepted { vote_ballot, .. } => *vote_ballot,
            CmdLogEntry::Accepted { vote_ballot, .. } => *vote_ballot,
            _ => Ballot::NULL,
        }
    }

    pub fn triple(&self) -> Option<&CommandTriple> {
        match self {
            CmdLogEntry::NoCommand { .. } => None,
            CmdLogEntry::PreAccepted { triple, .. } => Some(triple),
            CmdLogEntry::Accepted { triple, .. } => Some(triple),
            CmdLogEntry::Committed { triple } => Some(triple),
            CmdLogEntry::Executed { triple } => Some(triple),
        }
    }

    pub fn is_decided(&self) -> bool {
        matches!(
            self,
            CmdLogEntry::Committed { .. } | CmdLogEntry::Executed { .. }
        )
    }
}

/// Mutable replica state (owned by the event loop, never shared).
pub struct State {
    cmd_log: BTreeMap<Instance, CmdLogEntry>,
    /// Largest ballot seen in any inbound or locally issued message; the
    /// basis for recovery ballots.
    largest_ballot: Ballot,
    next_instance: i32,
    /// Interference frontier: per conflict key, the instances no later
    /// interfering instance is known to depend on. Superseded members are
    /// removed because a dependency on their successor orders after them
    /// transitively.
    frontier: HashMap<Bytes, BTreeSet<Instance>>,
    /// `(client, pseudonym)` → `(highest client id, result of that id)`.
    client_table: HashMap<(ClientAddr, i32), (i32, Bytes)>,
}

impl State {
    pub fn new() -> Self {
        State {
            cmd_log: BTreeMap::new(),
            largest_ballot: Ballot::NULL,
            next_instance: 0,
            frontier: HashMap::new(),
            client_table: HashMap::new(),
        }
    }

    pub fn entry(&self, instance: Instance) -> Option<&CmdLogEntry> {
        self.cmd_log.get(&instance)
    }

    /// The ballot an inbound message must meet for this instance.
    pub fn current_ballot(&self, instance: Instance) -> Ballot {
        self.cmd_log
            .get(&instance)
            .map(|e| e.ballot())
            .unwrap_or(Ballot::NULL)
    }

    pub fn largest_ballot(&self) -> Ballot {
        self.largest_ballot
    }

    pub fn observe_ballot(&mut self, ballot: Ballot) {
        if ballot > self.largest_ballot {
            self.largest_ballot = ballot;
        }
    }

    pub fn allocate_instance(&mut self, leader: ReplicaIndex) -> Instance {
        let number = self.next_instance;
        self.next_instance += 1;
        Instance { leader, number }
    }

    /// Union the local interfering set into `deps` and return a sequence
    /// number larger than every interfering instance's.
    pub fn extend(
        &self,
        instance: Instance,
        keys: &[Bytes],
        seq: i32,
        deps: &BTreeSet<Instance>,
    ) -> (i32, BTreeSet<Instance>) {
        let mut deps = deps.clone();
        let mut max_interfering = -1;
        for key in keys {
            let Some(members) = self.frontier.get(key) else {
                continue;
            };
            for member in members {
                if *member == instance {
                    continue;
                }
                deps.insert(*member);
                max_interfering = max_interfering.max(self.seq_of(*member));
            }
        }
        (seq.max(max_interfering + 1), deps)
    }

    /// Record `instance` in the frontier for `keys`, superseding the
    /// instances it depends on.
    pub fn observe(&mut self, instance: Instance, keys: &[Bytes], deps: &BTreeSet<Instance>) {
        for key in keys {
            let members = self.frontier.entry(key.clone()).or_default();
            for dep in deps {
                members.remove(dep);
            }
            members.insert(instance);
        }
    }

    fn seq_of(&self, instance: Instance) -> i32 {
        match self.cmd_log.get(&instance).and_then(|e| e.triple()) {
            Some(triple) => triple.seq,
            None => fatal!("frontier member {:?} has no command log triple", instance),
        }
    }

    /// Install or bump a `NoCommand` marker from a `Prepare`.
    pub fn install_no_command(&mut self, instance: Instance, ballot: Ballot) {
        match self.cmd_log.get(&instance) {
            None => {}
            Some(CmdLogEntry::NoCommand { ballot: stored }) if *stored <= ballot => {}
            Some(other) => fatal!(
                "installing NoCommand at {:?} over {:?} for {:?}",
                ballot,
                other,
                instance
            ),
        }
        self.cmd_log
            .insert(instance, CmdLogEntry::NoCommand { ballot });
    }

    pub fn set_pre_accepted(
        &mut self,
        instance: Instance,
        ballot: Ballot,
        vote_ballot: Ballot,
        triple: CommandTriple,
    ) {
        self.check_vote(instance, ballot, vote_ballot);
        self.cmd_log.insert(
            instance,
            CmdLogEntry::PreAccepted {
                ballot,
                vote_ballot,
                triple,
            },
        );
    }

    pub fn set_accepted(
        &mut self,
        instance: Instance,
        ballot: Ballot,
        vote_ballot: Ballot,
        triple: CommandTriple,
    ) {
        self.check_vote(instance, ballot, vote_ballot);
        self.cmd_log.insert(
            instance,
            CmdLogEntry::Accepted {
                ballot,
                vote_ballot,
                triple,
            },
        );
    }

    fn check_vote(&self, instance: Instance, ballot: Ballot, vote_ballot: Ballot) {
        if vote_ballot > ballot {
            fatal!(
                "vote ballot {:?} above joined ballot {:?} for {:?}",
                vote_ballot,
                ballot,
                instance
            );
        }
        let Some(stored) = self.cmd_log.get(&instance) else {
            return;
        };
        if stored.is_decided() {
            fatal!("vote in {:?} for decided instance {:?}", ballot, instance);
        }
        if ballot < stored.ballot() || vote_ballot < stored.vote_ballot() {
            fatal!(
                "ballot regression for {:?}: {:?}/{:?} under {:?}",
                instance,
                ballot,
                vote_ballot,
                stored
            );
        }
    }

    /// Raise the joined ballot without voting (a `Prepare` was answered).
    pub fn bump_ballot(&mut self, instance: Instance, ballot: Ballot) {
        let Some(entry) = self.cmd_log.get_mut(&instance) else {
            fatal!("ballot bump for unknown instance {:?}", instance);
        };
        match entry {
            CmdLogEntry::NoCommand { ballot: stored }
            | CmdLogEntry::PreAccepted { ballot: stored, .. }
            | CmdLogEntry::Accepted { ballot: stored, .. } => {
                if *stored > ballot {
                    fatal!(
                        "ballot bump regression for {:?}: {:?} under {:?}",
                        instance,
                        ballot,
                        stored
                    );
                }
                *stored = ballot;
            }
            decided => fatal!("ballot bump for decided instance {:?}: {:?}", instance, decided),
        }
    }

    /// Record a decision. Returns false when the instance was already
    /// decided (a replayed commit); a conflicting decision aborts.
    pub fn set_committed(&mut self, instance: Instance, triple: CommandTriple) -> bool {
        if let Some(stored) = self.cmd_log.get(&instance) {
            if stored.is_decided() {
                let decided = stored.triple().expect("decided entries carry a triple");
                if *decided != triple {
                    fatal!(
                        "conflicting decisions for {:?}: {:?} vs {:?}",
                        instance,
                        decided,
                        triple
                    );
                }
                return false;
            }
        }
        self.cmd_log
            .insert(instance, CmdLogEntry::Committed { triple });
        true
    }

    pub fn mark_executed(&mut self, instance: Instance) {
        match self.cmd_log.remove(&instance) {
            Some(CmdLogEntry::Committed { triple }) => {
                self.cmd_log
                    .insert(instance, CmdLogEntry::Executed { triple });
            }
            other => fatal!("executing {:?} in state {:?}", instance, other),
        }
    }

    pub fn client_lookup(&self, client: &ClientAddr, pseudonym: i32) -> Option<&(i32, Bytes)> {
        self.client_table.get(&(client.clone(), pseudonym))
    }

    pub fn client_update(
        &mut self,
        client: &ClientAddr,
        pseudonym: i32,
        client_id: i32,
        result: Bytes,
    ) {
        self.client_table
            .insert((client.clone(), pseudonym), (client_id, result));
    }
}

impl Default for State {
    fn default() -> Self {
        State::new()
    }
}
