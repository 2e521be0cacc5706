//! Shared helpers for integration tests: a deterministic in-memory cluster.
//!
//! Replicas exchange messages through a single FIFO queue that the test
//! drains one message at a time, so every scenario is reproducible. Crashed
//! replicas drop their traffic at delivery time, which models messages lost
//! in flight.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use keel_epaxos::epaxos::{
    ClientAddr, ClientReply, ClientRequest, Config, Instance, Message, Replica, ReplicaIndex,
    StateMachine, Transport,
};

pub struct Envelope {
    pub from: ReplicaIndex,
    pub to: ReplicaIndex,
    pub msg: Message,
}

#[derive(Default)]
pub struct NetState {
    pub queue: VecDeque<Envelope>,
    pub replies: Vec<(ClientAddr, ClientReply)>,
}

struct QueueTransport {
    from: ReplicaIndex,
    net: Arc<Mutex<NetState>>,
}

impl Transport for QueueTransport {
    fn send(&self, to: ReplicaIndex, msg: Message) {
        self.net.lock().unwrap().queue.push_back(Envelope {
            from: self.from,
            to,
            msg,
        });
    }

    fn reply(&self, to: &ClientAddr, reply: ClientReply) {
        self.net.lock().unwrap().replies.push((to.clone(), reply));
    }
}

/// Applies commands by appending the payload to a shared log; conflicts on
/// the payload prefix before `=`.
struct LogSm {
    log: Arc<Mutex<Vec<Bytes>>>,
}

impl StateMachine for LogSm {
    fn conflict_keys(&self, payload: &Bytes) -> Vec<Bytes> {
        match payload.iter().position(|b| *b == b'=') {
            Some(split) => vec![payload.slice(..split)],
            None => vec![payload.clone()],
        }
    }

    fn apply(&mut self, payload: &Bytes) -> Bytes {
        self.log.lock().unwrap().push(payload.clone());
        payload.clone()
    }
}

pub struct Cluster {
    pub replicas: Vec<Replica>,
    pub logs: Vec<Arc<Mutex<Vec<Bytes>>>>,
    net: Arc<Mutex<NetState>>,
    down: Vec<bool>,
}

impl Cluster {
    pub fn new(n: usize) -> Cluster {
        let net = Arc::new(Mutex::new(NetState::default()));
        let config = Config::new((0..n).map(|i| format!("127.0.0.1:{}", 9000 + i)).collect());
        let mut replicas = Vec::with_capacity(n);
        let mut logs = Vec::with_capacity(n);
        for index in 0..n as ReplicaIndex {
            let log = Arc::new(Mutex::new(Vec::new()));
            let transport = Arc::new(QueueTransport {
                from: index,
                net: Arc::clone(&net),
            });
            let sm = Box::new(LogSm {
                log: Arc::clone(&log),
            });
            let replica =
                Replica::new(config.clone(), index, transport, sm).expect("valid cluster config");
            replicas.push(replica);
            logs.push(log);
        }
        Cluster {
            replicas,
            logs,
            net,
            down: vec![false; n],
        }
    }

    pub fn request(&mut self, at: usize, client: &str, pseudonym: i32, client_id: i32, payload: &str) {
        self.replicas[at].handle_request(ClientRequest {
            client: addr(client),
            pseudonym,
            client_id,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        });
    }

    pub fn recover(&mut self, at: usize, instance: Instance) {
        self.replicas[at].recover(instance);
    }

    pub fn crash(&mut self, at: usize) {
        self.down[at] = true;
    }

    /// Deliver the oldest queued message. Traffic to or from a crashed
    /// replica is dropped. Returns false once the queue is empty.
    pub fn step(&mut self) -> bool {
        let envelope = match self.net.lock().unwrap().queue.pop_front() {
            Some(envelope) => envelope,
            None => return false,
        };
        if self.down[envelope.from as usize] || self.down[envelope.to as usize] {
            return true;
        }
        self.replicas[envelope.to as usize].receive(envelope.from, envelope.msg);
        true
    }

    /// Deliver the oldest queued message matching `pred`, keeping the rest
    /// in order. Returns false when none matches.
    pub fn deliver_matching(&mut self, pred: &dyn Fn(&Envelope) -> bool) -> bool {
        let envelope = {
            let mut net = self.net.lock().unwrap();
            let Some(position) = net.queue.iter().position(|e| pred(e)) else {
                return false;
            };
            net.queue.remove(position).expect("position is in range")
        };
        if self.down[envelope.from as usize] || self.down[envelope.to as usize] {
            return true;
        }
        self.replicas[envelope.to as usize].receive(envelope.from, envelope.msg);
        true
    }

    /// Run until no messages remain in flight.
    pub fn settle(&mut self) {
        let mut steps = 0usize;
        while self.step() {
            steps += 1;
            assert!(steps < 100_000, "cluster did not quiesce");
        }
    }

    pub fn drain_replies(&mut self) -> Vec<(ClientAddr, ClientReply)> {
        std::mem::take(&mut self.net.lock().unwrap().replies)
    }

    pub fn log_of(&self, at: usize) -> Vec<Bytes> {
        self.logs[at].lock().unwrap().clone()
    }

    /// Indexes of replicas that are still up.
    pub fn alive(&self) -> Vec<usize> {
        (0..self.replicas.len())
            .filter(|i| !self.down[*i])
            .collect()
    }
}

pub fn addr(name: &str) -> ClientAddr {
    ClientAddr(Bytes::copy_from_slice(name.as_bytes()))
}

pub fn inst(leader: ReplicaIndex, number: i32) -> Instance {
    Instance { leader, number }
}

pub fn payloads(raw: &[&str]) -> Vec<Bytes> {
    raw.iter()
        .map(|s| Bytes::copy_from_slice(s.as_bytes()))
        .collect()
}
