//! In-memory mixnet for end-to-end tests.
//!
//! [`MixnetSim`] holds relays and providers with real link keys and replay
//! filters. Packets handed to a provider with `SendPacket` are routed
//! synchronously: every hop peels its layer with [`codec::unwrap`], and the
//! terminal provider queues the result in the recipient's mailbox. Hop
//! delays are ignored.
//!
//! Providers acknowledge delivered blocks through the embedded SURB, so the
//! sender's mailbox receives a `SurbReply` for every delivered block.
//!
//! [`Faults`] injects the failures the engine must survive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mixclient_block::Block;
use mixclient_crypto::x25519::X25519StaticSecret;
use mixclient_engine::{Account, EngineConfig};
use mixclient_path::consensus::ConsensusCache;
use mixclient_path::directory::{DirectoryEntry, UserDirectory};
use mixclient_replay::{ReplayConfig, ReplayFilter};
use mixclient_transport::codec::{self, ForwardPayload};
use mixclient_transport::session::{Session, Transport};
use mixclient_transport::sphinx::{SphinxPacket, Unwrapped};
use mixclient_transport::wire::{self, ProviderCommand, ProviderReply};
use mixclient_transport::{Result, TransportError};
use mixclient_types::{
    AccountId, ConsensusSnapshot, MessageId, NodeDescriptor, NodeFlags, NodeId, SurbId,
};
use parking_lot::Mutex;
use tracing::debug;

/// Replay filter sizing for simulated nodes and test engines.
pub const SIM_REPLAY: ReplayConfig = ReplayConfig {
    m_ln2: 16,
    false_positive_rate: 1e-6,
};

/// Engine configuration tuned for tests: short delays, fast retries, and a
/// fetch interval long enough that tests drive fetching with `poll_once`.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        hops: 2,
        lambda: 1.0,
        max_delay_ms: 5,
        fetch_interval: Duration::from_secs(3600),
        max_send_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        send_timeout: Duration::from_secs(5),
        queue_capacity: 64,
        replay: SIM_REPLAY,
        ..EngineConfig::default()
    }
}

/// A simulated mix node or provider.
pub struct SimNode {
    pub descriptor: NodeDescriptor,
    secret: X25519StaticSecret,
    replay: ReplayFilter,
}

/// Failure injection switches.
#[derive(Clone, Debug, Default)]
pub struct Faults {
    /// Refuse new connections.
    pub refuse_connect: bool,
    /// Answer this many upcoming `SendPacket` commands with an error.
    pub reject_sends: u32,
    /// Route this many upcoming `SendPacket` commands but never answer
    /// them, as if the reply were lost on a dead link.
    pub stall_sends: u32,
    /// Queue every delivered block twice.
    pub duplicate_deliveries: bool,
    /// Do not send SURB acknowledgements.
    pub drop_acks: bool,
}

/// A forward block as seen by the terminal provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub recipient: AccountId,
    pub message_id: MessageId,
    pub sequence: u32,
}

#[derive(Clone, Debug)]
enum MailItem {
    Message(Vec<u8>),
    SurbReply { surb_id: SurbId, payload: Vec<u8> },
}

#[derive(Default)]
struct Mailbox {
    next_sequence: u32,
    items: VecDeque<(u32, MailItem)>,
}

impl Mailbox {
    fn push(&mut self, item: MailItem) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.items.push_back((sequence, item));
    }
}

#[derive(Default)]
struct Counters {
    connects: usize,
    packets_accepted: usize,
    dropped: usize,
    acks_sent: usize,
}

struct SimState {
    epoch: u64,
    nodes: HashMap<NodeId, SimNode>,
    mailboxes: Mutex<HashMap<AccountId, Mailbox>>,
    deliveries: Mutex<Vec<Delivery>>,
    faults: Mutex<Faults>,
    counters: Mutex<Counters>,
}

/// The simulated network. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MixnetSim {
    state: Arc<SimState>,
}

impl MixnetSim {
    /// A network with `relays` mix nodes (`relay-1`..) and the named
    /// providers.
    pub fn new(relays: usize, providers: &[&str]) -> Self {
        let mut nodes = HashMap::new();
        let names = (1..=relays)
            .map(|i| (format!("relay-{i}"), false))
            .chain(providers.iter().map(|p| ((*p).to_string(), true)));
        for (name, is_provider) in names {
            let node = sim_node(&name, is_provider);
            nodes.insert(node.descriptor.node_id(), node);
        }
        Self {
            state: Arc::new(SimState {
                epoch: 1,
                nodes,
                mailboxes: Mutex::new(HashMap::new()),
                deliveries: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                counters: Mutex::new(Counters::default()),
            }),
        }
    }

    /// Verified consensus for the simulated nodes, sorted by name.
    pub fn snapshot(&self) -> ConsensusSnapshot {
        let mut nodes: Vec<NodeDescriptor> = self
            .state
            .nodes
            .values()
            .map(|n| n.descriptor.clone())
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        ConsensusSnapshot {
            epoch: self.state.epoch,
            nodes,
            signature_valid: true,
        }
    }

    pub fn consensus(&self) -> Arc<ConsensusCache> {
        match ConsensusCache::from_snapshot(self.snapshot()) {
            Ok(cache) => Arc::new(cache),
            Err(e) => unreachable!("simulated consensus rejected: {e}"),
        }
    }

    /// A [`Transport`] connecting to this network's providers.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(SimTransport {
            state: Arc::clone(&self.state),
        })
    }

    /// Node by name.
    pub fn node(&self, name: &str) -> Option<&SimNode> {
        self.state.nodes.values().find(|n| n.descriptor.name == name)
    }

    /// Link secret of a node, for tests that unwrap packets by hand.
    pub fn link_secret(&self, id: &NodeId) -> Option<&X25519StaticSecret> {
        self.state.nodes.get(id).map(|n| &n.secret)
    }

    pub fn set_faults(&self, faults: Faults) {
        *self.state.faults.lock() = faults;
    }

    /// Queue raw bytes as a forward message for `account`.
    pub fn enqueue_message(&self, account: &AccountId, payload: Vec<u8>) {
        self.state
            .mailboxes
            .lock()
            .entry(*account)
            .or_default()
            .push(MailItem::Message(payload));
    }

    /// Items waiting in `account`'s mailbox.
    pub fn mailbox_len(&self, account: &AccountId) -> usize {
        self.state
            .mailboxes
            .lock()
            .get(account)
            .map_or(0, |m| m.items.len())
    }

    /// Forward blocks in the order providers received them.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.deliveries.lock().clone()
    }

    pub fn connects(&self) -> usize {
        self.state.counters.lock().connects
    }

    pub fn packets_accepted(&self) -> usize {
        self.state.counters.lock().packets_accepted
    }

    /// Packets dropped by a node (bad MAC, replay, unknown hop).
    pub fn dropped(&self) -> usize {
        self.state.counters.lock().dropped
    }

    pub fn acks_sent(&self) -> usize {
        self.state.counters.lock().acks_sent
    }

    /// Inject a packet at `first_hop` as a provider would.
    pub fn inject(&self, first_hop: NodeId, packet: &[u8]) {
        self.state.route(first_hop, packet);
    }
}

impl SimState {
    fn route(&self, first_hop: NodeId, packet: &[u8]) {
        let mut packet = match SphinxPacket::from_bytes(packet) {
            Ok(packet) => packet,
            Err(e) => return self.drop_packet(&e),
        };
        let mut hop = first_hop;
        loop {
            let Some(node) = self.nodes.get(&hop) else {
                return self.drop_packet(&TransportError::InvalidPath(format!(
                    "unknown hop {hop}"
                )));
            };
            match codec::unwrap(&packet, &node.secret, &node.replay) {
                Ok(Unwrapped::Forward {
                    next_hop,
                    packet: next,
                    ..
                }) => {
                    hop = next_hop;
                    packet = next;
                }
                Ok(Unwrapped::Deliver {
                    recipient, payload, ..
                }) => return self.deliver(recipient, &payload),
                Ok(Unwrapped::SurbReply {
                    recipient,
                    surb_id,
                    payload,
                    ..
                }) => {
                    self.mailboxes
                        .lock()
                        .entry(recipient)
                        .or_default()
                        .push(MailItem::SurbReply { surb_id, payload });
                    return;
                }
                Err(e) => return self.drop_packet(&e),
            }
        }
    }

    fn deliver(&self, recipient: AccountId, payload: &[u8]) {
        let forward = match ForwardPayload::decode(payload) {
            Ok(forward) => forward,
            Err(e) => return self.drop_packet(&e),
        };
        if let Ok(block) = Block::from_bytes(&forward.body) {
            self.deliveries.lock().push(Delivery {
                recipient,
                message_id: block.message_id,
                sequence: block.sequence,
            });
        }

        let faults = self.faults.lock().clone();
        {
            let mut mailboxes = self.mailboxes.lock();
            let mailbox = mailboxes.entry(recipient).or_default();
            mailbox.push(MailItem::Message(forward.body.clone()));
            if faults.duplicate_deliveries {
                mailbox.push(MailItem::Message(forward.body.clone()));
            }
        }

        if faults.drop_acks {
            return;
        }
        if let Some(surb) = forward.surb {
            match surb.reply(&[]) {
                Ok(reply) => {
                    self.counters.lock().acks_sent += 1;
                    self.route(surb.first_hop, reply.as_bytes());
                }
                Err(e) => self.drop_packet(&e),
            }
        }
    }

    fn drop_packet(&self, reason: &TransportError) {
        debug!(%reason, "simulated node dropped packet");
        self.counters.lock().dropped += 1;
    }

    fn take_stall(&self) -> bool {
        let mut faults = self.faults.lock();
        if faults.stall_sends == 0 {
            return false;
        }
        faults.stall_sends -= 1;
        true
    }

    fn handle(&self, account: &mut Option<AccountId>, command: ProviderCommand) -> ProviderReply {
        if let ProviderCommand::Authenticate { account: id, .. } = command {
            *account = Some(id);
            return ProviderReply::Ok;
        }
        let Some(account) = *account else {
            return ProviderReply::Error {
                reason: "not authenticated".to_string(),
            };
        };

        match command {
            ProviderCommand::Authenticate { .. } => ProviderReply::Ok,
            ProviderCommand::SendPacket { first_hop, packet } => {
                {
                    let mut faults = self.faults.lock();
                    if faults.reject_sends > 0 {
                        faults.reject_sends -= 1;
                        return ProviderReply::Error {
                            reason: "provider overloaded".to_string(),
                        };
                    }
                }
                self.counters.lock().packets_accepted += 1;
                self.route(first_hop, &packet);
                ProviderReply::Ok
            }
            ProviderCommand::RetrieveMessage { sequence } => {
                let mailboxes = self.mailboxes.lock();
                let Some(mailbox) = mailboxes.get(&account) else {
                    return ProviderReply::Empty { sequence };
                };
                let Some((head, item)) = mailbox.items.front() else {
                    return ProviderReply::Empty { sequence };
                };
                let queue_hint = u32::try_from(mailbox.items.len() - 1).unwrap_or(u32::MAX);
                match item.clone() {
                    MailItem::Message(payload) => ProviderReply::Message {
                        sequence: *head,
                        payload,
                        queue_hint,
                    },
                    MailItem::SurbReply { surb_id, payload } => ProviderReply::SurbReply {
                        sequence: *head,
                        surb_id,
                        payload,
                        queue_hint,
                    },
                }
            }
            ProviderCommand::Acknowledge { sequence } => {
                let mut mailboxes = self.mailboxes.lock();
                if let Some(mailbox) = mailboxes.get_mut(&account) {
                    if mailbox.items.front().is_some_and(|(head, _)| *head == sequence) {
                        mailbox.items.pop_front();
                    }
                }
                ProviderReply::Ok
            }
        }
    }
}

fn sim_node(name: &str, is_provider: bool) -> SimNode {
    let secret = X25519StaticSecret::random();
    let identity = X25519StaticSecret::random().public_key().to_bytes();
    let replay = match ReplayFilter::new(SIM_REPLAY, 1) {
        Ok(replay) => replay,
        Err(e) => unreachable!("replay filter sizing: {e}"),
    };
    SimNode {
        descriptor: NodeDescriptor {
            name: name.to_string(),
            identity_key: identity,
            link_key: secret.public_key().to_bytes(),
            address: format!("sim://{name}"),
            flags: NodeFlags {
                is_provider,
                supports_surb: true,
            },
        },
        secret,
        replay,
    }
}

struct SimTransport {
    state: Arc<SimState>,
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, node: &NodeDescriptor) -> Result<Box<dyn Session>> {
        if self.state.faults.lock().refuse_connect {
            return Err(TransportError::Connection(format!("{} refused", node.name)));
        }
        if !node.is_provider() || !self.state.nodes.contains_key(&node.node_id()) {
            return Err(TransportError::Connection(format!("{} is not a provider", node.name)));
        }
        self.state.counters.lock().connects += 1;
        Ok(Box::new(SimSession {
            state: Arc::clone(&self.state),
            account: None,
            replies: VecDeque::new(),
            stalled: false,
            closed: false,
        }))
    }
}

struct SimSession {
    state: Arc<SimState>,
    account: Option<AccountId>,
    replies: VecDeque<Vec<u8>>,
    stalled: bool,
    closed: bool,
}

#[async_trait]
impl Session for SimSession {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let command = wire::decode_command(data)?;
        let stall = matches!(command, ProviderCommand::SendPacket { .. }) && self.state.take_stall();
        let reply = self.state.handle(&mut self.account, command);
        if stall {
            debug!("send reply withheld");
            self.stalled = true;
        } else {
            self.replies.push_back(wire::encode_reply(&reply)?);
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.stalled {
            return std::future::pending().await;
        }
        self.replies.pop_front().ok_or(TransportError::Closed)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// A test user: engine account plus directory entry.
pub struct User {
    pub account: Account,
}

impl User {
    pub fn new(name: &str, provider: &str) -> Self {
        Self {
            account: Account::new(name, provider, X25519StaticSecret::random()),
        }
    }

    pub fn id(&self) -> AccountId {
        self.account.id
    }

    pub fn address(&self) -> String {
        self.account.address()
    }
}

/// Directory listing every user.
pub fn directory(users: &[&User]) -> Arc<UserDirectory> {
    let mut directory = UserDirectory::new();
    for user in users {
        directory.insert(
            user.account.name.clone(),
            DirectoryEntry {
                identity_key: user.account.identity.public_key().to_bytes(),
                provider: user.account.provider.clone(),
            },
        );
    }
    Arc::new(directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unauthenticated_commands_rejected() {
        let sim = MixnetSim::new(3, &["provider-1"]);
        let provider = sim.node("provider-1").expect("provider").descriptor.clone();
        let mut session = sim.transport().connect(&provider).await.expect("connect");
        let reply = mixclient_transport::session::request(
            session.as_mut(),
            &ProviderCommand::RetrieveMessage { sequence: 0 },
        )
        .await
        .expect("request");
        assert!(matches!(reply, ProviderReply::Error { .. }));
    }

    #[tokio::test]
    async fn test_relays_refuse_client_sessions() {
        let sim = MixnetSim::new(3, &["provider-1"]);
        let relay = sim.node("relay-1").expect("relay").descriptor.clone();
        assert!(sim.transport().connect(&relay).await.is_err());
    }

    #[tokio::test]
    async fn test_mailbox_retrieve_and_acknowledge() {
        let sim = MixnetSim::new(3, &["provider-1"]);
        let account = AccountId([4; 32]);
        sim.enqueue_message(&account, vec![1]);
        sim.enqueue_message(&account, vec![2]);

        let request = |command| sim.state.handle(&mut Some(account), command);
        let first = request(ProviderCommand::RetrieveMessage { sequence: 0 });
        assert_eq!(
            first,
            ProviderReply::Message {
                sequence: 0,
                payload: vec![1],
                queue_hint: 1
            }
        );
        // Without an acknowledgement the head is delivered again.
        assert_eq!(request(ProviderCommand::RetrieveMessage { sequence: 0 }), first);
        request(ProviderCommand::Acknowledge { sequence: 0 });
        assert!(matches!(
            request(ProviderCommand::RetrieveMessage { sequence: 1 }),
            ProviderReply::Message { sequence: 1, queue_hint: 0, .. }
        ));
        request(ProviderCommand::Acknowledge { sequence: 1 });
        assert_eq!(sim.mailbox_len(&account), 0);
    }
}
