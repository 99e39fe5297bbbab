use ethereum_types::{H256, H512};
use ragno_common::types::{
    DiscoveredRecord, Endpoint, Node, NodeRecord, mainnet_fork_id, node_id,
    public_key_from_secret_key,
};
use secp256k1::SecretKey;
use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, sync::Mutex, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::utils::{
    get_msg_expiration_from_seconds, is_msg_expired, time_now_unix, unmap_ipv4in6_address,
};

use super::messages::{
    ENRRequestMessage, ENRResponseMessage, FindNodeMessage, Message, NeighborsMessage, Packet,
    PingMessage, PongMessage,
};

pub const MAX_DISC_PACKET_SIZE: usize = 1280;

/// Endpoint proofs are valid this long before we re-ping.
const PROOF_EXPIRATION_IN_HS: u64 = 12;
/// Expiration attached to every outgoing message.
const MSG_EXPIRATION_SECONDS: u64 = 20;
/// How often a random-walk lookup round runs.
const LOOKUP_INTERVAL: Duration = Duration::from_secs(10);
/// How many proven contacts each lookup round queries.
const LOOKUP_ALPHA: usize = 16;
/// Flat contact table cap; new contacts are dropped once reached.
const MAX_CONTACTS: usize = 8192;
/// Neighbors are sent in chunks so packets stay under the size cap.
const NEIGHBORS_PER_PACKET: usize = 4;
const MAX_NEIGHBORS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to bind discovery socket: {0}")]
    BindSocket(std::io::Error),
    #[error("Failed to send message: {0}")]
    MessageSendFailure(std::io::Error),
    #[error("Only partial message was sent")]
    PartialMessageSent,
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Message expired")]
    MessageExpired,
}

/// Endpoint-proof state for a node we have exchanged packets with.
#[derive(Debug, Clone)]
struct Contact {
    node: Node,
    last_ping_hash: Option<H256>,
    last_ping: u64,
    proven: bool,
    enr_seq: u64,
    enr_request_hash: Option<H256>,
}

impl Contact {
    fn new(node: Node) -> Self {
        Self {
            node,
            last_ping_hash: None,
            last_ping: 0,
            proven: false,
            enr_seq: 0,
            enr_request_hash: None,
        }
    }
}

/// Kademlia-v4 discovery service. Emits every complete node observation on
/// the record channel; the peering side decides what to do with them.
#[derive(Clone)]
pub struct Discv4Server {
    local_node: Node,
    local_record: NodeRecord,
    signer: SecretKey,
    udp_socket: Arc<UdpSocket>,
    contacts: Arc<Mutex<HashMap<H256, Contact>>>,
    record_tx: mpsc::Sender<DiscoveredRecord>,
    token: CancellationToken,
}

impl Discv4Server {
    /// Binds the UDP socket. Bind errors are fatal to the caller.
    /// `local_ip` is the address advertised in outgoing endpoints; the
    /// socket itself always binds the unspecified address.
    pub async fn try_new(
        local_ip: IpAddr,
        udp_port: u16,
        signer: SecretKey,
        record_tx: mpsc::Sender<DiscoveredRecord>,
        token: CancellationToken,
    ) -> Result<Self, DiscoveryError> {
        let udp_socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            udp_port,
        ))
        .await
        .map_err(DiscoveryError::BindSocket)?;

        let local_node = Node::new(
            local_ip,
            udp_port,
            udp_port,
            public_key_from_secret_key(&signer),
        );
        let local_record =
            NodeRecord::from_node(&local_node, time_now_unix(), &signer, Some(mainnet_fork_id(0, 0)))
                .map_err(|e| DiscoveryError::InvalidMessage(e.to_string()))?;

        Ok(Self {
            local_node,
            local_record,
            signer,
            udp_socket: Arc::new(udp_socket),
            contacts: Arc::new(Mutex::new(HashMap::new())),
            record_tx,
            token,
        })
    }

    /// Spawns the receive loop and the lookup walker, then pings the
    /// bootnodes to seed the table.
    pub async fn start(&self, bootnodes: Vec<Node>, tracker: &TaskTracker) {
        info!(port = self.local_node.udp_port, "starting discv4 service");

        tracker.spawn({
            let server = self.clone();
            async move { server.receive_loop().await }
        });
        tracker.spawn({
            let server = self.clone();
            async move { server.lookup_loop().await }
        });

        info!(count = bootnodes.len(), "pinging bootnodes");
        for bootnode in bootnodes {
            if let Err(e) = self.try_add_contact_and_ping(bootnode).await {
                warn!(err = %e, "failed to ping bootnode");
            }
        }
    }

    async fn receive_loop(self) {
        let mut buf = vec![0; MAX_DISC_PACKET_SIZE];
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("discovery receive loop shutting down");
                    return;
                }
                recv = self.udp_socket.recv_from(&mut buf) => {
                    let (read, from) = match recv {
                        Ok(result) => result,
                        Err(e) => {
                            error!(err = %e, "error receiving discovery packet");
                            continue;
                        }
                    };
                    let packet = match Packet::decode(&buf[..read]) {
                        Ok(packet) => packet,
                        Err(e) => {
                            trace!(err = %e, "could not decode discovery packet");
                            continue;
                        }
                    };
                    if packet.get_node_id() == self.local_node.node_id() {
                        // our own packets bounced back
                        continue;
                    }
                    if let Err(e) = self.handle_message(packet, from).await {
                        trace!(err = %e, "error handling discovery message");
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        packet: Packet,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        match packet.get_message() {
            Message::Ping(msg) => {
                if is_msg_expired(msg.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                let sender_ip = unmap_ipv4in6_address(from.ip());
                let node = Node::new(
                    sender_ip,
                    from.port(),
                    msg.from.tcp_port,
                    packet.get_public_key(),
                );
                self.pong(packet.get_hash(), &node).await?;

                let known = {
                    let contacts = self.contacts.lock().await;
                    contacts.get(&node.node_id()).cloned()
                };
                match known {
                    Some(contact) => {
                        // re-ping when the endpoint proof aged out
                        let proof_age_hs =
                            time_now_unix().saturating_sub(contact.last_ping) / 3600;
                        if proof_age_hs >= PROOF_EXPIRATION_IN_HS {
                            self.ping(&contact.node).await?;
                        }
                        if let Some(enr_seq) = msg.enr_seq {
                            if enr_seq > contact.enr_seq {
                                self.send_enr_request(&contact.node).await?;
                            }
                        }
                    }
                    None => {
                        self.try_add_contact_and_ping(node).await?;
                    }
                }
                Ok(())
            }
            Message::Pong(msg) => {
                let mut contacts = self.contacts.lock().await;
                let Some(contact) = contacts.get_mut(&packet.get_node_id()) else {
                    return Err(DiscoveryError::InvalidMessage(
                        "pong from an unknown node".into(),
                    ));
                };
                if contact.last_ping_hash != Some(msg.ping_hash) {
                    return Err(DiscoveryError::InvalidMessage(
                        "pong hash does not match the last ping".into(),
                    ));
                }
                contact.last_ping_hash = None;
                contact.proven = true;
                let node = contact.node.clone();
                let enr_outdated = msg.enr_seq.is_some_and(|seq| seq > contact.enr_seq);
                drop(contacts);

                if enr_outdated {
                    self.send_enr_request(&node).await?;
                }
                Ok(())
            }
            Message::FindNode(msg) => {
                if is_msg_expired(msg.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                let (requester, closest) = {
                    let contacts = self.contacts.lock().await;
                    let Some(contact) = contacts.get(&packet.get_node_id()) else {
                        return Err(DiscoveryError::InvalidMessage(
                            "find_node from an unknown node".into(),
                        ));
                    };
                    if !contact.proven {
                        return Err(DiscoveryError::InvalidMessage(
                            "find_node from an unproven node".into(),
                        ));
                    }
                    // answering to a spoofed source address would turn the
                    // crawler into a traffic amplifier
                    if from.ip() != contact.node.ip {
                        return Err(DiscoveryError::InvalidMessage(
                            "find_node source ip mismatch".into(),
                        ));
                    }
                    (
                        contact.node.clone(),
                        closest_nodes(&contacts, node_id(&msg.target)),
                    )
                };
                self.send_neighbors(closest, &requester).await
            }
            Message::Neighbors(msg) => {
                if is_msg_expired(msg.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                {
                    let contacts = self.contacts.lock().await;
                    if !contacts.contains_key(&packet.get_node_id()) {
                        return Err(DiscoveryError::InvalidMessage(
                            "neighbors from an unknown node".into(),
                        ));
                    }
                }
                for node in &msg.nodes {
                    let record = DiscoveredRecord::from_node(node.clone(), 0, None);
                    if !record.is_complete() {
                        // silently drop undialable records
                        continue;
                    }
                    self.emit(record).await;
                    let _ = self.try_add_contact_and_ping(node.clone()).await;
                }
                Ok(())
            }
            Message::ENRRequest(msg) => {
                if is_msg_expired(msg.expiration) {
                    return Err(DiscoveryError::MessageExpired);
                }
                let response = Message::ENRResponse(ENRResponseMessage::new(
                    packet.get_hash(),
                    self.local_record.clone(),
                ));
                let mut buf = Vec::new();
                response.encode_with_header(&mut buf, &self.signer);
                self.send_to(&buf, from).await
            }
            Message::ENRResponse(msg) => {
                let updated = {
                    let mut contacts = self.contacts.lock().await;
                    let Some(contact) = contacts.get_mut(&packet.get_node_id()) else {
                        return Err(DiscoveryError::InvalidMessage(
                            "enr_response from an unknown node".into(),
                        ));
                    };
                    let Some(request_hash) = contact.enr_request_hash else {
                        return Err(DiscoveryError::InvalidMessage(
                            "enr_response without a pending enr_request".into(),
                        ));
                    };
                    if request_hash != msg.request_hash {
                        return Err(DiscoveryError::InvalidMessage(
                            "enr_response hash does not match the request".into(),
                        ));
                    }
                    contact.enr_request_hash = None;
                    if msg.node_record.seq < contact.enr_seq {
                        return Err(DiscoveryError::InvalidMessage(
                            "enr_response with an outdated seq".into(),
                        ));
                    }
                    if !msg.node_record.verify_signature() {
                        return Err(DiscoveryError::InvalidMessage(
                            "enr_response with an invalid signature".into(),
                        ));
                    }
                    contact.enr_seq = msg.node_record.seq;

                    // refresh the transport coordinates from the record
                    let pairs = msg.node_record.pairs();
                    if let Some(ip) = pairs.ip {
                        contact.node.ip = IpAddr::from(ip);
                    }
                    if let Some(tcp_port) = pairs.tcp_port {
                        contact.node.tcp_port = tcp_port;
                    }
                    if let Some(udp_port) = pairs.udp_port {
                        contact.node.udp_port = udp_port;
                    }
                    DiscoveredRecord::from_node(
                        Node::new(
                            contact.node.ip,
                            contact.node.udp_port,
                            contact.node.tcp_port,
                            contact.node.public_key,
                        ),
                        msg.node_record.seq,
                        msg.node_record.enr_url().ok(),
                    )
                };
                if updated.is_complete() {
                    self.emit(updated).await;
                }
                Ok(())
            }
        }
    }

    /// The random walk: every interval, ask a sample of proven contacts for
    /// the neighbourhood of a random target.
    async fn lookup_loop(self) {
        let mut interval = tokio::time::interval(LOOKUP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("discovery lookup loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.lookup_round().await {
                        debug!(err = %e, "lookup round failed");
                    }
                }
            }
        }
    }

    async fn lookup_round(&self) -> Result<(), DiscoveryError> {
        let random_target = public_key_from_secret_key(&SecretKey::new(&mut rand::rngs::OsRng));
        let asked: Vec<Node> = {
            let contacts = self.contacts.lock().await;
            contacts
                .values()
                .filter(|contact| contact.proven)
                .take(LOOKUP_ALPHA)
                .map(|contact| contact.node.clone())
                .collect()
        };
        trace!(peers = asked.len(), "running discovery lookup round");
        for node in asked {
            self.find_node(&node, random_target).await?;
        }
        Ok(())
    }

    async fn try_add_contact_and_ping(&self, node: Node) -> Result<(), DiscoveryError> {
        let mut contacts = self.contacts.lock().await;
        if contacts.contains_key(&node.node_id()) {
            return Ok(());
        }
        if contacts.len() >= MAX_CONTACTS {
            trace!("contact table full, dropping candidate");
            return Ok(());
        }
        let contact = contacts
            .entry(node.node_id())
            .or_insert_with(|| Contact::new(node.clone()));
        contact.last_ping = time_now_unix();
        drop(contacts);

        let hash = self.ping(&node).await?;
        let mut contacts = self.contacts.lock().await;
        if let Some(contact) = contacts.get_mut(&node.node_id()) {
            contact.last_ping_hash = Some(hash);
        }
        Ok(())
    }

    async fn ping(&self, node: &Node) -> Result<H256, DiscoveryError> {
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECONDS);
        let from = Endpoint {
            ip: self.local_node.ip,
            udp_port: self.local_node.udp_port,
            tcp_port: self.local_node.tcp_port,
        };
        let to = Endpoint {
            ip: node.ip,
            udp_port: node.udp_port,
            tcp_port: node.tcp_port,
        };
        let ping = Message::Ping(
            PingMessage::new(from, to, expiration).with_enr_seq(self.local_record.seq),
        );
        let mut buf = Vec::new();
        ping.encode_with_header(&mut buf, &self.signer);
        self.send_to(&buf, node.udp_addr()).await?;
        trace!(to = %node, sent = "Ping");
        Ok(H256::from_slice(&buf[..32]))
    }

    async fn pong(&self, ping_hash: H256, node: &Node) -> Result<(), DiscoveryError> {
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECONDS);
        let to = Endpoint {
            ip: node.ip,
            udp_port: node.udp_port,
            tcp_port: node.tcp_port,
        };
        let pong = Message::Pong(
            PongMessage::new(to, ping_hash, expiration).with_enr_seq(self.local_record.seq),
        );
        let mut buf = Vec::new();
        pong.encode_with_header(&mut buf, &self.signer);
        self.send_to(&buf, node.udp_addr()).await?;
        trace!(to = %node, sent = "Pong");
        Ok(())
    }

    async fn find_node(&self, node: &Node, target: H512) -> Result<(), DiscoveryError> {
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECONDS);
        let msg = Message::FindNode(FindNodeMessage::new(target, expiration));
        let mut buf = Vec::new();
        msg.encode_with_header(&mut buf, &self.signer);
        self.send_to(&buf, node.udp_addr()).await
    }

    async fn send_neighbors(&self, nodes: Vec<Node>, node: &Node) -> Result<(), DiscoveryError> {
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECONDS);
        for chunk in nodes.chunks(NEIGHBORS_PER_PACKET) {
            let msg = Message::Neighbors(NeighborsMessage::new(chunk.to_vec(), expiration));
            let mut buf = Vec::new();
            msg.encode_with_header(&mut buf, &self.signer);
            self.send_to(&buf, node.udp_addr()).await?;
        }
        Ok(())
    }

    async fn send_enr_request(&self, node: &Node) -> Result<(), DiscoveryError> {
        let expiration = get_msg_expiration_from_seconds(MSG_EXPIRATION_SECONDS);
        let msg = Message::ENRRequest(ENRRequestMessage::new(expiration));
        let mut buf = Vec::new();
        msg.encode_with_header(&mut buf, &self.signer);
        self.send_to(&buf, node.udp_addr()).await?;

        let hash = H256::from_slice(&buf[..32]);
        let mut contacts = self.contacts.lock().await;
        if let Some(contact) = contacts.get_mut(&node.node_id()) {
            contact.enr_request_hash = Some(hash);
        }
        Ok(())
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<(), DiscoveryError> {
        let bytes_sent = self
            .udp_socket
            .send_to(buf, addr)
            .await
            .map_err(DiscoveryError::MessageSendFailure)?;
        if bytes_sent != buf.len() {
            return Err(DiscoveryError::PartialMessageSent);
        }
        Ok(())
    }

    /// Pushes a record towards the consumer without ever outliving a
    /// shutdown request.
    async fn emit(&self, record: DiscoveredRecord) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            result = self.record_tx.send(record) => {
                if result.is_err() {
                    debug!("record channel closed, dropping observation");
                }
            }
        }
    }
}

/// The contacts closest to `target` by XOR distance over node ids.
fn closest_nodes(contacts: &HashMap<H256, Contact>, target: H256) -> Vec<Node> {
    let mut proven: Vec<(H256, Node)> = contacts
        .iter()
        .filter(|(_, contact)| contact.proven)
        .map(|(id, contact)| (*id ^ target, contact.node.clone()))
        .collect();
    proven.sort_by(|(a, _), (b, _)| a.cmp(b));
    proven
        .into_iter()
        .take(MAX_NEIGHBORS)
        .map(|(_, node)| node)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id_byte: u8, proven: bool) -> (H256, Contact) {
        let node = Node::new(
            "1.2.3.4".parse().unwrap(),
            30303,
            30303,
            H512::repeat_byte(id_byte),
        );
        let mut contact = Contact::new(node);
        contact.proven = proven;
        (H256::repeat_byte(id_byte), contact)
    }

    #[test]
    fn closest_nodes_orders_by_xor_distance() {
        let mut contacts = HashMap::new();
        for byte in [0x01, 0x02, 0x0f, 0xf0] {
            let (id, c) = contact(byte, true);
            contacts.insert(id, c);
        }
        let closest = closest_nodes(&contacts, H256::repeat_byte(0x01));
        assert_eq!(closest[0].public_key, H512::repeat_byte(0x01));
        assert_eq!(closest.len(), 4);
    }

    #[test]
    fn closest_nodes_skips_unproven() {
        let mut contacts = HashMap::new();
        let (id, c) = contact(0x01, false);
        contacts.insert(id, c);
        let (id, c) = contact(0x02, true);
        contacts.insert(id, c);
        assert_eq!(closest_nodes(&contacts, H256::zero()).len(), 1);
    }

    #[tokio::test]
    async fn emit_drops_records_after_cancellation() {
        let (tx, mut rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let signer = SecretKey::new(&mut rand::rngs::OsRng);
        let local_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let server = Discv4Server::try_new(local_ip, 0, signer, tx, token.clone())
            .await
            .unwrap();

        let node = Node::new("1.2.3.4".parse().unwrap(), 1, 1, H512::repeat_byte(9));
        server
            .emit(DiscoveredRecord::from_node(node.clone(), 0, None))
            .await;
        assert!(rx.recv().await.is_some());

        // fill the channel, then cancel: emit must return promptly
        server
            .emit(DiscoveredRecord::from_node(node.clone(), 0, None))
            .await;
        token.cancel();
        server
            .emit(DiscoveredRecord::from_node(node, 0, None))
            .await;
    }
}
