//! The server endpoint: slot table, token handshake, command dispatch, and
//! per-client replication sends.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::channel::{MessageChannels, group_entries};
use crate::command::{CommandDictionary, CommandQueue, CommandRegistry, NetRole};
use crate::endpoint::{Call, NetError, SerializationContext};
use crate::protocol::{
    ClientData, ClientId, KEY_BYTES, MAX_PLAYERS, Message, ObjectId, Packet, PacketHeader,
    PacketType, Reliability,
};
use crate::token::{TokenError, unix_now, verify_connect_token};
use crate::transport::{LoopbackPipe, PacketLossSimulation, PacketTracking, UdpEndpoint};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    pub timeout: Duration,
    pub keepalive: Duration,
    pub loss_sim: PacketLossSimulation,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: MAX_PLAYERS,
            timeout: Duration::from_secs(10),
            keepalive: Duration::from_millis(250),
            loss_sim: PacketLossSimulation::default(),
        }
    }
}

/// Lifecycle callbacks, owned by the caller and passed into `tick`.
#[derive(Default)]
pub struct ServerEvents {
    pub on_client_connected: Option<Box<dyn FnMut(ClientId)>>,
    pub on_client_disconnected: Option<Box<dyn FnMut(ClientId)>>,
}

impl ServerEvents {
    fn connected(&mut self, id: ClientId) {
        if let Some(callback) = &mut self.on_client_connected {
            callback(id);
        }
    }

    fn disconnected(&mut self, id: ClientId) {
        if let Some(callback) = &mut self.on_client_disconnected {
            callback(id);
        }
    }
}

enum Link {
    Udp(SocketAddr),
    Loopback(LoopbackPipe),
}

struct Connection {
    link: Link,
    tracking: PacketTracking,
    channels: MessageChannels,
    queue: CommandQueue,
    ctx: SerializationContext,
    client_id: ClientId,
    user_id: u64,
    ack_debt: bool,
    last_send: f64,
}

impl Connection {
    fn new(link: Link, client_id: ClientId, user_id: u64, dict: Rc<CommandDictionary>) -> Self {
        Self {
            link,
            tracking: PacketTracking::new(),
            channels: MessageChannels::new(),
            queue: CommandQueue::new(),
            ctx: SerializationContext::new(dict),
            client_id,
            user_id,
            ack_debt: false,
            last_send: 0.0,
        }
    }
}

fn manifest_message(dictionary: &CommandDictionary) -> Message {
    let mphf = dictionary.mphf();
    Message::SendManifest {
        seeds: mphf.seeds,
        hash_len: mphf.data.hash_len,
        mask: mphf.data.mask,
        assignment: mphf.data.assignment.clone(),
        rank: mphf.data.rank.clone(),
    }
}

fn send_link(endpoint: &UdpEndpoint, link: &Link, packet: &Packet, sim: &PacketLossSimulation) {
    if sim.should_drop() {
        return;
    }
    let bytes = match packet.serialize() {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("dropping unserializable packet: {}", e);
            return;
        }
    };
    match link {
        Link::Udp(addr) => {
            if let Err(e) = endpoint.send_to(&bytes, *addr) {
                log::warn!("send to {} failed: {}", addr, e);
            }
        }
        Link::Loopback(pipe) => pipe.send(bytes),
    }
}

pub struct Server {
    registry: Rc<RefCell<CommandRegistry>>,
    dictionary: Rc<CommandDictionary>,
    endpoint: UdpEndpoint,
    private_key: Vec<u8>,
    config: ServerConfig,
    slots: Vec<Option<Connection>>,
    generations: Vec<u32>,
    by_addr: HashMap<SocketAddr, u32>,
    start: Instant,
}

impl Server {
    /// Binds the socket and builds the command dictionary. The private key
    /// must be [`KEY_BYTES`] long; setup failures are logged and returned.
    pub fn start<A: ToSocketAddrs>(
        registry: Rc<RefCell<CommandRegistry>>,
        addr: A,
        private_key: &[u8],
        config: ServerConfig,
    ) -> Result<Server, NetError> {
        if private_key.len() != KEY_BYTES {
            log::error!(
                "server start rejected: private key is {} bytes, expected {}",
                private_key.len(),
                KEY_BYTES
            );
            return Err(TokenError::BadKeyLength.into());
        }
        let dictionary = {
            let reg = registry.borrow();
            CommandDictionary::build(&reg).inspect_err(|e| {
                log::error!("command dictionary construction failed: {}", e);
            })?
        };
        let endpoint = UdpEndpoint::bind(addr)?;
        let max_clients = config.max_clients.min(MAX_PLAYERS);
        log::info!(
            "server listening on {} ({} slots)",
            endpoint.local_addr(),
            max_clients
        );
        Ok(Server {
            registry,
            dictionary: Rc::new(dictionary),
            endpoint,
            private_key: private_key.to_vec(),
            config: ServerConfig {
                max_clients,
                ..config
            },
            slots: (0..max_clients).map(|_| None).collect(),
            generations: vec![1; max_clients],
            by_addr: HashMap::new(),
            start: Instant::now(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn dictionary(&self) -> &Rc<CommandDictionary> {
        &self.dictionary
    }

    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// A handle validates only while its generation matches the slot, so
    /// ids from disconnected clients always fail here.
    pub fn is_valid(&self, id: ClientId) -> bool {
        let slot = id.slot() as usize;
        slot < self.slots.len()
            && self.generations[slot] == id.generation()
            && self.slots[slot].is_some()
    }

    pub fn connected_clients(&self) -> Vec<ClientId> {
        self.slots
            .iter()
            .flatten()
            .map(|conn| conn.client_id)
            .collect()
    }

    pub fn client_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn user_id(&self, id: ClientId) -> Option<u64> {
        if !self.is_valid(id) {
            return None;
        }
        self.slots[id.slot() as usize]
            .as_ref()
            .map(|conn| conn.user_id)
    }

    fn allocate(&mut self, link: Link, user_id: u64) -> Result<ClientId, NetError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(NetError::ServerFull)?;
        self.generations[slot] += 1;
        debug_assert_eq!(self.generations[slot] % 2, 0);
        let id = ClientId::new(self.generations[slot], slot as u32);

        let mut conn = Connection::new(link, id, user_id, Rc::clone(&self.dictionary));
        conn.channels
            .send(Reliability::Reliable, manifest_message(&self.dictionary));
        self.slots[slot] = Some(conn);
        Ok(id)
    }

    /// Connects an in-process client. The returned pipe is the client half;
    /// every packet still travels serialized through it.
    pub fn connect_loopback(
        &mut self,
        events: &mut ServerEvents,
        user_id: u64,
    ) -> Result<(ClientId, LoopbackPipe), NetError> {
        let (server_pipe, client_pipe) = LoopbackPipe::pair();
        let id = self.allocate(Link::Loopback(server_pipe), user_id)?;
        log::info!("loopback client {} connected", id);
        events.connected(id);
        Ok((id, client_pipe))
    }

    /// Receives and dispatches everything currently queued.
    pub fn tick(&mut self, events: &mut ServerEvents) {
        let datagrams = match self.endpoint.receive() {
            Ok(datagrams) => datagrams,
            Err(e) => {
                log::warn!("socket receive failed: {}", e);
                Vec::new()
            }
        };
        for (bytes, addr) in datagrams {
            self.handle_datagram(&bytes, addr, events);
        }

        let mut loopback = Vec::new();
        for (slot, conn) in self.slots.iter().enumerate() {
            if let Some(conn) = conn {
                if let Link::Loopback(pipe) = &conn.link {
                    while let Some(bytes) = pipe.try_recv() {
                        loopback.push((slot as u32, bytes));
                    }
                }
            }
        }
        for (slot, bytes) in loopback {
            match Packet::deserialize(&bytes) {
                Ok(packet) if packet.header.is_valid() => {
                    self.handle_packet(slot, packet, events)
                }
                Ok(_) => {}
                Err(e) => log::warn!("dropping malformed loopback packet: {}", e),
            }
        }

        // Networked clients that went silent get their slot back. Loopback
        // links live and die with the process.
        let timed_out: Vec<u32> = self
            .slots
            .iter()
            .flatten()
            .filter(|conn| {
                matches!(conn.link, Link::Udp(_)) && conn.tracking.is_timed_out(self.config.timeout)
            })
            .map(|conn| conn.client_id.slot())
            .collect();
        for slot in timed_out {
            log::info!("client in slot {} timed out", slot);
            self.teardown(slot, events);
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], addr: SocketAddr, events: &mut ServerEvents) {
        let packet = match Packet::deserialize(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("dropping malformed packet from {}: {}", addr, e);
                return;
            }
        };
        if !packet.header.is_valid() {
            return;
        }

        match self.by_addr.get(&addr) {
            Some(&slot) => self.handle_packet(slot, packet, events),
            None => {
                if let PacketType::ConnectionRequest { token } = packet.payload {
                    self.handle_connect_request(addr, &token, events);
                }
            }
        }
    }

    fn handle_connect_request(
        &mut self,
        addr: SocketAddr,
        token: &[u8],
        events: &mut ServerEvents,
    ) {
        let deny = |endpoint: &UdpEndpoint, reason: &str| {
            let packet = Packet::new(
                PacketHeader::new(0, 0, 0),
                PacketType::ConnectionDenied {
                    reason: reason.to_owned(),
                },
            );
            if let Ok(bytes) = packet.serialize() {
                let _ = endpoint.send_to(&bytes, addr);
            }
        };

        let decoded = match verify_connect_token(token, &self.private_key, unix_now()) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("rejecting connect from {}: {}", addr, e);
                deny(&self.endpoint, "invalid token");
                return;
            }
        };
        match self.allocate(Link::Udp(addr), decoded.client_id) {
            Ok(id) => {
                self.by_addr.insert(addr, id.slot());
                log::info!("client {} connected from {} (user {})", id, addr, decoded.client_id);
                self.send_accept(id.slot());
                events.connected(id);
            }
            Err(NetError::ServerFull) => {
                log::warn!("rejecting connect from {}: server full", addr);
                deny(&self.endpoint, "server full");
            }
            Err(e) => {
                log::warn!("rejecting connect from {}: {}", addr, e);
                deny(&self.endpoint, "connect failed");
            }
        }
    }

    fn send_accept(&mut self, slot: u32) {
        let Some(conn) = self.slots[slot as usize].as_mut() else {
            return;
        };
        let header = conn.tracking.next_header();
        let packet = Packet::new(
            header,
            PacketType::ConnectionAccepted {
                client_id: conn.client_id,
            },
        );
        send_link(&self.endpoint, &conn.link, &packet, &self.config.loss_sim);
    }

    fn handle_packet(&mut self, slot: u32, packet: Packet, events: &mut ServerEvents) {
        let Some(conn) = self.slots[slot as usize].as_mut() else {
            return;
        };
        let Some(acked) = conn.tracking.accept(&packet.header) else {
            return;
        };
        for seq in acked {
            conn.channels.ack_packet(seq);
        }

        match packet.payload {
            PacketType::Messages { entries } => {
                conn.ack_debt = conn.ack_debt || !entries.is_empty();
                let mut deliverable = Vec::new();
                for envelope in entries {
                    deliverable.extend(conn.channels.receive(envelope));
                }
                for message in deliverable {
                    self.handle_message(slot, message);
                }
            }
            PacketType::Ping { timestamp } => {
                let header = conn.tracking.next_header();
                let packet = Packet::new(header, PacketType::Pong { timestamp });
                send_link(&self.endpoint, &conn.link, &packet, &self.config.loss_sim);
            }
            PacketType::Pong { .. } => {}
            PacketType::Disconnect => {
                let id = conn.client_id;
                log::info!("client {} disconnected", id);
                self.teardown(slot, events);
            }
            PacketType::ConnectionRequest { .. } => {
                // Duplicate request from an established peer: the accept
                // was lost, answer it again.
                self.send_accept(slot);
            }
            PacketType::ConnectionAccepted { .. } | PacketType::ConnectionDenied { .. } => {
                log::warn!("dropping client-bound handshake packet");
            }
        }
    }

    fn handle_message(&mut self, slot: u32, message: Message) {
        match message {
            Message::ClientCommand {
                id,
                query_id,
                payload,
            } => self.execute_command(slot, id, query_id, &payload),
            Message::ClientReply {
                id,
                query_id,
                payload,
            } => self.receive_reply(slot, id, query_id, &payload),
            other => {
                log::warn!("dropping server-bound message of unexpected kind: {:?}", other);
            }
        }
    }

    fn execute_command(&mut self, slot: u32, id: u32, query_id: u64, payload: &[u8]) {
        let Some(handle) = self.dictionary.receive_command(id) else {
            log::warn!("dropping command with unknown id {}", id);
            return;
        };
        let (args_desc, role, reliable) = {
            let reg = self.registry.borrow();
            let Some(desc) = reg.get(handle) else {
                log::warn!("dropping command with unregistered handle");
                return;
            };
            (desc.args.clone(), desc.role, desc.reliable)
        };
        if role != NetRole::Server {
            log::warn!("dropping client-executed command sent to the server");
            return;
        }

        let (caller, args) = {
            let Some(conn) = self.slots[slot as usize].as_mut() else {
                return;
            };
            let args = match conn.ctx.decode(&args_desc, payload) {
                Ok(args) => args,
                Err(e) => {
                    log::warn!("dropping command {}: undecodable args: {}", id, e);
                    return;
                }
            };
            (conn.client_id, args)
        };

        let result = {
            let mut reg = self.registry.borrow_mut();
            let Some(desc) = reg.get_mut(handle) else {
                return;
            };
            (desc.handler)(caller.0, &args)
        };

        if query_id != 0 {
            let Some(conn) = self.slots[slot as usize].as_mut() else {
                return;
            };
            let payload = match conn.ctx.encode_result(&result) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("dropping reply for command {}: {}", id, e);
                    return;
                }
            };
            let channel = if reliable {
                Reliability::Reliable
            } else {
                Reliability::Unreliable
            };
            conn.channels.send(
                channel,
                Message::ServerReply {
                    id,
                    query_id,
                    payload,
                },
            );
        }
    }

    fn receive_reply(&mut self, slot: u32, id: u32, query_id: u64, payload: &[u8]) {
        let Some(handle) = self.dictionary.receive_command(id) else {
            log::warn!("dropping reply with unknown command id {}", id);
            return;
        };
        let result_desc = {
            let reg = self.registry.borrow();
            match reg.get(handle) {
                Some(desc) => desc.result.clone(),
                None => return,
            }
        };
        let Some(conn) = self.slots[slot as usize].as_mut() else {
            return;
        };
        let result = match conn.ctx.decode_result(&result_desc, payload) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("dropping undecodable reply for command {}: {}", id, e);
                return;
            }
        };
        conn.queue.receive_response(query_id, result);
    }

    /// Queues a command for one client; drained on the next `flush`.
    pub fn send_client_command(&mut self, call: Call, client: ClientId) -> Result<u64, NetError> {
        if !self.is_valid(client) {
            return Err(NetError::InvalidClient);
        }
        let wire_id = self
            .dictionary
            .wire_id(call.handle)
            .ok_or(NetError::UnknownCommand)?;
        let reliable = {
            let reg = self.registry.borrow();
            reg.get(call.handle).map(|d| d.reliable).unwrap_or(true)
        };
        let Some(conn) = self.slots[client.slot() as usize].as_mut() else {
            return Err(NetError::InvalidClient);
        };
        Ok(conn.queue.enqueue(wire_id, call.args, reliable, call.on_reply))
    }

    fn send_object(&mut self, client: ClientId, message: Message) -> Result<(), NetError> {
        if !self.is_valid(client) {
            return Err(NetError::InvalidClient);
        }
        let Some(conn) = self.slots[client.slot() as usize].as_mut() else {
            return Err(NetError::InvalidClient);
        };
        conn.channels.send(Reliability::Reliable, message);
        Ok(())
    }

    pub fn create_object(
        &mut self,
        client: ClientId,
        object: ObjectId,
        data: ClientData,
    ) -> Result<(), NetError> {
        self.send_object(client, Message::ObjectCreate { object, data })
    }

    pub fn update_object(
        &mut self,
        client: ClientId,
        object: ObjectId,
        data: ClientData,
    ) -> Result<(), NetError> {
        self.send_object(client, Message::ObjectUpdate { object, data })
    }

    pub fn delete_object(&mut self, client: ClientId, object: ObjectId) -> Result<(), NetError> {
        self.send_object(client, Message::ObjectDelete { object })
    }

    /// Drains command queues into the channels and puts packets on the
    /// wire.
    pub fn flush(&mut self) {
        let now = self.now();
        let keepalive = self.config.keepalive.as_secs_f64();
        for slot in 0..self.slots.len() {
            let Some(conn) = self.slots[slot].as_mut() else {
                continue;
            };

            let mut outgoing = Vec::new();
            conn.queue.process_queue(|cmd| outgoing.push(cmd));
            for cmd in outgoing {
                match conn.ctx.encode(&cmd.args) {
                    Ok(payload) => {
                        let channel = if cmd.reliable {
                            Reliability::Reliable
                        } else {
                            Reliability::Unreliable
                        };
                        conn.channels.send(
                            channel,
                            Message::ServerCommand {
                                id: cmd.id,
                                query_id: cmd.query_id,
                                payload,
                            },
                        );
                    }
                    Err(e) => log::warn!("dropping unencodable command {}: {}", cmd.id, e),
                }
            }

            let rto = conn.tracking.rto_secs();
            let entries = conn.channels.outgoing(now, rto);
            if entries.is_empty() {
                if conn.ack_debt || now - conn.last_send >= keepalive {
                    let header = conn.tracking.next_header();
                    let packet = Packet::new(
                        header,
                        PacketType::Ping {
                            timestamp: (now * 1000.0) as u64,
                        },
                    );
                    send_link(&self.endpoint, &conn.link, &packet, &self.config.loss_sim);
                    conn.last_send = now;
                    conn.ack_debt = false;
                }
                continue;
            }

            for group in group_entries(entries) {
                let header = conn.tracking.next_header();
                conn.channels.mark_sent(header.sequence, &group, now);
                let packet = Packet::new(header, PacketType::Messages { entries: group });
                send_link(&self.endpoint, &conn.link, &packet, &self.config.loss_sim);
            }
            conn.last_send = now;
            conn.ack_debt = false;
        }
    }

    /// Server-initiated disconnect.
    pub fn disconnect_client(
        &mut self,
        client: ClientId,
        events: &mut ServerEvents,
    ) -> Result<(), NetError> {
        if !self.is_valid(client) {
            return Err(NetError::InvalidClient);
        }
        let slot = client.slot();
        if let Some(conn) = self.slots[slot as usize].as_mut() {
            let header = conn.tracking.next_header();
            let packet = Packet::new(header, PacketType::Disconnect);
            send_link(&self.endpoint, &conn.link, &packet, &self.config.loss_sim);
        }
        self.teardown(slot, events);
        Ok(())
    }

    /// Releases a slot: the generation bump invalidates outstanding ids and
    /// every pending completion is cancelled, not leaked.
    fn teardown(&mut self, slot: u32, events: &mut ServerEvents) {
        let Some(mut conn) = self.slots[slot as usize].take() else {
            return;
        };
        conn.queue.clear();
        if let Link::Udp(addr) = conn.link {
            self.by_addr.remove(&addr);
        }
        self.generations[slot as usize] += 1;
        debug_assert_eq!(self.generations[slot as usize] % 2, 1);
        events.disconnected(conn.client_id);
    }
}
