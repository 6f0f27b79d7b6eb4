//! The client endpoint: token handshake, manifest stall, command send and
//! dispatch, object replication callbacks.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::channel::{MessageChannels, group_entries};
use crate::command::{CommandDictionary, CommandQueue, CommandRegistry, NetRole};
use crate::endpoint::{Call, NetError, SerializationContext};
use crate::mphf::MphfData;
use crate::protocol::{
    ClientData, ClientId, Message, ObjectId, Packet, PacketType, Reliability,
};
use crate::server::{Server, ServerEvents};
use crate::transport::{LoopbackPipe, PacketLossSimulation, PacketTracking, UdpEndpoint};

const CONNECT_RESEND_SECS: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle and replication callbacks. The first parameter is always the
/// local client index, since one set of callbacks can serve several
/// clients in a process.
#[derive(Default)]
pub struct ClientEvents {
    pub on_connected: Option<Box<dyn FnMut(u32, ClientId)>>,
    pub on_disconnected: Option<Box<dyn FnMut(u32)>>,
    pub on_new_object: Option<Box<dyn FnMut(u32, ObjectId, ClientData)>>,
    pub on_object_updated: Option<Box<dyn FnMut(u32, ObjectId, ClientData)>>,
    pub on_object_deleted: Option<Box<dyn FnMut(u32, ObjectId)>>,
}

impl ClientEvents {
    fn connected(&mut self, index: u32, id: ClientId) {
        if let Some(callback) = &mut self.on_connected {
            callback(index, id);
        }
    }

    fn disconnected(&mut self, index: u32) {
        if let Some(callback) = &mut self.on_disconnected {
            callback(index);
        }
    }

    fn new_object(&mut self, index: u32, object: ObjectId, data: ClientData) {
        if let Some(callback) = &mut self.on_new_object {
            callback(index, object, data);
        }
    }

    fn object_updated(&mut self, index: u32, object: ObjectId, data: ClientData) {
        if let Some(callback) = &mut self.on_object_updated {
            callback(index, object, data);
        }
    }

    fn object_deleted(&mut self, index: u32, object: ObjectId) {
        if let Some(callback) = &mut self.on_object_deleted {
            callback(index, object);
        }
    }
}

enum ClientLink {
    Udp {
        endpoint: UdpEndpoint,
        server: SocketAddr,
    },
    Loopback(LoopbackPipe),
}

fn send_link(link: &ClientLink, packet: &Packet, sim: &PacketLossSimulation) {
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
        ClientLink::Udp { endpoint, server } => {
            if let Err(e) = endpoint.send_to(&bytes, *server) {
                log::warn!("send to {} failed: {}", server, e);
            }
        }
        ClientLink::Loopback(pipe) => pipe.send(bytes),
    }
}

pub struct Client {
    registry: Rc<RefCell<CommandRegistry>>,
    ctx: Option<SerializationContext>,
    queue: CommandQueue,
    channels: MessageChannels,
    tracking: PacketTracking,
    link: ClientLink,
    state: ClientState,
    local_index: u32,
    client_id: Option<ClientId>,
    token: Vec<u8>,
    stalled: VecDeque<Message>,
    start: Instant,
    last_request: f64,
    last_send: f64,
    ack_debt: bool,
    timeout: Duration,
    keepalive: Duration,
    pub loss_sim: PacketLossSimulation,
}

impl Client {
    /// Starts a networked connect. The request is (re)sent from `tick`
    /// until the server answers.
    pub fn connect(
        registry: Rc<RefCell<CommandRegistry>>,
        local_index: u32,
        server_addr: SocketAddr,
        token: Vec<u8>,
    ) -> Result<Client, NetError> {
        let endpoint = UdpEndpoint::bind(("0.0.0.0", 0))?;
        log::info!(
            "client {} connecting to {} from {}",
            local_index,
            server_addr,
            endpoint.local_addr()
        );
        Ok(Self::with_link(
            registry,
            local_index,
            ClientLink::Udp {
                endpoint,
                server: server_addr,
            },
            ClientState::Connecting,
            None,
            token,
        ))
    }

    /// Connects through in-process pipes to a server in the same process.
    /// The packet path is identical to the networked one; only the
    /// handshake is skipped.
    pub fn connect_loopback(
        registry: Rc<RefCell<CommandRegistry>>,
        local_index: u32,
        server: &mut Server,
        server_events: &mut ServerEvents,
        client_events: &mut ClientEvents,
    ) -> Result<Client, NetError> {
        let (client_id, pipe) = server.connect_loopback(server_events, local_index as u64)?;
        let client = Self::with_link(
            registry,
            local_index,
            ClientLink::Loopback(pipe),
            ClientState::Connected,
            Some(client_id),
            Vec::new(),
        );
        client_events.connected(local_index, client_id);
        Ok(client)
    }

    fn with_link(
        registry: Rc<RefCell<CommandRegistry>>,
        local_index: u32,
        link: ClientLink,
        state: ClientState,
        client_id: Option<ClientId>,
        token: Vec<u8>,
    ) -> Client {
        Client {
            registry,
            ctx: None,
            queue: CommandQueue::new(),
            channels: MessageChannels::new(),
            tracking: PacketTracking::new(),
            link,
            state,
            local_index,
            client_id,
            token,
            stalled: VecDeque::new(),
            start: Instant::now(),
            last_request: f64::NEG_INFINITY,
            last_send: 0.0,
            ack_debt: false,
            timeout: Duration::from_secs(10),
            keepalive: Duration::from_millis(250),
            loss_sim: PacketLossSimulation::default(),
        }
    }

    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    /// True once the manifest is installed and commands can flow.
    pub fn has_manifest(&self) -> bool {
        self.ctx.is_some()
    }

    /// Pumps the link: handshake resends, packet receive, and dispatch.
    pub fn tick(&mut self, events: &mut ClientEvents) {
        let now = self.now();
        if self.state == ClientState::Connecting && now - self.last_request >= CONNECT_RESEND_SECS
        {
            let header = self.tracking.next_header();
            let packet = Packet::new(
                header,
                PacketType::ConnectionRequest {
                    token: self.token.clone(),
                },
            );
            send_link(&self.link, &packet, &self.loss_sim);
            self.last_request = now;
        }

        let datagrams: Vec<Vec<u8>> = match &mut self.link {
            ClientLink::Udp { endpoint, server } => match endpoint.receive() {
                Ok(received) => {
                    let server = *server;
                    received
                        .into_iter()
                        .filter(|(_, addr)| *addr == server)
                        .map(|(bytes, _)| bytes)
                        .collect()
                }
                Err(e) => {
                    log::warn!("socket receive failed: {}", e);
                    Vec::new()
                }
            },
            ClientLink::Loopback(pipe) => {
                let mut out = Vec::new();
                while let Some(bytes) = pipe.try_recv() {
                    out.push(bytes);
                }
                out
            }
        };
        for bytes in datagrams {
            self.handle_datagram(&bytes, events);
        }

        if self.state == ClientState::Connected
            && matches!(self.link, ClientLink::Udp { .. })
            && self.tracking.is_timed_out(self.timeout)
        {
            log::warn!("client {}: server went silent, disconnecting", self.local_index);
            self.drop_connection(events);
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], events: &mut ClientEvents) {
        let packet = match Packet::deserialize(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("dropping malformed packet: {}", e);
                return;
            }
        };
        if !packet.header.is_valid() {
            return;
        }
        let Some(acked) = self.tracking.accept(&packet.header) else {
            return;
        };
        for seq in acked {
            self.channels.ack_packet(seq);
        }

        match packet.payload {
            PacketType::ConnectionAccepted { client_id } => {
                if self.state == ClientState::Connecting {
                    self.state = ClientState::Connected;
                    self.client_id = Some(client_id);
                    log::info!("client {} accepted as {}", self.local_index, client_id);
                    events.connected(self.local_index, client_id);
                }
            }
            PacketType::ConnectionDenied { reason } => {
                if self.state == ClientState::Connecting {
                    log::warn!("client {} denied: {}", self.local_index, reason);
                    self.drop_connection(events);
                }
            }
            PacketType::Messages { entries } => {
                self.ack_debt = self.ack_debt || !entries.is_empty();
                let mut deliverable = Vec::new();
                for envelope in entries {
                    deliverable.extend(self.channels.receive(envelope));
                }
                for message in deliverable {
                    // Until the manifest arrives nothing else can be
                    // interpreted; hold it back instead of dropping it.
                    if self.ctx.is_none() && !matches!(message, Message::SendManifest { .. }) {
                        self.stalled.push_back(message);
                    } else {
                        self.handle_message(message, events);
                    }
                }
            }
            PacketType::Ping { timestamp } => {
                let header = self.tracking.next_header();
                let packet = Packet::new(header, PacketType::Pong { timestamp });
                send_link(&self.link, &packet, &self.loss_sim);
            }
            PacketType::Pong { .. } => {}
            PacketType::Disconnect => {
                log::info!("client {} disconnected by server", self.local_index);
                self.drop_connection(events);
            }
            PacketType::ConnectionRequest { .. } => {
                log::warn!("dropping server-bound handshake packet");
            }
        }
    }

    fn handle_message(&mut self, message: Message, events: &mut ClientEvents) {
        match message {
            Message::SendManifest {
                seeds,
                hash_len,
                mask,
                assignment,
                rank,
            } => {
                let data = MphfData {
                    hash_len,
                    mask,
                    assignment,
                    rank,
                };
                let dictionary = {
                    let reg = self.registry.borrow();
                    CommandDictionary::build_client(&reg, seeds, data)
                };
                self.ctx = Some(SerializationContext::new(Rc::new(dictionary)));
                log::info!("client {}: manifest installed", self.local_index);
                while let Some(held) = self.stalled.pop_front() {
                    self.handle_message(held, events);
                }
            }
            Message::ServerCommand {
                id,
                query_id,
                payload,
            } => self.execute_command(id, query_id, &payload),
            Message::ServerReply {
                id,
                query_id,
                payload,
            } => self.receive_reply(id, query_id, &payload),
            Message::ObjectCreate { object, data } => {
                events.new_object(self.local_index, object, data)
            }
            Message::ObjectUpdate { object, data } => {
                events.object_updated(self.local_index, object, data)
            }
            Message::ObjectDelete { object } => events.object_deleted(self.local_index, object),
            other => {
                log::warn!("dropping client-bound message of unexpected kind: {:?}", other);
            }
        }
    }

    fn execute_command(&mut self, id: u32, query_id: u64, payload: &[u8]) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        let Some(handle) = ctx.dictionary().receive_command(id) else {
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
        if role != NetRole::Client {
            log::warn!("dropping server-executed command sent to a client");
            return;
        }
        let args = match ctx.decode(&args_desc, payload) {
            Ok(args) => args,
            Err(e) => {
                log::warn!("dropping command {}: undecodable args: {}", id, e);
                return;
            }
        };

        let caller = self.client_id.map(|c| c.0).unwrap_or(0);
        let result = {
            let mut reg = self.registry.borrow_mut();
            let Some(desc) = reg.get_mut(handle) else {
                return;
            };
            (desc.handler)(caller, &args)
        };

        if query_id != 0 {
            let Some(ctx) = self.ctx.as_mut() else {
                return;
            };
            let payload = match ctx.encode_result(&result) {
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
            self.channels.send(
                channel,
                Message::ClientReply {
                    id,
                    query_id,
                    payload,
                },
            );
        }
    }

    fn receive_reply(&mut self, id: u32, query_id: u64, payload: &[u8]) {
        let Some(ctx) = self.ctx.as_mut() else {
            return;
        };
        let Some(handle) = ctx.dictionary().receive_command(id) else {
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
        let result = match ctx.decode_result(&result_desc, payload) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("dropping undecodable reply for command {}: {}", id, e);
                return;
            }
        };
        self.queue.receive_response(query_id, result);
    }

    /// Queues a command for the server; drained on the next `flush`.
    /// Requires the manifest, since wire ids come from it.
    pub fn send_server_command(&mut self, call: Call) -> Result<u64, NetError> {
        let ctx = self.ctx.as_ref().ok_or(NetError::NotConnected)?;
        let wire_id = ctx
            .dictionary()
            .wire_id(call.handle)
            .ok_or(NetError::UnknownCommand)?;
        let reliable = {
            let reg = self.registry.borrow();
            reg.get(call.handle).map(|d| d.reliable).unwrap_or(true)
        };
        Ok(self.queue.enqueue(wire_id, call.args, reliable, call.on_reply))
    }

    /// Drains the command queue into the channels and sends packets.
    pub fn flush(&mut self) {
        if self.state != ClientState::Connected {
            return;
        }
        let now = self.now();

        if let Some(ctx) = self.ctx.as_ref() {
            let mut outgoing = Vec::new();
            self.queue.process_queue(|cmd| outgoing.push(cmd));
            for cmd in outgoing {
                match ctx.encode(&cmd.args) {
                    Ok(payload) => {
                        let channel = if cmd.reliable {
                            Reliability::Reliable
                        } else {
                            Reliability::Unreliable
                        };
                        self.channels.send(
                            channel,
                            Message::ClientCommand {
                                id: cmd.id,
                                query_id: cmd.query_id,
                                payload,
                            },
                        );
                    }
                    Err(e) => log::warn!("dropping unencodable command {}: {}", cmd.id, e),
                }
            }
        }

        let rto = self.tracking.rto_secs();
        let entries = self.channels.outgoing(now, rto);
        if entries.is_empty() {
            if self.ack_debt || now - self.last_send >= self.keepalive.as_secs_f64() {
                let header = self.tracking.next_header();
                let packet = Packet::new(
                    header,
                    PacketType::Ping {
                        timestamp: (now * 1000.0) as u64,
                    },
                );
                send_link(&self.link, &packet, &self.loss_sim);
                self.last_send = now;
                self.ack_debt = false;
            }
            return;
        }

        for group in group_entries(entries) {
            let header = self.tracking.next_header();
            self.channels.mark_sent(header.sequence, &group, now);
            let packet = Packet::new(header, PacketType::Messages { entries: group });
            send_link(&self.link, &packet, &self.loss_sim);
        }
        self.last_send = now;
        self.ack_debt = false;
    }

    /// Tells the server goodbye and tears down locally. Over loopback the
    /// packet releases the mirrored server slot the same way.
    pub fn disconnect(&mut self, events: &mut ClientEvents) {
        if self.state == ClientState::Disconnected {
            return;
        }
        let header = self.tracking.next_header();
        let packet = Packet::new(header, PacketType::Disconnect);
        send_link(&self.link, &packet, &self.loss_sim);
        self.drop_connection(events);
    }

    fn drop_connection(&mut self, events: &mut ClientEvents) {
        self.queue.clear();
        self.state = ClientState::Disconnected;
        events.disconnected(self.local_index);
    }
}
