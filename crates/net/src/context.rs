//! Single-owner facade over one optional server and any number of local
//! clients, sharing one command registry. A dedicated server, a pure
//! client, and a listen-server process all use the same type.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use crate::client::{Client, ClientEvents, ClientState};
use crate::codec::TypeDesc;
use crate::command::{CommandFn, CommandHandle, CommandRegistry, NetRole};
use crate::endpoint::{Call, NetError};
use crate::protocol::{ClientData, ClientId, ObjectId};
use crate::server::{Server, ServerConfig, ServerEvents};
use crate::token::generate_connect_token;

pub struct NetCtx {
    registry: Rc<RefCell<CommandRegistry>>,
    server: Option<Server>,
    clients: Vec<Option<Client>>,
    pub server_events: ServerEvents,
    pub client_events: ClientEvents,
}

impl NetCtx {
    pub fn new() -> Self {
        Self {
            registry: Rc::new(RefCell::new(CommandRegistry::new())),
            server: None,
            clients: Vec::new(),
            server_events: ServerEvents::default(),
            client_events: ClientEvents::default(),
        }
    }

    /// Commands must be declared before any endpoint starts, since the
    /// dictionary is built from the registry at server start.
    pub fn declare_command(
        &mut self,
        name: &str,
        role: NetRole,
        reliable: bool,
        args: TypeDesc,
        result: Option<TypeDesc>,
        handler: CommandFn,
    ) -> CommandHandle {
        self.registry
            .borrow_mut()
            .declare(name, role, reliable, args, result, handler)
    }

    pub fn registry(&self) -> &Rc<RefCell<CommandRegistry>> {
        &self.registry
    }

    pub fn start_server(
        &mut self,
        addr: SocketAddr,
        private_key: &[u8],
        config: ServerConfig,
    ) -> Result<(), NetError> {
        let server = Server::start(Rc::clone(&self.registry), addr, private_key, config)?;
        self.server = Some(server);
        Ok(())
    }

    pub fn server(&self) -> Option<&Server> {
        self.server.as_ref()
    }

    pub fn server_mut(&mut self) -> Option<&mut Server> {
        self.server.as_mut()
    }

    fn free_index(&mut self) -> usize {
        match self.clients.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                self.clients.push(None);
                self.clients.len() - 1
            }
        }
    }

    /// Starts a networked connect with a caller-supplied token. Returns the
    /// local index identifying this client in event callbacks.
    pub fn connect(&mut self, server_addr: SocketAddr, token: Vec<u8>) -> Result<u32, NetError> {
        let index = self.free_index();
        let client = Client::connect(
            Rc::clone(&self.registry),
            index as u32,
            server_addr,
            token,
        )?;
        self.clients[index] = Some(client);
        Ok(index as u32)
    }

    /// Connects a client to the in-process server through loopback pipes.
    pub fn connect_loopback(&mut self) -> Result<u32, NetError> {
        let index = self.free_index();
        let server = self.server.as_mut().ok_or(NetError::NoServer)?;
        let client = Client::connect_loopback(
            Rc::clone(&self.registry),
            index as u32,
            server,
            &mut self.server_events,
            &mut self.client_events,
        )?;
        self.clients[index] = Some(client);
        Ok(index as u32)
    }

    /// Convenience for single-process setups where both sides hold the key.
    pub fn generate_token(
        &self,
        private_key: &[u8],
        user_id: u64,
        server_addr: &str,
        lifetime: Duration,
    ) -> Result<Vec<u8>, NetError> {
        Ok(generate_connect_token(
            user_id,
            server_addr,
            &[],
            private_key,
            lifetime,
        )?)
    }

    fn client_mut(&mut self, index: u32) -> Result<&mut Client, NetError> {
        self.clients
            .get_mut(index as usize)
            .and_then(Option::as_mut)
            .ok_or(NetError::InvalidLocalIndex)
    }

    pub fn client_state(&self, index: u32) -> Option<ClientState> {
        self.clients
            .get(index as usize)
            .and_then(Option::as_ref)
            .map(Client::state)
    }

    pub fn client_id(&self, index: u32) -> Option<ClientId> {
        self.clients
            .get(index as usize)
            .and_then(Option::as_ref)
            .and_then(Client::client_id)
    }

    /// Pumps the server first so loopback clients see its packets within
    /// the same tick.
    pub fn tick(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.tick(&mut self.server_events);
        }
        for client in self.clients.iter_mut().flatten() {
            client.tick(&mut self.client_events);
        }
        for slot in &mut self.clients {
            if matches!(slot, Some(c) if c.state() == ClientState::Disconnected) {
                *slot = None;
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.flush();
        }
        for client in self.clients.iter_mut().flatten() {
            client.flush();
        }
    }

    pub fn send_server_command(&mut self, index: u32, call: Call) -> Result<u64, NetError> {
        self.client_mut(index)?.send_server_command(call)
    }

    pub fn send_client_command(&mut self, call: Call, client: ClientId) -> Result<u64, NetError> {
        self.server
            .as_mut()
            .ok_or(NetError::NoServer)?
            .send_client_command(call, client)
    }

    pub fn create_object(
        &mut self,
        client: ClientId,
        object: ObjectId,
        data: ClientData,
    ) -> Result<(), NetError> {
        self.server
            .as_mut()
            .ok_or(NetError::NoServer)?
            .create_object(client, object, data)
    }

    pub fn update_object(
        &mut self,
        client: ClientId,
        object: ObjectId,
        data: ClientData,
    ) -> Result<(), NetError> {
        self.server
            .as_mut()
            .ok_or(NetError::NoServer)?
            .update_object(client, object, data)
    }

    pub fn delete_object(&mut self, client: ClientId, object: ObjectId) -> Result<(), NetError> {
        self.server
            .as_mut()
            .ok_or(NetError::NoServer)?
            .delete_object(client, object)
    }

    pub fn disconnect(&mut self, index: u32) -> Result<(), NetError> {
        let mut client = self
            .clients
            .get_mut(index as usize)
            .and_then(Option::take)
            .ok_or(NetError::InvalidLocalIndex)?;
        client.disconnect(&mut self.client_events);
        Ok(())
    }

    pub fn disconnect_client(&mut self, client: ClientId) -> Result<(), NetError> {
        self.server
            .as_mut()
            .ok_or(NetError::NoServer)?
            .disconnect_client(client, &mut self.server_events)
    }
}

impl Default for NetCtx {
    fn default() -> Self {
        Self::new()
    }
}
