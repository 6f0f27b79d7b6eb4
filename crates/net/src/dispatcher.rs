//! Frame-staged object replication. Game code stages object changes here
//! each frame; `flush` fans the net effect out to every connected client
//! and brings late joiners up to date with a full snapshot.

use std::collections::{HashMap, HashSet};

use crate::endpoint::NetError;
use crate::protocol::{ClientData, ClientId, ObjectId};
use crate::server::Server;

#[derive(Default)]
pub struct ServerDispatcher {
    objects: HashMap<ObjectId, ClientData>,
    announced: HashSet<ObjectId>,
    pending: Vec<ObjectId>,
    deleted: Vec<ObjectId>,
    connected: Vec<ClientId>,
    joining: Vec<ClientId>,
}

impl ServerDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call from the connected event. The client sees nothing until the
    /// next `flush`, which sends it the full object set.
    pub fn register_client(&mut self, id: ClientId) {
        if !self.joining.contains(&id) && !self.connected.contains(&id) {
            self.joining.push(id);
        }
    }

    /// Call from the disconnected event.
    pub fn unregister_client(&mut self, id: ClientId) {
        self.connected.retain(|c| *c != id);
        self.joining.retain(|c| *c != id);
    }

    /// Stages a create or update. Several updates to one object within a
    /// frame collapse to the last value.
    pub fn update_object(&mut self, object: ObjectId, data: ClientData) {
        if self.objects.insert(object, data).is_none() {
            self.deleted.retain(|o| *o != object);
        }
        if !self.pending.contains(&object) {
            self.pending.push(object);
        }
    }

    pub fn delete_object(&mut self, object: ObjectId) {
        if self.objects.remove(&object).is_some() {
            self.pending.retain(|o| *o != object);
            self.deleted.push(object);
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Sends this frame's staged changes to every connected client and the
    /// full snapshot to clients that joined since the last flush.
    pub fn flush(&mut self, server: &mut Server) {
        self.connected.retain(|c| server.is_valid(*c));
        self.joining.retain(|c| server.is_valid(*c));

        for object in self.pending.drain(..) {
            let Some(data) = self.objects.get(&object).copied() else {
                continue;
            };
            let fresh = self.announced.insert(object);
            for client in &self.connected {
                let sent = if fresh {
                    server.create_object(*client, object, data)
                } else {
                    server.update_object(*client, object, data)
                };
                if let Err(e) = sent {
                    log::debug!("skipping object send to {}: {}", client, e);
                }
            }
        }

        for object in self.deleted.drain(..) {
            if !self.announced.remove(&object) {
                continue;
            }
            for client in &self.connected {
                if let Err(e) = server.delete_object(*client, object) {
                    log::debug!("skipping object delete to {}: {}", client, e);
                }
            }
        }

        for client in self.joining.drain(..) {
            for (object, data) in &self.objects {
                if let Err(e) = server.create_object(client, *object, *data) {
                    log::debug!("skipping snapshot send to {}: {}", client, e);
                }
            }
            self.connected.push(client);
        }
    }
}
