//! Command declarations, the shared dictionary, and per-connection queues.
//!
//! Both peers declare the same commands against a [`CommandRegistry`] at
//! startup. The server builds a [`CommandDictionary`] over every command and
//! field name and ships its hash tables to clients in the manifest, after
//! which a name maps to the same dense wire id on both sides.

use std::collections::{HashMap, HashSet};

use crate::codec::{TypeDesc, Value};
use crate::mphf::{MphfData, StringMphf};

/// Which endpoint executes the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetRole {
    Server,
    Client,
}

pub type CommandFn = Box<dyn FnMut(u64, &Value) -> Option<Value>>;

pub struct CommandDesc {
    pub name: String,
    pub args: TypeDesc,
    pub result: Option<TypeDesc>,
    pub role: NetRole,
    pub reliable: bool,
    pub handler: CommandFn,
}

/// Registration index, stable across both peers as long as they declare the
/// same command set. Wire ids are resolved through the dictionary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle(pub u32);

/// Startup-time command table. Built explicitly and handed to the endpoints;
/// nothing here is global.
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<CommandDesc>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(
        &mut self,
        name: &str,
        role: NetRole,
        reliable: bool,
        args: TypeDesc,
        result: Option<TypeDesc>,
        handler: CommandFn,
    ) -> CommandHandle {
        self.commands.push(CommandDesc {
            name: name.to_owned(),
            args,
            result,
            role,
            reliable,
            handler,
        });
        CommandHandle((self.commands.len() - 1) as u32)
    }

    pub fn get(&self, handle: CommandHandle) -> Option<&CommandDesc> {
        self.commands.get(handle.0 as usize)
    }

    pub fn get_mut(&mut self, handle: CommandHandle) -> Option<&mut CommandDesc> {
        self.commands.get_mut(handle.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Command names plus every struct field name reachable from their
    /// descriptors, deduplicated in first-seen order.
    fn dictionary_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |name: String, keys: &mut Vec<String>, seen: &mut HashSet<String>| {
            if seen.insert(name.clone()) {
                keys.push(name);
            }
        };
        for desc in &self.commands {
            push(desc.name.clone(), &mut keys, &mut seen);
            let mut fields = Vec::new();
            desc.args.gather_field_names(&mut fields);
            if let Some(result) = &desc.result {
                result.gather_field_names(&mut fields);
            }
            for field in fields {
                push(field, &mut keys, &mut seen);
            }
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DictionaryError {
    #[error("minimal perfect hash construction failed")]
    HashBuildFailed,
}

/// Name-to-wire-id mapping shared by both peers. The server builds it from
/// scratch; clients reassemble it from manifest tables.
pub struct CommandDictionary {
    mphf: StringMphf,
    ids_by_handle: Vec<u32>,
    handles_by_id: HashMap<u32, CommandHandle>,
}

impl CommandDictionary {
    pub fn build(registry: &CommandRegistry) -> Result<Self, DictionaryError> {
        let keys = registry.dictionary_keys();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mphf = StringMphf::build(&refs).ok_or(DictionaryError::HashBuildFailed)?;
        Ok(Self::index(registry, mphf))
    }

    /// Client-side construction from received hash tables. Local command
    /// names are rehashed through the remote tables so wire ids agree with
    /// the server bit for bit.
    pub fn build_client(registry: &CommandRegistry, seeds: [u32; 3], data: MphfData) -> Self {
        Self::index(registry, StringMphf::from_parts(seeds, data))
    }

    fn index(registry: &CommandRegistry, mphf: StringMphf) -> Self {
        let mut ids_by_handle = Vec::with_capacity(registry.len());
        let mut handles_by_id = HashMap::with_capacity(registry.len());
        for (i, desc) in registry.commands.iter().enumerate() {
            let id = mphf.compute(&desc.name);
            ids_by_handle.push(id);
            handles_by_id.insert(id, CommandHandle(i as u32));
        }
        Self {
            mphf,
            ids_by_handle,
            handles_by_id,
        }
    }

    pub fn mphf(&self) -> &StringMphf {
        &self.mphf
    }

    pub fn wire_id(&self, handle: CommandHandle) -> Option<u32> {
        self.ids_by_handle.get(handle.0 as usize).copied()
    }

    /// Resolves an incoming wire id. `None` fails the whole message.
    pub fn receive_command(&self, id: u32) -> Option<CommandHandle> {
        self.handles_by_id.get(&id).copied()
    }
}

/// Outcome delivered to a completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum CallReply {
    Value(Option<Value>),
    Cancelled,
}

pub type ReplyFn = Box<dyn FnOnce(CallReply)>;

pub struct OutgoingCommand {
    pub id: u32,
    pub args: Value,
    pub query_id: u64,
    pub reliable: bool,
}

/// Per-connection outgoing command queue plus the completion map keyed by
/// query id. Query id 0 means fire-and-forget.
#[derive(Default)]
pub struct CommandQueue {
    queue: Vec<OutgoingCommand>,
    completions: HashMap<u64, ReplyFn>,
    next_query: u64,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a command. A query id is allocated only when the caller wants
    /// a reply; the id returned is 0 otherwise.
    pub fn enqueue(
        &mut self,
        id: u32,
        args: Value,
        reliable: bool,
        on_reply: Option<ReplyFn>,
    ) -> u64 {
        let query_id = match on_reply {
            Some(callback) => {
                self.next_query += 1;
                self.completions.insert(self.next_query, callback);
                self.next_query
            }
            None => 0,
        };
        self.queue.push(OutgoingCommand {
            id,
            args,
            query_id,
            reliable,
        });
        query_id
    }

    /// Drains the queue in FIFO order through `sink`.
    pub fn process_queue(&mut self, mut sink: impl FnMut(OutgoingCommand)) {
        for command in self.queue.drain(..) {
            sink(command);
        }
    }

    /// Routes a reply to its completion. Unmatched replies are dropped;
    /// a late reply after `clear` is normal traffic, not an error.
    pub fn receive_response(&mut self, query_id: u64, result: Option<Value>) {
        match self.completions.remove(&query_id) {
            Some(callback) => callback(CallReply::Value(result)),
            None => log::debug!("dropping unmatched reply for query {}", query_id),
        }
    }

    /// Drops queued commands and cancels every outstanding completion, so
    /// no callback is leaked across a disconnect.
    pub fn clear(&mut self) {
        self.queue.clear();
        for (_, callback) in self.completions.drain() {
            callback(CallReply::Cancelled);
        }
        self.next_query = 0;
    }

    pub fn pending_queries(&self) -> usize {
        self.completions.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ping_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.declare(
            "Ping",
            NetRole::Server,
            true,
            TypeDesc::Int,
            Some(TypeDesc::Int),
            Box::new(|_caller, args| args.as_int().map(|v| Value::Int(v * 2))),
        );
        registry.declare(
            "SetPlayerInput",
            NetRole::Server,
            true,
            TypeDesc::Struct(vec![
                ("moving".into(), TypeDesc::Bool),
                (
                    "direction".into(),
                    TypeDesc::Struct(vec![
                        ("x".into(), TypeDesc::Float),
                        ("y".into(), TypeDesc::Float),
                        ("z".into(), TypeDesc::Float),
                    ]),
                ),
            ]),
            None,
            Box::new(|_, _| None),
        );
        registry
    }

    #[test]
    fn dictionary_ids_agree_across_peers() {
        let registry = ping_registry();
        let server = CommandDictionary::build(&registry).unwrap();

        let client = CommandDictionary::build_client(
            &registry,
            server.mphf().seeds,
            server.mphf().data.clone(),
        );
        for i in 0..registry.len() as u32 {
            let handle = CommandHandle(i);
            assert_eq!(server.wire_id(handle), client.wire_id(handle));
            let id = server.wire_id(handle).unwrap();
            assert_eq!(client.receive_command(id), Some(handle));
        }
    }

    #[test]
    fn unknown_wire_id_is_rejected() {
        let registry = ping_registry();
        let dictionary = CommandDictionary::build(&registry).unwrap();
        // Dense ids cover 0..key_count; anything beyond cannot be a command.
        assert_eq!(dictionary.receive_command(u32::MAX), None);
    }

    #[test]
    fn query_ids_correlate_out_of_order() {
        let mut queue = CommandQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let a = seen.clone();
        let qa = queue.enqueue(
            1,
            Value::Int(1),
            true,
            Some(Box::new(move |reply| a.borrow_mut().push(("a", reply)))),
        );
        let b = seen.clone();
        let qb = queue.enqueue(
            1,
            Value::Int(2),
            true,
            Some(Box::new(move |reply| b.borrow_mut().push(("b", reply)))),
        );
        assert_ne!(qa, 0);
        assert_ne!(qb, 0);
        assert_ne!(qa, qb);

        queue.receive_response(qb, Some(Value::Int(4)));
        queue.receive_response(qa, Some(Value::Int(2)));

        let seen = seen.borrow();
        assert_eq!(seen[0], ("b", CallReply::Value(Some(Value::Int(4)))));
        assert_eq!(seen[1], ("a", CallReply::Value(Some(Value::Int(2)))));
    }

    #[test]
    fn fire_and_forget_allocates_no_query() {
        let mut queue = CommandQueue::new();
        assert_eq!(queue.enqueue(3, Value::Bool(true), false, None), 0);
        assert_eq!(queue.pending_queries(), 0);

        let mut drained = Vec::new();
        queue.process_queue(|cmd| drained.push(cmd.query_id));
        assert_eq!(drained, vec![0]);
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn clear_cancels_outstanding_completions() {
        let mut queue = CommandQueue::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = seen.clone();
        let query = queue.enqueue(
            7,
            Value::Int(0),
            true,
            Some(Box::new(move |reply| s.borrow_mut().push(reply))),
        );
        queue.clear();
        assert_eq!(*seen.borrow(), vec![CallReply::Cancelled]);

        // A straggling reply after the cancel is silently dropped.
        queue.receive_response(query, Some(Value::Int(1)));
        assert_eq!(seen.borrow().len(), 1);
    }
}
