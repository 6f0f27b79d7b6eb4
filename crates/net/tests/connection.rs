//! End-to-end tests over real UDP sockets on 127.0.0.1. Both endpoints live
//! in one process and are pumped until a condition holds or a bounded
//! number of rounds runs out.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use glam::Vec3;
use tether::{
    Call, CallReply, Client, ClientData, ClientEvents, ClientState, CommandHandle,
    CommandRegistry, DEFAULT_TOKEN_LIFETIME, NetCtx, NetRole, ObjectId, PacketLossSimulation,
    Server, ServerConfig, ServerEvents, TypeDesc, Value, generate_connect_token,
};

const KEY: [u8; 32] = [3u8; 32];

fn pump_until(ctx: &mut NetCtx, mut done: impl FnMut(&NetCtx) -> bool) -> bool {
    for _ in 0..500 {
        ctx.flush();
        ctx.tick();
        if done(ctx) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn ping_ctx(config: ServerConfig) -> (NetCtx, CommandHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut ctx = NetCtx::new();
    let ping = ctx.declare_command(
        "Ping",
        NetRole::Server,
        true,
        TypeDesc::Int,
        Some(TypeDesc::Int),
        Box::new(|_caller, args| args.as_int().map(|v| Value::Int(v * 2))),
    );
    ctx.start_server("127.0.0.1:0".parse().unwrap(), &KEY, config)
        .unwrap();
    (ctx, ping)
}

#[test]
fn token_connect_and_command_round_trip() {
    let (mut ctx, ping) = ping_ctx(ServerConfig::default());
    let addr = ctx.server().unwrap().local_addr();

    let token =
        generate_connect_token(77, &addr.to_string(), &[], &KEY, DEFAULT_TOKEN_LIFETIME).unwrap();
    let index = ctx.connect(addr, token).unwrap();

    assert!(pump_until(&mut ctx, |ctx| {
        ctx.client_state(index) == Some(ClientState::Connected)
    }));
    let id = ctx.client_id(index).unwrap();
    assert!(ctx.server().unwrap().is_valid(id));
    assert_eq!(ctx.server().unwrap().user_id(id), Some(77));

    // Commands cannot be addressed until the manifest lands; keep pumping
    // and retrying the send until it is accepted.
    let reply = Rc::new(RefCell::new(None));
    let mut query = 0;
    for _ in 0..500 {
        let sink = reply.clone();
        match ctx.send_server_command(
            index,
            Call::new(ping, Value::Int(21)).with_reply(move |r| *sink.borrow_mut() = Some(r)),
        ) {
            Ok(q) => {
                query = q;
                break;
            }
            Err(_) => {
                ctx.flush();
                ctx.tick();
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
    assert_ne!(query, 0);

    assert!(pump_until(&mut ctx, |_| reply.borrow().is_some()));
    assert_eq!(
        *reply.borrow(),
        Some(CallReply::Value(Some(Value::Int(42))))
    );
}

/// Runs one scripted session and records every client-side observation in
/// order. Networked and loopback runs must record the same sequence.
fn run_scenario(networked: bool) -> Vec<String> {
    let (mut ctx, ping) = ping_ctx(ServerConfig::default());
    let observed = Rc::new(RefCell::new(Vec::new()));

    let sink = observed.clone();
    ctx.client_events.on_connected =
        Some(Box::new(move |_, _| sink.borrow_mut().push("connected".to_owned())));
    let sink = observed.clone();
    ctx.client_events.on_disconnected =
        Some(Box::new(move |_| sink.borrow_mut().push("disconnected".to_owned())));
    let sink = observed.clone();
    ctx.client_events.on_new_object = Some(Box::new(move |_, object, data| {
        sink.borrow_mut()
            .push(format!("create {} {}", object.0, data.position.x));
    }));
    let sink = observed.clone();
    ctx.client_events.on_object_updated = Some(Box::new(move |_, object, data| {
        sink.borrow_mut()
            .push(format!("update {} {}", object.0, data.position.x));
    }));

    let index = if networked {
        let addr = ctx.server().unwrap().local_addr();
        let token =
            generate_connect_token(1, &addr.to_string(), &[], &KEY, DEFAULT_TOKEN_LIFETIME)
                .unwrap();
        ctx.connect(addr, token).unwrap()
    } else {
        ctx.connect_loopback().unwrap()
    };
    assert!(pump_until(&mut ctx, |ctx| {
        ctx.client_state(index) == Some(ClientState::Connected)
    }));

    let sink = observed.clone();
    let mut sent = false;
    for _ in 0..500 {
        let sink = sink.clone();
        let call = Call::new(ping, Value::Int(41)).with_reply(move |reply| {
            if let CallReply::Value(Some(Value::Int(v))) = reply {
                sink.borrow_mut().push(format!("reply {}", v));
            }
        });
        if ctx.send_server_command(index, call).is_ok() {
            sent = true;
            break;
        }
        ctx.flush();
        ctx.tick();
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(sent);
    assert!(pump_until(&mut ctx, |_| {
        observed.borrow().iter().any(|e| e.starts_with("reply"))
    }));

    let id = ctx.client_id(index).unwrap();
    let mut data = ClientData {
        position: Vec3::new(1.0, 0.0, 0.0),
        ..ClientData::default()
    };
    ctx.create_object(id, ObjectId(7), data).unwrap();
    data.position.x = 2.0;
    ctx.update_object(id, ObjectId(7), data).unwrap();
    assert!(pump_until(&mut ctx, |_| observed.borrow().len() >= 4));

    ctx.disconnect(index).unwrap();
    let observed = observed.borrow();
    observed.clone()
}

#[test]
fn networked_matches_loopback_event_sequence() {
    let networked = run_scenario(true);
    let loopback = run_scenario(false);
    assert_eq!(networked, loopback);
    assert_eq!(
        networked,
        vec![
            "connected",
            "reply 82",
            "create 7 1",
            "update 7 2",
            "disconnected",
        ]
    );
}

#[test]
fn bad_token_is_denied() {
    let (mut ctx, _) = ping_ctx(ServerConfig::default());
    let addr = ctx.server().unwrap().local_addr();

    let other_key = [9u8; 32];
    let token =
        generate_connect_token(1, &addr.to_string(), &[], &other_key, DEFAULT_TOKEN_LIFETIME)
            .unwrap();
    let index = ctx.connect(addr, token).unwrap();

    // The denial disconnects the client, which is then reaped.
    assert!(pump_until(&mut ctx, |ctx| ctx.client_state(index).is_none()));
    assert_eq!(ctx.server().unwrap().client_count(), 0);
}

#[test]
fn lossy_link_still_delivers_reliably() {
    let _ = env_logger::builder().is_test(true).try_init();
    let lossy = PacketLossSimulation {
        enabled: true,
        loss_percent: 25.0,
    };

    let registry = Rc::new(RefCell::new(CommandRegistry::new()));
    let ping = registry.borrow_mut().declare(
        "Ping",
        NetRole::Server,
        true,
        TypeDesc::Int,
        Some(TypeDesc::Int),
        Box::new(|_caller, args| args.as_int().map(|v| Value::Int(v * 2))),
    );
    let mut server = Server::start(
        Rc::clone(&registry),
        "127.0.0.1:0",
        &KEY,
        ServerConfig {
            loss_sim: lossy.clone(),
            ..ServerConfig::default()
        },
    )
    .unwrap();
    let addr = server.local_addr();

    let token =
        generate_connect_token(9, &addr.to_string(), &[], &KEY, DEFAULT_TOKEN_LIFETIME).unwrap();
    let mut client = Client::connect(Rc::clone(&registry), 0, addr, token).unwrap();
    client.loss_sim = lossy;

    let mut server_events = ServerEvents::default();
    let mut client_events = ClientEvents::default();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    client_events.on_new_object = Some(Box::new(move |_, object, data| {
        sink.borrow_mut().push(("create", object.0, data.position.x));
    }));
    let sink = seen.clone();
    client_events.on_object_updated = Some(Box::new(move |_, object, data| {
        sink.borrow_mut().push(("update", object.0, data.position.x));
    }));

    let pump = |server: &mut Server,
                client: &mut Client,
                server_events: &mut ServerEvents,
                client_events: &mut ClientEvents,
                done: &mut dyn FnMut(&Client) -> bool|
     -> bool {
        for _ in 0..2000 {
            server.tick(server_events);
            client.tick(client_events);
            server.flush();
            client.flush();
            if done(client) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    };

    // Handshake and manifest both survive the loss.
    assert!(pump(
        &mut server,
        &mut client,
        &mut server_events,
        &mut client_events,
        &mut |c| c.state() == ClientState::Connected && c.has_manifest(),
    ));
    let id = client.client_id().unwrap();

    // A queried reliable command completes despite dropped packets.
    let reply = Rc::new(RefCell::new(None));
    let sink = reply.clone();
    client
        .send_server_command(
            Call::new(ping, Value::Int(21)).with_reply(move |r| *sink.borrow_mut() = Some(r)),
        )
        .unwrap();
    let got_reply = reply.clone();
    assert!(pump(
        &mut server,
        &mut client,
        &mut server_events,
        &mut client_events,
        &mut |_| got_reply.borrow().is_some(),
    ));
    assert_eq!(
        *reply.borrow(),
        Some(CallReply::Value(Some(Value::Int(42))))
    );

    // Create then update arrive in order even when the first send is lost
    // and only a retransmit gets through.
    let mut data = ClientData {
        position: Vec3::new(1.0, 0.0, 0.0),
        ..ClientData::default()
    };
    server.create_object(id, ObjectId(7), data).unwrap();
    data.position.x = 2.0;
    server.update_object(id, ObjectId(7), data).unwrap();
    let counting = seen.clone();
    assert!(pump(
        &mut server,
        &mut client,
        &mut server_events,
        &mut client_events,
        &mut |_| counting.borrow().len() >= 2,
    ));
    assert_eq!(*seen.borrow(), vec![("create", 7, 1.0), ("update", 7, 2.0)]);
}

#[test]
fn full_server_denies_the_next_client() {
    let (mut ctx, _) = ping_ctx(ServerConfig {
        max_clients: 1,
        ..ServerConfig::default()
    });
    let addr = ctx.server().unwrap().local_addr();

    let token = |user| {
        generate_connect_token(user, &addr.to_string(), &[], &KEY, DEFAULT_TOKEN_LIFETIME).unwrap()
    };
    let first = ctx.connect(addr, token(1)).unwrap();
    assert!(pump_until(&mut ctx, |ctx| {
        ctx.client_state(first) == Some(ClientState::Connected)
    }));

    let second = ctx.connect(addr, token(2)).unwrap();
    assert!(pump_until(&mut ctx, |ctx| ctx.client_state(second).is_none()));
    assert_eq!(ctx.server().unwrap().client_count(), 1);
    assert_eq!(ctx.client_state(first), Some(ClientState::Connected));
}
