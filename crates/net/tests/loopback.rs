//! End-to-end tests over in-process loopback pipes: no sockets, no time
//! dependence, every packet still serialized.

use std::cell::RefCell;
use std::rc::Rc;

use glam::Vec3;
use tether::{
    Call, CallReply, ClientData, ClientState, NetCtx, NetError, NetRole, ObjectId,
    ServerConfig, ServerDispatcher, TypeDesc, Value,
};

const KEY: [u8; 32] = [7u8; 32];

fn pump(ctx: &mut NetCtx, rounds: usize) {
    for _ in 0..rounds {
        ctx.flush();
        ctx.tick();
    }
}

fn serve(ctx: &mut NetCtx) {
    ctx.start_server(
        "127.0.0.1:0".parse().unwrap(),
        &KEY,
        ServerConfig::default(),
    )
    .unwrap();
}

#[test]
fn loopback_command_round_trip() {
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
    serve(&mut ctx);
    let index = ctx.connect_loopback().unwrap();
    assert_eq!(ctx.client_state(index), Some(ClientState::Connected));

    // The manifest has not arrived yet, so commands cannot be addressed.
    let premature = ctx.send_server_command(index, Call::new(ping, Value::Int(1)));
    assert!(matches!(premature, Err(NetError::NotConnected)));

    pump(&mut ctx, 4);

    let reply = Rc::new(RefCell::new(None));
    let sink = reply.clone();
    let query = ctx
        .send_server_command(
            index,
            Call::new(ping, Value::Int(41)).with_reply(move |r| *sink.borrow_mut() = Some(r)),
        )
        .unwrap();
    assert_ne!(query, 0);

    pump(&mut ctx, 8);
    assert_eq!(
        *reply.borrow(),
        Some(CallReply::Value(Some(Value::Int(82))))
    );
}

#[test]
fn object_create_then_update_arrives_in_order() {
    let mut ctx = NetCtx::new();
    ctx.declare_command(
        "Noop",
        NetRole::Server,
        true,
        TypeDesc::Int,
        None,
        Box::new(|_, _| None),
    );
    serve(&mut ctx);

    let seen = Rc::new(RefCell::new(Vec::new()));
    let created = seen.clone();
    ctx.client_events.on_new_object = Some(Box::new(move |_, object, data| {
        created.borrow_mut().push(("create", object.0, data.position.x));
    }));
    let updated = seen.clone();
    ctx.client_events.on_object_updated = Some(Box::new(move |_, object, data| {
        updated.borrow_mut().push(("update", object.0, data.position.x));
    }));

    let index = ctx.connect_loopback().unwrap();
    let id = ctx.client_id(index).unwrap();

    let mut data = ClientData::default();
    data.position = Vec3::new(1.0, 0.0, 0.0);
    ctx.create_object(id, ObjectId(9), data).unwrap();
    data.position.x = 2.0;
    ctx.update_object(id, ObjectId(9), data).unwrap();

    pump(&mut ctx, 8);
    assert_eq!(
        *seen.borrow(),
        vec![("create", 9, 1.0), ("update", 9, 2.0)]
    );
}

#[test]
fn stale_client_id_is_rejected() {
    let mut ctx = NetCtx::new();
    ctx.declare_command(
        "Noop",
        NetRole::Server,
        true,
        TypeDesc::Int,
        None,
        Box::new(|_, _| None),
    );
    serve(&mut ctx);

    let index = ctx.connect_loopback().unwrap();
    let id = ctx.client_id(index).unwrap();
    assert!(ctx.server().unwrap().is_valid(id));

    ctx.disconnect_client(id).unwrap();
    assert!(!ctx.server().unwrap().is_valid(id));
    assert!(matches!(
        ctx.create_object(id, ObjectId(1), ClientData::default()),
        Err(NetError::InvalidClient)
    ));

    // The disconnect packet reaches the client on the next tick and the
    // local endpoint is released.
    pump(&mut ctx, 2);
    assert_eq!(ctx.client_state(index), None);
}

#[test]
fn dispatcher_snapshots_late_joiners() {
    let mut ctx = NetCtx::new();
    ctx.declare_command(
        "Noop",
        NetRole::Server,
        true,
        TypeDesc::Int,
        None,
        Box::new(|_, _| None),
    );
    serve(&mut ctx);

    let dispatcher = Rc::new(RefCell::new(ServerDispatcher::new()));
    let on_join = dispatcher.clone();
    ctx.server_events.on_client_connected =
        Some(Box::new(move |id| on_join.borrow_mut().register_client(id)));
    let on_leave = dispatcher.clone();
    ctx.server_events.on_client_disconnected =
        Some(Box::new(move |id| on_leave.borrow_mut().unregister_client(id)));

    let seen = Rc::new(RefCell::new(Vec::new()));
    let created = seen.clone();
    ctx.client_events.on_new_object = Some(Box::new(move |index, object, _| {
        created.borrow_mut().push((index, object.0));
    }));

    let first = ctx.connect_loopback().unwrap();
    dispatcher
        .borrow_mut()
        .update_object(ObjectId(3), ClientData::default());
    dispatcher.borrow_mut().flush(ctx.server_mut().unwrap());
    pump(&mut ctx, 4);

    // A client joining after the object exists gets it as a snapshot.
    let second = ctx.connect_loopback().unwrap();
    dispatcher.borrow_mut().flush(ctx.server_mut().unwrap());
    pump(&mut ctx, 4);

    let seen = seen.borrow();
    assert!(seen.contains(&(first, 3)));
    assert!(seen.contains(&(second, 3)));
    assert_eq!(seen.len(), 2);
}
