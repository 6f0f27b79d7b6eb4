//! Single-process walkthrough: a server and a loopback client in one loop,
//! exercising the manifest handshake, a queried command, and object
//! replication end to end.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use glam::Vec3;
use tether::{
    Call, CallReply, ClientData, NetCtx, NetRole, ObjectId, ServerConfig, TypeDesc, Value,
    key_from_secret,
};

fn pump(ctx: &mut NetCtx, rounds: usize) {
    for _ in 0..rounds {
        ctx.flush();
        ctx.tick();
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut ctx = NetCtx::new();
    let ping = ctx.declare_command(
        "Ping",
        NetRole::Server,
        true,
        TypeDesc::Int,
        Some(TypeDesc::Int),
        Box::new(|caller, args| {
            log::info!("ping from caller {}", caller);
            args.as_int().map(|v| Value::Int(v * 2))
        }),
    );

    ctx.client_events.on_new_object = Some(Box::new(|_, object, data| {
        println!("object {} created at {}", object.0, data.position);
    }));
    ctx.client_events.on_object_updated = Some(Box::new(|_, object, data| {
        println!("object {} moved to {}", object.0, data.position);
    }));
    ctx.client_events.on_object_deleted = Some(Box::new(|_, object| {
        println!("object {} deleted", object.0);
    }));

    let key = key_from_secret("demo");
    ctx.start_server(
        "127.0.0.1:0".parse().context("bad demo address")?,
        &key,
        ServerConfig::default(),
    )?;

    let index = ctx.connect_loopback()?;
    let id = ctx.client_id(index).context("loopback connect yielded no id")?;
    pump(&mut ctx, 4);

    let reply = Rc::new(RefCell::new(None));
    let sink = reply.clone();
    ctx.send_server_command(
        index,
        Call::new(ping, Value::Int(41)).with_reply(move |r| *sink.borrow_mut() = Some(r)),
    )?;
    pump(&mut ctx, 8);
    match reply.borrow().as_ref() {
        Some(CallReply::Value(Some(Value::Int(v)))) => println!("ping(41) -> {}", v),
        other => println!("ping(41) -> unexpected reply {:?}", other),
    }

    let mut data = ClientData {
        position: Vec3::new(1.0, 0.0, 0.0),
        ..ClientData::default()
    };
    ctx.create_object(id, ObjectId(7), data)?;
    data.position.x = 2.5;
    ctx.update_object(id, ObjectId(7), data)?;
    ctx.delete_object(id, ObjectId(7))?;
    pump(&mut ctx, 8);

    ctx.disconnect(index)?;
    pump(&mut ctx, 2);
    Ok(())
}
