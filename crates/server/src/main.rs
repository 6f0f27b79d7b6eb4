//! Headless dedicated server. Clients replicate their input through the
//! `SetPlayerInput` command; the server mirrors every player's state back
//! out as a replicated object per client.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use glam::Vec3;
use tether::{
    ClientData, NetCtx, NetRole, ObjectId, ServerConfig, ServerDispatcher, TypeDesc, Value,
    key_from_secret,
};

#[derive(Parser)]
#[command(name = "tether-server", about = "Headless object replication server")]
struct Args {
    /// Address to bind the UDP socket on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(long, default_value_t = tether::DEFAULT_PORT)]
    port: u16,

    #[arg(long, default_value_t = tether::MAX_PLAYERS)]
    max_clients: usize,

    /// Simulation ticks per second.
    #[arg(long, default_value_t = 60)]
    tick_rate: u32,

    /// Shared secret connect tokens are signed with.
    #[arg(long, default_value = "dev-secret")]
    secret: String,
}

fn vec3_field(value: &Value, key: &str) -> Option<Vec3> {
    let v = value.get(key)?;
    Some(Vec3::new(
        v.get("x")?.as_float()?,
        v.get("y")?.as_float()?,
        v.get("z")?.as_float()?,
    ))
}

fn vec3_desc() -> TypeDesc {
    TypeDesc::Struct(vec![
        ("x".into(), TypeDesc::Float),
        ("y".into(), TypeDesc::Float),
        ("z".into(), TypeDesc::Float),
    ])
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut ctx = NetCtx::new();
    let inputs: Rc<RefCell<HashMap<u64, ClientData>>> = Rc::default();

    ctx.declare_command(
        "Ping",
        NetRole::Server,
        true,
        TypeDesc::Int,
        Some(TypeDesc::Int),
        Box::new(|_caller, args| args.as_int().map(|v| Value::Int(v * 2))),
    );

    let staged = inputs.clone();
    ctx.declare_command(
        "SetPlayerInput",
        NetRole::Server,
        false,
        TypeDesc::Struct(vec![
            ("moving".into(), TypeDesc::Bool),
            ("position".into(), vec3_desc()),
            ("direction".into(), vec3_desc()),
        ]),
        None,
        Box::new(move |caller, args| {
            let data = ClientData {
                moving: args.get("moving").and_then(Value::as_bool).unwrap_or(false),
                position: vec3_field(args, "position").unwrap_or(Vec3::ZERO),
                direction: vec3_field(args, "direction").unwrap_or(Vec3::Z),
            };
            staged.borrow_mut().insert(caller, data);
            None
        }),
    );

    let dispatcher = Rc::new(RefCell::new(ServerDispatcher::new()));
    let on_join = dispatcher.clone();
    ctx.server_events.on_client_connected = Some(Box::new(move |id| {
        log::info!("player {} joined", id);
        let mut dispatcher = on_join.borrow_mut();
        dispatcher.register_client(id);
        dispatcher.update_object(ObjectId(id.0), ClientData::default());
    }));
    let on_leave = dispatcher.clone();
    ctx.server_events.on_client_disconnected = Some(Box::new(move |id| {
        log::info!("player {} left", id);
        let mut dispatcher = on_leave.borrow_mut();
        dispatcher.unregister_client(id);
        dispatcher.delete_object(ObjectId(id.0));
    }));

    let key = key_from_secret(&args.secret);
    let addr = format!("{}:{}", args.bind, args.port)
        .parse()
        .context("invalid bind address")?;
    ctx.start_server(
        addr,
        &key,
        ServerConfig {
            max_clients: args.max_clients,
            ..ServerConfig::default()
        },
    )
    .context("server startup failed")?;

    let tick = Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64);
    loop {
        let frame = Instant::now();

        ctx.tick();
        for (caller, data) in inputs.borrow_mut().drain() {
            dispatcher.borrow_mut().update_object(ObjectId(caller), data);
        }
        if let Some(server) = ctx.server_mut() {
            dispatcher.borrow_mut().flush(server);
        }
        ctx.flush();

        if let Some(rest) = tick.checked_sub(frame.elapsed()) {
            std::thread::sleep(rest);
        }
    }
}
