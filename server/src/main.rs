use clap::Parser;
use log::{info, warn};
use server::errors::RoomError;
use server::registry::RoomRegistry;
use server::room::{RoomContext, RoomHandler};
use server::session::SessionId;
use server::transport;
use shared::{FieldType, FloatWidth, Schema, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Per-player horizontal drift per millisecond of simulated time.
const DRIFT_PER_MS: f64 = 0.0001;

/// Demo room: a map of players drifting right, a chat feed, and a turn
/// marker rotating through the players once a second.
struct DemoRoom {
    tick: Duration,
}

impl DemoRoom {
    const PLAYERS: u8 = 0;
    const MESSAGES: u8 = 1;
    const TURN: u8 = 2;

    fn schema() -> Result<Arc<Schema>, RoomError> {
        let mut player = Schema::new();
        player
            .define_field("x", FieldType::Float(FloatWidth::F64), 0)
            .map_err(|e| RoomError::Creation(e.to_string()))?;
        player
            .define_field("y", FieldType::Float(FloatWidth::F64), 1)
            .map_err(|e| RoomError::Creation(e.to_string()))?;

        let mut message = Schema::new();
        message
            .define_field("message", FieldType::String, 0)
            .map_err(|e| RoomError::Creation(e.to_string()))?;

        let mut root = Schema::new();
        root.define_field(
            "players",
            FieldType::Map(Box::new(FieldType::Object(Arc::new(player)))),
            Self::PLAYERS,
        )
        .map_err(|e| RoomError::Creation(e.to_string()))?;
        root.define_field(
            "messages",
            FieldType::Seq(Box::new(FieldType::Object(Arc::new(message)))),
            Self::MESSAGES,
        )
        .map_err(|e| RoomError::Creation(e.to_string()))?;
        root.define_field("turn", FieldType::String, Self::TURN)
            .map_err(|e| RoomError::Creation(e.to_string()))?;
        Ok(Arc::new(root))
    }
}

impl RoomHandler for DemoRoom {
    fn on_create(&mut self, ctx: &mut RoomContext, _options: &[u8]) -> Result<(), RoomError> {
        ctx.init_state(Self::schema()?);
        ctx.set_metadata("game", "demo");
        ctx.set_dispose_grace(Duration::from_secs(5));
        ctx.set_simulation_interval(self.tick);

        ctx.on_message("type1", |_ctx: &mut RoomContext, sid: &SessionId, payload: &[u8]| {
            info!(
                "type1 from {}: {}",
                sid,
                String::from_utf8_lossy(payload)
            );
        });

        // anything else lands in the chat feed and is echoed to the others
        ctx.on_any_message(|ctx: &mut RoomContext, sid, key, payload| {
            let root = ctx.root();
            let feed = match ctx.state.ensure_child(root, DemoRoom::MESSAGES) {
                Ok(feed) => feed,
                Err(e) => {
                    warn!("chat feed unavailable: {}", e);
                    return;
                }
            };
            if let Ok(entry) = ctx.state.seq_push_child(feed) {
                let text = String::from_utf8_lossy(payload).into_owned();
                let _ = ctx.state.set(entry, 0, Value::Str(text));
            }
            ctx.broadcast(key.clone(), payload, Some(sid));
        });

        ctx.set_interval(Duration::from_secs(1), |ctx: &mut RoomContext| {
            let root = ctx.root();
            let Some(players) = ctx.state.child(root, DemoRoom::PLAYERS) else {
                return;
            };
            let keys = ctx.state.map_keys(players);
            if keys.is_empty() {
                return;
            }
            let current = match ctx.state.get(root, DemoRoom::TURN) {
                Some(Value::Str(s)) => s,
                _ => String::new(),
            };
            let next = keys
                .iter()
                .position(|k| *k == current)
                .map(|i| (i + 1) % keys.len())
                .unwrap_or(0);
            let _ = ctx.state.set(root, DemoRoom::TURN, Value::Str(keys[next].clone()));
        });
        Ok(())
    }

    fn on_join(&mut self, ctx: &mut RoomContext, session_id: &SessionId) {
        let root = ctx.root();
        let spawned = ctx
            .state
            .ensure_child(root, Self::PLAYERS)
            .and_then(|players| ctx.state.map_insert_child(players, session_id.as_str()))
            .and_then(|player| {
                ctx.state.set(player, 0, Value::Float(0.0))?;
                ctx.state.set(player, 1, Value::Float(0.0))
            });
        if let Err(e) = spawned {
            warn!("failed to spawn player {}: {}", session_id, e);
        }
    }

    fn on_leave(&mut self, ctx: &mut RoomContext, session_id: &SessionId, consented: bool) {
        info!("{} left (consented: {})", session_id, consented);
        let root = ctx.root();
        if let Some(players) = ctx.state.child(root, Self::PLAYERS) {
            let _ = ctx.state.map_remove(players, session_id.as_str());
        }
    }

    fn on_tick(&mut self, ctx: &mut RoomContext, dt: f32) -> Result<(), RoomError> {
        let root = ctx.root();
        let Some(players) = ctx.state.child(root, Self::PLAYERS) else {
            return Ok(());
        };
        let drift = f64::from(dt) * 1000.0 * DRIFT_PER_MS;
        for key in ctx.state.map_keys(players) {
            if let Some(player) = ctx.state.map_child(players, &key) {
                let x = match ctx.state.get(player, 0) {
                    Some(Value::Float(x)) => x,
                    _ => 0.0,
                };
                ctx.state.set(player, 0, Value::Float(x + drift))?;
            }
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Simulation tick rate (updates per second)
        #[clap(short, long, default_value = "20")]
        tick_rate: u32,
    }

    env_logger::init();
    let args = Args::parse();

    let tick = Duration::from_secs_f64(1.0 / f64::from(args.tick_rate.max(1)));
    let registry = RoomRegistry::new();
    registry
        .define("demo", move || {
            Box::new(DemoRoom { tick }) as Box<dyn RoomHandler>
        })
        .await;

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address).await?;

    tokio::select! {
        result = transport::serve(listener, Arc::clone(&registry)) => {
            if let Err(e) = result {
                eprintln!("transport failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            registry.dispose_all().await;
        }
    }

    Ok(())
}
