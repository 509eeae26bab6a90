//! Room lifecycle controller
//!
//! Each room is one tokio task owning all of its state: the state tree,
//! the session registry, the router and the clock. The task serializes
//! every mutation (tick, timers, message handlers, join/leave) onto its
//! own event loop, so room logic never needs a lock. The only operation
//! allowed to suspend without stalling the loop is authentication during
//! join: the auth future runs on a spawned task and re-enters the loop as
//! a resolved-join event, in whatever order pending joins complete.
//!
//! Lifecycle: `Creating -> Active -> Disposing -> Disposed`. A failed
//! `on_create` never activates the room. Disposal cancels every timer,
//! drops every session and discards auth completions that arrive late.

use log::{error, info, warn};
use shared::protocol::{decode_client_packet, ClientPacket, ServerPacket};
use shared::{MessageKey, Schema, StateTree};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::clock::{Clock, TimerCallback, TimerId};
use crate::errors::{AuthError, RoomError, SessionError};
use crate::router::{MessageHandler, MessageRouter, WildcardHandler};
use crate::session::{Session, SessionId, SessionRegistry};

/// Result of the authentication collaborator: an opaque principal, or
/// `None` for an anonymous accept.
pub type AuthFuture = Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>, AuthError>> + Send>>;

/// Consecutive tick failures before the room gives up and disposes.
pub const MAX_CONSECUTIVE_TICK_ERRORS: u32 = 3;

/// Upper bound on the dt handed to `on_tick` after a stall.
const MAX_TICK_DELTA: f32 = 0.25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomPhase {
    Creating,
    Active,
    Disposing,
    Disposed,
}

/// Game logic of one room type. All callbacks except `on_auth` run on the
/// room task and may freely mutate the context.
pub trait RoomHandler: Send + 'static {
    /// Initializes state (via [`RoomContext::init_state`]) and registers
    /// message routes and timers. Failure aborts the room before it ever
    /// accepts a join.
    fn on_create(&mut self, ctx: &mut RoomContext, options: &[u8]) -> Result<(), RoomError>;

    /// Authenticates a joining client. The returned future runs off the
    /// room task; the room keeps ticking while it is pending.
    fn on_auth(&mut self, options: &[u8]) -> AuthFuture {
        let _ = options;
        Box::pin(async { Ok(None) })
    }

    /// Admission policy, evaluated after authentication succeeds.
    fn request_join(&mut self, ctx: &mut RoomContext, options: &[u8]) -> bool {
        let _ = (ctx, options);
        true
    }

    fn on_join(&mut self, ctx: &mut RoomContext, session_id: &SessionId) {
        let _ = (ctx, session_id);
    }

    /// `consented` is true for a voluntary leave, false for an abrupt
    /// disconnect or forced removal.
    fn on_leave(&mut self, ctx: &mut RoomContext, session_id: &SessionId, consented: bool) {
        let _ = (ctx, session_id, consented);
    }

    /// Fixed-rate simulation step. Errors are caught per tick; repeated
    /// failures escalate to disposal.
    fn on_tick(&mut self, ctx: &mut RoomContext, dt: f32) -> Result<(), RoomError> {
        let _ = (ctx, dt);
        Ok(())
    }

    fn on_dispose(&mut self, ctx: &mut RoomContext) {
        let _ = ctx;
    }
}

/// Entry points the process boundary uses to drive a room.
pub enum RoomCommand {
    Join {
        /// Caller-chosen id, or `None` to have the room generate one.
        session_id: Option<String>,
        options: Vec<u8>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<Result<SessionId, RoomError>>,
    },
    Message {
        session_id: SessionId,
        bytes: Vec<u8>,
    },
    Leave {
        session_id: SessionId,
        consented: bool,
    },
    Dispose,
    Metadata {
        reply: oneshot::Sender<HashMap<String, String>>,
    },
}

/// A join whose authentication future has completed.
struct ResolvedJoin {
    session_id: Option<String>,
    options: Vec<u8>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reply: oneshot::Sender<Result<SessionId, RoomError>>,
    result: Result<Option<Vec<u8>>, AuthError>,
}

/// Registrations queued by handlers and applied by the room loop after
/// the handler returns; keeps callbacks free to borrow the context
/// without aliasing the router or clock they are stored in.
enum DeferredOp {
    Route(MessageKey, MessageHandler),
    AnyRoute(WildcardHandler),
    Timer {
        id: TimerId,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCallback,
    },
    ClearTimer(TimerId),
    SimulationPeriod(Duration),
    Kick(SessionId, String),
}

/// Everything a room handler can see and touch.
pub struct RoomContext {
    /// Authoritative state; exclusively owned by this room.
    pub state: StateTree,
    pub(crate) sessions: SessionRegistry,
    room_id: String,
    phase: RoomPhase,
    metadata: HashMap<String, String>,
    auto_dispose: bool,
    dispose_grace: Duration,
    dispose_requested: bool,
    next_timer_id: u64,
    deferred: Vec<DeferredOp>,
}

impl RoomContext {
    fn new(room_id: String) -> Self {
        Self {
            state: StateTree::new(Arc::new(Schema::new())),
            sessions: SessionRegistry::new(),
            room_id,
            phase: RoomPhase::Creating,
            metadata: HashMap::new(),
            auto_dispose: true,
            dispose_grace: Duration::ZERO,
            dispose_requested: false,
            next_timer_id: 1,
            deferred: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    /// Replaces the state tree with a fresh one for `schema`. Normally
    /// called once from `on_create`.
    pub fn init_state(&mut self, schema: Arc<Schema>) {
        self.state = StateTree::new(schema);
    }

    pub fn root(&self) -> shared::NodeId {
        self.state.root()
    }

    /// Registers a handler for an exact message key. Registering the same
    /// key again replaces the previous handler.
    pub fn on_message<F>(&mut self, key: impl Into<MessageKey>, handler: F)
    where
        F: FnMut(&mut RoomContext, &SessionId, &[u8]) + Send + 'static,
    {
        self.deferred
            .push(DeferredOp::Route(key.into(), Box::new(handler)));
    }

    /// Registers the wildcard handler, invoked with the key for any
    /// message without a dedicated handler.
    pub fn on_any_message<F>(&mut self, handler: F)
    where
        F: FnMut(&mut RoomContext, &SessionId, &MessageKey, &[u8]) + Send + 'static,
    {
        self.deferred.push(DeferredOp::AnyRoute(Box::new(handler)));
    }

    pub fn set_interval<F>(&mut self, period: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut RoomContext) + Send + 'static,
    {
        let id = self.alloc_timer_id();
        self.deferred.push(DeferredOp::Timer {
            id,
            delay: period,
            period: Some(period),
            callback: Box::new(callback),
        });
        id
    }

    pub fn set_timeout<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut RoomContext) + Send + 'static,
    {
        let id = self.alloc_timer_id();
        self.deferred.push(DeferredOp::Timer {
            id,
            delay,
            period: None,
            callback: Box::new(callback),
        });
        id
    }

    pub fn clear_timer(&mut self, id: TimerId) {
        self.deferred.push(DeferredOp::ClearTimer(id));
    }

    /// Adjusts the cadence of the simulation tick (and therefore of the
    /// patch flush that follows each tick).
    pub fn set_simulation_interval(&mut self, period: Duration) {
        self.deferred.push(DeferredOp::SimulationPeriod(period));
    }

    pub(crate) fn alloc_timer_id(&mut self) -> TimerId {
        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        id
    }

    /// Attaches discovery metadata. Writable only while the room is being
    /// created; read-only afterwards.
    pub fn set_metadata(&mut self, key: &str, value: &str) {
        if self.phase != RoomPhase::Creating {
            warn!(
                "room {}: metadata is read-only after creation, ignoring `{}`",
                self.room_id, key
            );
            return;
        }
        self.metadata.insert(key.to_string(), value.to_string());
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Whether the room disposes itself once the last session leaves.
    pub fn set_auto_dispose(&mut self, auto_dispose: bool) {
        self.auto_dispose = auto_dispose;
    }

    /// Delay between the last leave and disposal; a join during the grace
    /// window keeps the room alive.
    pub fn set_dispose_grace(&mut self, grace: Duration) {
        self.dispose_grace = grace;
    }

    /// Requests disposal; takes effect when the current handler returns.
    pub fn dispose(&mut self) {
        self.dispose_requested = true;
    }

    /// Sends an application message to one session.
    pub fn send(
        &self,
        session_id: &SessionId,
        key: impl Into<MessageKey>,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        self.sessions.send(
            session_id,
            &ServerPacket::Message {
                key: key.into(),
                payload: payload.to_vec(),
            },
        )
    }

    /// Broadcasts an application message to every session except
    /// `except`, against the membership at call time.
    pub fn broadcast(&self, key: impl Into<MessageKey>, payload: &[u8], except: Option<&SessionId>) {
        self.sessions.broadcast(
            &ServerPacket::Message {
                key: key.into(),
                payload: payload.to_vec(),
            },
            except,
        );
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.ids()
    }

    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.contains(session_id)
    }

    pub fn principal(&self, session_id: &SessionId) -> Option<&[u8]> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.principal.as_deref())
    }

    /// Sessions with no inbound traffic within `timeout`; pair with
    /// [`kick`](Self::kick) to drop unresponsive clients.
    pub fn stale_sessions(&self, timeout: Duration) -> Vec<SessionId> {
        self.sessions.stale(timeout)
    }

    /// Forcibly removes a session: it receives a kick packet and
    /// `on_leave` runs with `consented = false`.
    pub fn kick(&mut self, session_id: &SessionId, reason: &str) {
        self.deferred
            .push(DeferredOp::Kick(session_id.clone(), reason.to_string()));
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new("test-room".to_string())
    }
}

pub(crate) struct Room {
    ctx: RoomContext,
    handler: Box<dyn RoomHandler>,
    router: MessageRouter,
    clock: Clock,
    inbox: mpsc::UnboundedReceiver<RoomCommand>,
    auth_tx: mpsc::UnboundedSender<ResolvedJoin>,
    auth_rx: mpsc::UnboundedReceiver<ResolvedJoin>,
    closed: mpsc::UnboundedSender<String>,
    sim_period: Duration,
    pending_sim_period: Option<Duration>,
    tick_errors: u32,
    dispose_timer: Option<TimerId>,
}

/// Spawns the room task. The returned receiver resolves once `on_create`
/// finished: `Ok` when the room went active, `Err` when creation failed
/// and the task already exited.
pub(crate) fn spawn_room(
    room_id: String,
    handler: Box<dyn RoomHandler>,
    options: Vec<u8>,
    closed: mpsc::UnboundedSender<String>,
) -> (
    mpsc::UnboundedSender<RoomCommand>,
    oneshot::Receiver<Result<(), RoomError>>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (created_tx, created_rx) = oneshot::channel();
    let (auth_tx, auth_rx) = mpsc::unbounded_channel();

    let room = Room {
        ctx: RoomContext::new(room_id),
        handler,
        router: MessageRouter::new(),
        clock: Clock::new(),
        inbox: cmd_rx,
        auth_tx,
        auth_rx,
        closed,
        sim_period: Duration::from_millis(shared::DEFAULT_TICK_MS),
        pending_sim_period: None,
        tick_errors: 0,
        dispose_timer: None,
    };
    tokio::spawn(room.run(options, created_tx));
    (cmd_tx, created_rx)
}

impl Room {
    async fn run(mut self, options: Vec<u8>, created: oneshot::Sender<Result<(), RoomError>>) {
        match self.handler.on_create(&mut self.ctx, &options) {
            Ok(()) => {
                self.ctx.phase = RoomPhase::Active;
                self.absorb_deferred();
                // State built during creation is the baseline every
                // snapshot starts from, not a pending delta.
                self.ctx.state.clear_dirty();
                info!("room {} is active", self.ctx.room_id);
                let _ = created.send(Ok(()));
            }
            Err(e) => {
                error!("room {}: creation failed: {}", self.ctx.room_id, e);
                let _ = created.send(Err(RoomError::Creation(e.to_string())));
                let _ = self.closed.send(self.ctx.room_id.clone());
                return;
            }
        }

        let mut sim = interval(self.sim_period);
        sim.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a fresh interval completes immediately.
        sim.tick().await;
        let mut last_tick = Instant::now();

        loop {
            if let Some(period) = self.pending_sim_period.take() {
                self.sim_period = period;
                sim = interval(period);
                sim.set_missed_tick_behavior(MissedTickBehavior::Skip);
                sim.tick().await;
                last_tick = Instant::now();
            }
            if self.ctx.dispose_requested {
                self.dispose();
                break;
            }

            let next_timer = self.clock.next_deadline();
            tokio::select! {
                cmd = self.inbox.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    // every handle dropped: nobody can reach the room anymore
                    None => self.ctx.dispose_requested = true,
                },
                Some(resolved) = self.auth_rx.recv() => self.finish_join(resolved),
                _ = sim.tick() => {
                    let now = Instant::now();
                    let dt = (now - last_tick).as_secs_f32().min(MAX_TICK_DELTA);
                    last_tick = now;
                    self.run_tick(dt);
                },
                _ = sleep_until(next_timer.unwrap_or_else(Instant::now)), if next_timer.is_some() => {
                    self.fire_timers();
                },
            }

            self.absorb_deferred();
            self.flush_patches();
        }
    }

    /// Applies registrations queued by handler callbacks. Loops because a
    /// kick runs `on_leave`, which may queue more.
    fn absorb_deferred(&mut self) {
        while !self.ctx.deferred.is_empty() {
            let ops: Vec<DeferredOp> = self.ctx.deferred.drain(..).collect();
            for op in ops {
                match op {
                    DeferredOp::Route(key, handler) => self.router.on(key, handler),
                    DeferredOp::AnyRoute(handler) => self.router.on_any(handler),
                    DeferredOp::Timer {
                        id,
                        delay,
                        period,
                        callback,
                    } => self.clock.insert(id, Instant::now() + delay, period, callback),
                    DeferredOp::ClearTimer(id) => {
                        self.clock.clear(id);
                    }
                    DeferredOp::SimulationPeriod(period) => {
                        self.pending_sim_period = Some(period);
                    }
                    DeferredOp::Kick(session_id, reason) => {
                        let _ = self
                            .ctx
                            .sessions
                            .send(&session_id, &ServerPacket::Kick { reason });
                        self.handle_leave(&session_id, false);
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                session_id,
                options,
                outbound,
                reply,
            } => self.begin_join(session_id, options, outbound, reply),
            RoomCommand::Message { session_id, bytes } => self.handle_message(session_id, &bytes),
            RoomCommand::Leave {
                session_id,
                consented,
            } => self.handle_leave(&session_id, consented),
            RoomCommand::Dispose => self.ctx.dispose_requested = true,
            RoomCommand::Metadata { reply } => {
                let _ = reply.send(self.ctx.metadata.clone());
            }
        }
    }

    /// Starts a join: the auth future runs on its own task so a slow
    /// authentication provider never stalls this room or other joins.
    fn begin_join(
        &mut self,
        session_id: Option<String>,
        options: Vec<u8>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<Result<SessionId, RoomError>>,
    ) {
        if self.ctx.phase != RoomPhase::Active {
            let _ = reply.send(Err(RoomError::NotActive));
            return;
        }
        let auth = self.handler.on_auth(&options);
        let auth_tx = self.auth_tx.clone();
        tokio::spawn(async move {
            let result = auth.await;
            // A disposed room has dropped the receiver; the completion is
            // discarded here instead of being applied to a dead room.
            let _ = auth_tx.send(ResolvedJoin {
                session_id,
                options,
                outbound,
                reply,
                result,
            });
        });
    }

    fn finish_join(&mut self, resolved: ResolvedJoin) {
        let ResolvedJoin {
            session_id,
            options,
            outbound,
            reply,
            result,
        } = resolved;

        if self.ctx.phase != RoomPhase::Active {
            warn!(
                "room {}: discarding auth completion for a non-active room",
                self.ctx.room_id
            );
            let _ = reply.send(Err(RoomError::NotActive));
            return;
        }
        let principal = match result {
            Ok(principal) => principal,
            Err(e) => {
                let _ = reply.send(Err(RoomError::Auth(e.to_string())));
                return;
            }
        };
        if !self.handler.request_join(&mut self.ctx, &options) {
            let _ = reply.send(Err(RoomError::JoinRejected));
            return;
        }

        let sid = session_id
            .map(SessionId::from)
            .unwrap_or_else(SessionId::generate);
        if self.ctx.sessions.contains(&sid) {
            let _ = reply.send(Err(SessionError::Duplicate(sid).into()));
            return;
        }

        // Ship pending changes to current members first, so the snapshot
        // below is a clean synchronization point.
        self.flush_patches();

        if let Err(e) = self.ctx.sessions.add(Session::new(sid.clone(), principal, outbound)) {
            let _ = reply.send(Err(e.into()));
            return;
        }
        if let Some(timer) = self.dispose_timer.take() {
            self.clock.clear(timer);
        }

        let _ = self.ctx.sessions.send(
            &sid,
            &ServerPacket::Welcome {
                session_id: sid.to_string(),
            },
        );
        match shared::encode_full(&self.ctx.state) {
            Ok(frame) => {
                let _ = self.ctx.sessions.send(&sid, &ServerPacket::Sync { frame });
            }
            Err(e) => error!("room {}: snapshot encode failed: {}", self.ctx.room_id, e),
        }

        self.handler.on_join(&mut self.ctx, &sid);
        info!("room {}: session {} joined", self.ctx.room_id, sid);
        let _ = reply.send(Ok(sid));
    }

    fn handle_message(&mut self, session_id: SessionId, bytes: &[u8]) {
        if !self.ctx.sessions.contains(&session_id) {
            warn!(
                "room {}: message from unknown session {}",
                self.ctx.room_id, session_id
            );
            return;
        }
        self.ctx.sessions.mark_seen(&session_id);
        match decode_client_packet(bytes) {
            Ok(ClientPacket::AppMessage { key, payload }) => {
                self.router
                    .dispatch(&mut self.ctx, &session_id, &key, &payload);
            }
            Ok(ClientPacket::Leave) => self.handle_leave(&session_id, true),
            Ok(ClientPacket::Join { .. }) => warn!(
                "room {}: join packet from already-joined session {}",
                self.ctx.room_id, session_id
            ),
            Err(e) => warn!(
                "room {}: undecodable packet from {}: {}",
                self.ctx.room_id, session_id, e
            ),
        }
    }

    fn handle_leave(&mut self, session_id: &SessionId, consented: bool) {
        if !self.ctx.sessions.contains(session_id) {
            return;
        }
        self.handler.on_leave(&mut self.ctx, session_id, consented);
        self.ctx.sessions.remove(session_id);
        info!(
            "room {}: session {} left (consented: {})",
            self.ctx.room_id, session_id, consented
        );

        if self.ctx.sessions.is_empty()
            && self.ctx.auto_dispose
            && self.ctx.phase == RoomPhase::Active
        {
            if self.ctx.dispose_grace.is_zero() {
                self.ctx.dispose_requested = true;
            } else if self.dispose_timer.is_none() {
                let id = self.ctx.alloc_timer_id();
                self.clock.insert(
                    id,
                    Instant::now() + self.ctx.dispose_grace,
                    None,
                    Box::new(|ctx| ctx.dispose()),
                );
                self.dispose_timer = Some(id);
            }
        }
    }

    fn run_tick(&mut self, dt: f32) {
        if let Err(e) = self.handler.on_tick(&mut self.ctx, dt) {
            self.tick_errors += 1;
            error!(
                "room {}: tick failed ({} consecutive): {}",
                self.ctx.room_id, self.tick_errors, e
            );
            if self.tick_errors >= MAX_CONSECUTIVE_TICK_ERRORS {
                warn!(
                    "room {}: {} consecutive tick failures, disposing",
                    self.ctx.room_id, self.tick_errors
                );
                self.ctx.dispose_requested = true;
            }
        } else {
            self.tick_errors = 0;
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        for mut fired in self.clock.take_due(now) {
            (fired.callback)(&mut self.ctx);
            if self.dispose_timer == Some(fired.id) {
                self.dispose_timer = None;
                continue;
            }
            self.clock.rearm(fired, now);
        }
    }

    /// Encodes the dirty paths once and broadcasts them; no-op when
    /// nothing changed since the last flush.
    fn flush_patches(&mut self) {
        if !self.ctx.state.is_dirty() {
            return;
        }
        match shared::flush(&mut self.ctx.state) {
            Ok(frame) if !frame.is_empty() => {
                self.ctx.sessions.broadcast(&ServerPacket::Sync { frame }, None);
            }
            Ok(_) => {}
            Err(e) => error!("room {}: delta encode failed: {}", self.ctx.room_id, e),
        }
    }

    fn dispose(&mut self) {
        if self.ctx.phase == RoomPhase::Disposed {
            return;
        }
        self.ctx.phase = RoomPhase::Disposing;
        info!("room {} disposing", self.ctx.room_id);
        self.clock.clear_all();
        self.dispose_timer = None;

        for sid in self.ctx.sessions.ids() {
            let _ = self.ctx.sessions.send(
                &sid,
                &ServerPacket::Kick {
                    reason: "room disposed".to_string(),
                },
            );
            self.handler.on_leave(&mut self.ctx, &sid, false);
            self.ctx.sessions.remove(&sid);
        }

        self.handler.on_dispose(&mut self.ctx);
        // Anything queued during teardown must not outlive the room.
        self.clock.clear_all();
        self.ctx.deferred.clear();
        self.ctx.phase = RoomPhase::Disposed;
        let _ = self.closed.send(self.ctx.room_id.clone());
        info!("room {} disposed", self.ctx.room_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::decode_server_packet;
    use shared::{FieldType, IntWidth, SyncFrame, Value};
    use std::sync::Mutex;

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct ProbeRoom {
        events: EventLog,
        fail_create: bool,
    }

    impl ProbeRoom {
        fn new(events: EventLog) -> Self {
            Self {
                events,
                fail_create: false,
            }
        }

        fn log(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    impl RoomHandler for ProbeRoom {
        fn on_create(&mut self, ctx: &mut RoomContext, _options: &[u8]) -> Result<(), RoomError> {
            if self.fail_create {
                return Err(RoomError::Creation("refused".to_string()));
            }
            let mut schema = Schema::new();
            schema
                .define_field("score", FieldType::Int(IntWidth::U32), 0)
                .map_err(|e| RoomError::Creation(e.to_string()))?;
            ctx.init_state(Arc::new(schema));
            ctx.set_metadata("mode", "probe");
            ctx.on_message("boot", |ctx: &mut RoomContext, sid: &SessionId, _payload: &[u8]| {
                let sid = sid.clone();
                ctx.kick(&sid, "booted");
            });
            ctx.on_message("bump", |ctx: &mut RoomContext, _sid: &SessionId, _payload: &[u8]| {
                let root = ctx.root();
                let prev = match ctx.state.get(root, 0) {
                    Some(Value::Int(n)) => n,
                    _ => 0,
                };
                let _ = ctx.state.set(root, 0, Value::Int(prev + 1));
            });
            self.log("create");
            Ok(())
        }

        fn on_join(&mut self, ctx: &mut RoomContext, session_id: &SessionId) {
            // metadata is frozen once the room is active
            ctx.set_metadata("late", "ignored");
            self.log(format!("join:{}", session_id));
        }

        fn on_leave(&mut self, _ctx: &mut RoomContext, session_id: &SessionId, consented: bool) {
            self.log(format!("leave:{}:{}", session_id, consented));
        }

        fn on_dispose(&mut self, _ctx: &mut RoomContext) {
            self.log("dispose");
        }
    }

    async fn join(
        room: &mpsc::UnboundedSender<RoomCommand>,
        session_id: &str,
    ) -> (SessionId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        room.send(RoomCommand::Join {
            session_id: Some(session_id.to_string()),
            options: Vec::new(),
            outbound: out_tx,
            reply: reply_tx,
        })
        .unwrap();
        let sid = reply_rx.await.unwrap().unwrap();
        (sid, out_rx)
    }

    async fn next_packet(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> ServerPacket {
        let bytes = rx.recv().await.expect("outbound channel closed");
        decode_server_packet(&bytes).unwrap()
    }

    #[tokio::test]
    async fn failed_creation_never_activates() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let mut handler = ProbeRoom::new(events.clone());
        handler.fail_create = true;
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let (_cmd, created) =
            spawn_room("r1".to_string(), Box::new(handler), Vec::new(), closed_tx);

        assert!(matches!(created.await.unwrap(), Err(RoomError::Creation(_))));
        assert_eq!(closed_rx.recv().await.unwrap(), "r1");
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_receives_welcome_then_snapshot() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let (cmd, created) = spawn_room(
            "r2".to_string(),
            Box::new(ProbeRoom::new(events.clone())),
            Vec::new(),
            closed_tx,
        );
        created.await.unwrap().unwrap();

        let (sid, mut out) = join(&cmd, "alice").await;
        assert_eq!(sid.as_str(), "alice");

        match next_packet(&mut out).await {
            ServerPacket::Welcome { session_id } => assert_eq!(session_id, "alice"),
            other => panic!("expected welcome, got {:?}", other),
        }
        match next_packet(&mut out).await {
            ServerPacket::Sync { frame } => {
                let parsed = shared::codec::parse_frame(&frame).unwrap();
                assert!(matches!(parsed, SyncFrame::Snapshot { .. }));
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
        assert_eq!(events.lock().unwrap().as_slice(), ["create", "join:alice"]);
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let (cmd, created) = spawn_room(
            "r3".to_string(),
            Box::new(ProbeRoom::new(events)),
            Vec::new(),
            closed_tx,
        );
        created.await.unwrap().unwrap();

        let (_sid, _out) = join(&cmd, "alice").await;

        let (out_tx, _out_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        cmd.send(RoomCommand::Join {
            session_id: Some("alice".to_string()),
            options: Vec::new(),
            outbound: out_tx,
            reply: reply_tx,
        })
        .unwrap();
        assert!(matches!(
            reply_rx.await.unwrap(),
            Err(RoomError::Session(SessionError::Duplicate(_)))
        ));
    }

    #[tokio::test]
    async fn last_leave_disposes_the_room() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let (cmd, created) = spawn_room(
            "r4".to_string(),
            Box::new(ProbeRoom::new(events.clone())),
            Vec::new(),
            closed_tx,
        );
        created.await.unwrap().unwrap();

        let (sid, _out) = join(&cmd, "alice").await;
        cmd.send(RoomCommand::Leave {
            session_id: sid,
            consented: true,
        })
        .unwrap();

        assert_eq!(closed_rx.recv().await.unwrap(), "r4");
        let events = events.lock().unwrap();
        assert!(events.contains(&"leave:alice:true".to_string()));
        assert!(events.contains(&"dispose".to_string()));
    }

    #[tokio::test]
    async fn kick_sends_packet_and_unconsented_leave() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let (cmd, created) = spawn_room(
            "r5".to_string(),
            Box::new(ProbeRoom::new(events.clone())),
            Vec::new(),
            closed_tx,
        );
        created.await.unwrap().unwrap();

        let (sid, mut out) = join(&cmd, "alice").await;
        // drain welcome + snapshot
        next_packet(&mut out).await;
        next_packet(&mut out).await;

        let boot = shared::protocol::encode_packet(&ClientPacket::AppMessage {
            key: MessageKey::from("boot"),
            payload: Vec::new(),
        })
        .unwrap();
        cmd.send(RoomCommand::Message {
            session_id: sid,
            bytes: boot,
        })
        .unwrap();

        match next_packet(&mut out).await {
            ServerPacket::Kick { reason } => assert_eq!(reason, "booted"),
            other => panic!("expected kick, got {:?}", other),
        }
        closed_rx.recv().await.unwrap();
        assert!(events
            .lock()
            .unwrap()
            .contains(&"leave:alice:false".to_string()));
    }

    #[tokio::test]
    async fn handler_mutation_is_flushed_as_patch() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let (cmd, created) = spawn_room(
            "r6".to_string(),
            Box::new(ProbeRoom::new(events)),
            Vec::new(),
            closed_tx,
        );
        created.await.unwrap().unwrap();

        let (sid, mut out) = join(&cmd, "alice").await;
        next_packet(&mut out).await;
        next_packet(&mut out).await;

        let bump = shared::protocol::encode_packet(&ClientPacket::AppMessage {
            key: MessageKey::from("bump"),
            payload: Vec::new(),
        })
        .unwrap();
        cmd.send(RoomCommand::Message {
            session_id: sid,
            bytes: bump,
        })
        .unwrap();

        match next_packet(&mut out).await {
            ServerPacket::Sync { frame } => {
                match shared::codec::parse_frame(&frame).unwrap() {
                    SyncFrame::Patch { ops, .. } => assert_eq!(ops.len(), 1),
                    other => panic!("expected patch, got {:?}", other),
                }
            }
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn metadata_set_during_creation_is_frozen_after() {
        let events: EventLog = Arc::new(Mutex::new(Vec::new()));
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let (cmd, created) = spawn_room(
            "r7".to_string(),
            Box::new(ProbeRoom::new(events)),
            Vec::new(),
            closed_tx,
        );
        created.await.unwrap().unwrap();

        // on_join attempts a late set_metadata that must be ignored
        let (_sid, _out) = join(&cmd, "alice").await;

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd.send(RoomCommand::Metadata { reply: reply_tx }).unwrap();
        let metadata = reply_rx.await.unwrap();
        assert_eq!(metadata.get("mode").map(String::as_str), Some("probe"));
        assert!(!metadata.contains_key("late"));
    }
}
