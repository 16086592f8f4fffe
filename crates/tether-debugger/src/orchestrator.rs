//! The debugger orchestrator: session table, per-session event pumps and the
//! command surface the host drives.
//!
//! Each session owns exactly one adapter. Adapter events flow through an
//! unbounded channel into a pump task that applies them to the session record
//! under the state machine and republishes them as [`DebuggerEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tether_config::{DebuggerConfig, TetherConfig};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::adapter::{
    self, AdapterEvent, AdapterFactory, AdapterResult, AdapterSettings, DebugAdapter,
    DefaultAdapterFactory,
};
use crate::breakpoints::BreakpointReconciler;
use crate::error::{AdapterError, DebuggerError, Result};
use crate::model::{
    now_millis, AttachConfig, Breakpoint, ConsoleFilter, ConsoleMessage, DebugSessionId,
    DebugSessionInfo, DebuggerEvent, EvaluateResult, ExceptionFilter, ExceptionRecord,
    PauseLocation, ProtocolKind, Scope, SessionState, SourceBreakpoint, StackFrame, Variable,
};
use crate::presets::{resolve_presets, Preset};

/// Cheap to clone; all clones share one session table.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: DebuggerConfig,
    settings: AdapterSettings,
    presets: Vec<Preset>,
    factory: Arc<dyn AdapterFactory>,
    sessions: RwLock<HashMap<DebugSessionId, SessionEntry>>,
    /// Host session id -> its debug session. Reserved before connecting.
    host_sessions: Mutex<HashMap<String, DebugSessionId>>,
    next_id: AtomicU64,
    /// Orders buffered console and exception entries across sessions.
    next_seq: AtomicU64,
    events: broadcast::Sender<DebuggerEvent>,
}

struct SessionEntry {
    record: SessionRecord,
    adapter: Arc<dyn DebugAdapter>,
    pump: CancellationToken,
}

struct SessionRecord {
    id: DebugSessionId,
    host_session_id: String,
    protocol: ProtocolKind,
    state: SessionState,
    pause_location: Option<PauseLocation>,
    call_stack: Vec<StackFrame>,
    scopes: Vec<Scope>,
    breakpoints: BreakpointReconciler,
    console: VecDeque<(u64, ConsoleMessage)>,
    exceptions: VecDeque<(u64, ExceptionRecord)>,
    created_at: u64,
}

impl SessionRecord {
    fn new(id: DebugSessionId, host_session_id: &str, protocol: ProtocolKind) -> Self {
        Self {
            id,
            host_session_id: host_session_id.to_string(),
            protocol,
            state: SessionState::Connecting,
            pause_location: None,
            call_stack: Vec::new(),
            scopes: Vec::new(),
            breakpoints: BreakpointReconciler::new(),
            console: VecDeque::new(),
            exceptions: VecDeque::new(),
            created_at: now_millis(),
        }
    }

    fn transition(&mut self, to: SessionState) -> bool {
        if !self.state.can_transition(to) {
            tracing::debug!(
                target: "tether.debugger",
                session = %self.id,
                from = %self.state,
                %to,
                "ignoring state transition"
            );
            return false;
        }
        self.state = to;
        if to != SessionState::Paused {
            self.pause_location = None;
            self.call_stack.clear();
            self.scopes.clear();
        }
        true
    }

    fn info(&self) -> DebugSessionInfo {
        DebugSessionInfo {
            id: self.id,
            host_session_id: self.host_session_id.clone(),
            protocol: self.protocol,
            state: self.state,
            pause_location: self.pause_location.clone(),
            call_stack: self.call_stack.clone(),
            scopes: self.scopes.clone(),
            breakpoints: self.breakpoints.all(),
            created_at: self.created_at,
        }
    }

    fn state_changed(&self) -> DebuggerEvent {
        DebuggerEvent::StateChanged {
            session_id: self.id,
            state: self.state,
            location: self.pause_location.clone(),
            call_stack: (self.state == SessionState::Paused).then(|| self.call_stack.clone()),
        }
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

fn page<T>(mut items: Vec<(u64, T)>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    items.sort_by_key(|(seq, _)| *seq);
    items
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .map(|(_, item)| item)
        .collect()
}

fn in_range(timestamp: u64, since: Option<u64>, until: Option<u64>) -> bool {
    since.map_or(true, |since| timestamp >= since) && until.map_or(true, |until| timestamp <= until)
}

/// Result of applying one adapter event to a session record.
#[derive(Default)]
struct Applied {
    publish: Vec<DebuggerEvent>,
    /// The session reported a run/pause/terminate state.
    settled: bool,
    /// The transport is gone; the session must be removed.
    closed: Option<String>,
}

impl Inner {
    fn publish(&self, event: DebuggerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn contains(&self, id: DebugSessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    /// Free `host_session_id` if it is still bound to `id`.
    fn release_host(&self, host_session_id: &str, id: DebugSessionId) {
        let mut hosts = self.host_sessions.lock();
        if hosts.get(host_session_id) == Some(&id) {
            hosts.remove(host_session_id);
        }
    }

    fn apply(&self, id: DebugSessionId, event: AdapterEvent) -> Applied {
        let mut applied = Applied::default();
        let mut sessions = self.sessions.write();
        let Some(entry) = sessions.get_mut(&id) else {
            return applied;
        };
        let record = &mut entry.record;

        match event {
            AdapterEvent::Connected => {
                if record.transition(SessionState::Connected) {
                    applied.publish.push(record.state_changed());
                }
            }
            AdapterEvent::Paused {
                location,
                reason: _,
                call_stack,
                scopes,
                hit_breakpoints,
            } => {
                applied.settled = true;
                if record.transition(SessionState::Paused) {
                    record.pause_location = Some(location);
                    record.call_stack = call_stack;
                    record.scopes = scopes;
                    applied.publish.push(record.state_changed());
                    for hit in &hit_breakpoints {
                        if let Some(breakpoint) = record.breakpoints.get(hit) {
                            applied.publish.push(DebuggerEvent::BreakpointHit {
                                session_id: id,
                                breakpoint: breakpoint.clone(),
                                call_stack: record.call_stack.clone(),
                            });
                        }
                    }
                }
            }
            AdapterEvent::Resumed => {
                applied.settled = true;
                if record.transition(SessionState::Running) {
                    applied.publish.push(record.state_changed());
                }
            }
            AdapterEvent::Console(entry) => {
                let message = ConsoleMessage {
                    session_id: id,
                    timestamp: entry.timestamp.unwrap_or_else(now_millis),
                    level: entry.level,
                    text: entry.text,
                    location: entry.location,
                    stack_trace: entry.stack_trace,
                };
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                push_bounded(
                    &mut record.console,
                    (seq, message.clone()),
                    self.config.console_capacity,
                );
                applied.publish.push(DebuggerEvent::ConsoleMessage(message));
            }
            AdapterEvent::Exception(entry) => {
                let exception = ExceptionRecord {
                    session_id: id,
                    timestamp: entry.timestamp.unwrap_or_else(now_millis),
                    message: entry.message,
                    description: entry.description,
                    location: entry.location,
                    stack_trace: entry.stack_trace,
                    uncaught: entry.uncaught,
                };
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                push_bounded(
                    &mut record.exceptions,
                    (seq, exception.clone()),
                    self.config.exception_capacity,
                );
                applied.publish.push(DebuggerEvent::Exception(exception));
            }
            AdapterEvent::BreakpointChanged(breakpoint) => {
                record.breakpoints.update(breakpoint);
            }
            AdapterEvent::Terminated { reason } => {
                applied.settled = true;
                if record.transition(SessionState::Terminated) {
                    tracing::info!(target: "tether.debugger", session = %id, %reason, "debuggee terminated");
                    applied.publish.push(record.state_changed());
                }
            }
            AdapterEvent::TransportClosed { error } => {
                applied.settled = true;
                if record.transition(SessionState::Terminated) {
                    applied.publish.push(record.state_changed());
                }
                applied.closed = Some(error.unwrap_or_else(|| "transport closed".to_string()));
            }
        }
        applied
    }

    /// Drop a session whose transport died. No-op if it was already detached.
    async fn remove_lost_session(&self, id: DebugSessionId, reason: String) {
        let removed = self.sessions.write().remove(&id);
        let Some(entry) = removed else {
            return;
        };
        self.release_host(&entry.record.host_session_id, id);
        tracing::warn!(target: "tether.debugger", session = %id, %reason, "debug session lost its transport");
        entry.adapter.disconnect().await;
        self.publish(DebuggerEvent::SessionRemoved {
            session_id: id,
            reason,
        });
    }
}

async fn pump_events(
    inner: Weak<Inner>,
    id: DebugSessionId,
    mut events: mpsc::UnboundedReceiver<AdapterEvent>,
    cancel: CancellationToken,
    first_state: oneshot::Sender<()>,
) {
    let mut first_state = Some(first_state);
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let applied = inner.apply(id, event);
        for event in applied.publish {
            inner.publish(event);
        }
        if applied.settled {
            if let Some(tx) = first_state.take() {
                let _ = tx.send(());
            }
        }
        if let Some(reason) = applied.closed {
            inner.remove_lost_session(id, reason).await;
            break;
        }
    }
    tracing::trace!(target: "tether.debugger", session = %id, "event pump stopped");
}

/// Frees the host-session reservation unless the attach completed.
struct HostReservation<'a> {
    inner: &'a Inner,
    host_session_id: String,
    id: DebugSessionId,
    committed: bool,
}

impl Drop for HostReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.inner.release_host(&self.host_session_id, self.id);
        }
    }
}

/// A session entry inserted before `connect`. Until the attach commits, a
/// failed or abandoned attach removes the entry, stops its pump and closes
/// the adapter.
struct PendingSession<'a> {
    inner: &'a Inner,
    id: DebugSessionId,
    adapter: Arc<dyn DebugAdapter>,
    pump: CancellationToken,
    armed: bool,
}

impl PendingSession<'_> {
    fn forget(&self) {
        self.pump.cancel();
        self.inner.sessions.write().remove(&self.id);
    }

    async fn abandon(mut self) {
        self.armed = false;
        self.forget();
        self.adapter.disconnect().await;
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.forget();
        tracing::debug!(target: "tether.debugger", session = %self.id, "attach abandoned");
        let adapter = self.adapter.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { adapter.disconnect().await });
        }
    }
}

impl Orchestrator {
    pub fn new(config: &TetherConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultAdapterFactory))
    }

    pub fn with_factory(config: &TetherConfig, factory: Arc<dyn AdapterFactory>) -> Self {
        let (events, _) = broadcast::channel(config.debugger.event_channel_size.max(1));
        Self {
            inner: Arc::new(Inner {
                config: config.debugger.clone(),
                settings: AdapterSettings::from_config(&config.debugger),
                presets: resolve_presets(&config.presets),
                factory,
                sessions: RwLock::new(HashMap::new()),
                host_sessions: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_seq: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Attach `host_session_id` to a debuggee. Returns once the adapter has
    /// reported its first run/pause state (or the wait for it timed out).
    pub async fn attach(
        &self,
        host_session_id: &str,
        config: AttachConfig,
    ) -> Result<DebugSessionId> {
        let inner = &self.inner;
        let protocol = ProtocolKind::parse(&config.protocol)
            .ok_or_else(|| DebuggerError::UnsupportedProtocol(config.protocol.clone()))?;
        adapter::validate_config(protocol, &config).map_err(DebuggerError::InvalidConfig)?;

        let id = DebugSessionId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let mut reservation = {
            let mut hosts = inner.host_sessions.lock();
            if hosts.contains_key(host_session_id) {
                return Err(DebuggerError::AlreadyAttached(host_session_id.to_string()));
            }
            hosts.insert(host_session_id.to_string(), id);
            HostReservation {
                inner,
                host_session_id: host_session_id.to_string(),
                id,
                committed: false,
            }
        };

        let adapter = inner.factory.create(protocol, &inner.settings);
        let (sink, events) = mpsc::unbounded_channel();
        adapter.set_event_sink(sink);

        let pump = CancellationToken::new();
        inner.sessions.write().insert(
            id,
            SessionEntry {
                record: SessionRecord::new(id, host_session_id, protocol),
                adapter: adapter.clone(),
                pump: pump.clone(),
            },
        );
        let pending = PendingSession {
            inner,
            id,
            adapter: adapter.clone(),
            pump: pump.clone(),
            armed: true,
        };
        let (first_state_tx, first_state_rx) = oneshot::channel();
        tokio::spawn(pump_events(
            Arc::downgrade(inner),
            id,
            events,
            pump,
            first_state_tx,
        ));

        let budget = inner.config.connect_timeout() + inner.config.request_timeout();
        let connected = match tokio::time::timeout(budget, adapter.connect(&config)).await {
            Ok(result) => result.map_err(attach_error),
            Err(_) => Err(DebuggerError::ConnectionFailed(format!(
                "no response from debuggee within {}ms",
                budget.as_millis()
            ))),
        };
        if let Err(err) = connected {
            pending.abandon().await;
            tracing::warn!(target: "tether.debugger", host_session = %host_session_id, %protocol, error = %err, "attach failed");
            return Err(err);
        }

        // A detach or a lost transport during connect has already removed the entry.
        let live = inner.contains(id);
        reservation.committed = live;
        if !live {
            pending.abandon().await;
            return Err(DebuggerError::ConnectionFailed(
                "debuggee disconnected during attach".to_string(),
            ));
        }
        pending.commit();
        inner.publish(DebuggerEvent::SessionCreated {
            session_id: id,
            host_session_id: host_session_id.to_string(),
            protocol,
        });

        if tokio::time::timeout(inner.config.first_state_timeout(), first_state_rx)
            .await
            .is_err()
        {
            tracing::warn!(target: "tether.debugger", session = %id, "debuggee reported no initial state");
        }
        tracing::info!(target: "tether.debugger", session = %id, host_session = %host_session_id, %protocol, "debug session attached");
        Ok(id)
    }

    /// Tear down the session's adapter and forget it. Unknown ids are a no-op.
    pub async fn detach(&self, id: DebugSessionId) {
        let removed = self.inner.sessions.write().remove(&id);
        let Some(entry) = removed else {
            return;
        };
        self.inner.release_host(&entry.record.host_session_id, id);
        entry.pump.cancel();

        let mut record = entry.record;
        if record.transition(SessionState::Terminated) {
            self.inner.publish(record.state_changed());
        }
        entry.adapter.disconnect().await;
        self.inner.publish(DebuggerEvent::SessionRemoved {
            session_id: id,
            reason: "detached".to_string(),
        });
        tracing::info!(target: "tether.debugger", session = %id, "debug session detached");
    }

    pub fn get_session(&self, id: DebugSessionId) -> Option<DebugSessionInfo> {
        self.inner
            .sessions
            .read()
            .get(&id)
            .map(|entry| entry.record.info())
    }

    pub fn get_all_sessions(&self) -> Vec<DebugSessionInfo> {
        let mut sessions: Vec<_> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|entry| entry.record.info())
            .collect();
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    /// Buffered console output, oldest first.
    pub fn get_console_messages(&self, filter: &ConsoleFilter) -> Vec<ConsoleMessage> {
        let sessions = self.inner.sessions.read();
        let matched = sessions
            .values()
            .filter(|entry| filter.session_id.map_or(true, |id| id == entry.record.id))
            .flat_map(|entry| entry.record.console.iter())
            .filter(|(_, message)| {
                filter.level.map_or(true, |level| level == message.level)
                    && in_range(message.timestamp, filter.since, filter.until)
            })
            .cloned()
            .collect();
        page(matched, filter.offset, filter.limit)
    }

    /// Buffered exceptions, oldest first.
    pub fn get_exceptions(&self, filter: &ExceptionFilter) -> Vec<ExceptionRecord> {
        let sessions = self.inner.sessions.read();
        let matched = sessions
            .values()
            .filter(|entry| filter.session_id.map_or(true, |id| id == entry.record.id))
            .flat_map(|entry| entry.record.exceptions.iter())
            .filter(|(_, record)| in_range(record.timestamp, filter.since, filter.until))
            .cloned()
            .collect();
        page(matched, filter.offset, filter.limit)
    }

    pub async fn get_call_stack(&self, id: DebugSessionId) -> Result<Vec<StackFrame>> {
        self.query(id, |adapter| async move { adapter.get_call_stack().await })
            .await
    }

    pub async fn get_scopes(&self, id: DebugSessionId, frame_id: i64) -> Result<Vec<Scope>> {
        self.query(id, |adapter| async move { adapter.get_scopes(frame_id).await })
            .await
    }

    pub async fn get_variables(
        &self,
        id: DebugSessionId,
        variables_reference: i64,
    ) -> Result<Vec<Variable>> {
        self.query(id, |adapter| async move {
            adapter.get_variables(variables_reference).await
        })
        .await
    }

    /// Replace every breakpoint in `source`; the session model mirrors the result.
    pub async fn set_breakpoints(
        &self,
        id: DebugSessionId,
        source: &str,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Result<Vec<Breakpoint>> {
        let installed = self
            .query(id, |adapter| async move {
                adapter.set_breakpoints(source, &breakpoints).await
            })
            .await?;
        if let Some(entry) = self.inner.sessions.write().get_mut(&id) {
            entry.record.breakpoints.replace(source, installed.clone());
        }
        Ok(installed)
    }

    pub async fn remove_breakpoint(&self, id: DebugSessionId, breakpoint_id: &str) -> Result<()> {
        let remaining = self
            .query(id, |adapter| async move {
                adapter.remove_breakpoint(breakpoint_id).await
            })
            .await?;
        if let Some(entry) = self.inner.sessions.write().get_mut(&id) {
            let breakpoints = &mut entry.record.breakpoints;
            let source = breakpoints
                .source_of(breakpoint_id)
                .map(str::to_string)
                .or_else(|| remaining.first().map(|bp| bp.source.clone()));
            if let Some(source) = source {
                breakpoints.replace(&source, remaining);
            }
        }
        Ok(())
    }

    pub async fn resume(&self, id: DebugSessionId) -> Result<()> {
        self.command(id, |adapter| async move { adapter.resume().await })
            .await
    }

    pub async fn pause(&self, id: DebugSessionId) -> Result<()> {
        self.command(id, |adapter| async move { adapter.pause().await })
            .await
    }

    pub async fn step_over(&self, id: DebugSessionId) -> Result<()> {
        self.command(id, |adapter| async move { adapter.step_over().await })
            .await
    }

    pub async fn step_into(&self, id: DebugSessionId) -> Result<()> {
        self.command(id, |adapter| async move { adapter.step_into().await })
            .await
    }

    pub async fn step_out(&self, id: DebugSessionId) -> Result<()> {
        self.command(id, |adapter| async move { adapter.step_out().await })
            .await
    }

    /// Exceptions raised by the expression come back as a result with
    /// `is_error` set, not as an error.
    pub async fn evaluate(
        &self,
        id: DebugSessionId,
        expression: &str,
        frame_id: Option<i64>,
    ) -> Result<EvaluateResult> {
        self.query(id, |adapter| async move {
            adapter.evaluate(expression, frame_id).await
        })
        .await
    }

    /// Subscribe to every session's events, or to one session's.
    pub fn subscribe(
        &self,
        session: Option<DebugSessionId>,
    ) -> (EventSubscription, SubscriptionHandle) {
        let cancel = CancellationToken::new();
        (
            EventSubscription {
                events: self.inner.events.subscribe(),
                session,
                cancel: cancel.clone(),
            },
            SubscriptionHandle { cancel },
        )
    }

    pub fn get_presets(&self) -> Vec<Preset> {
        self.inner.presets.clone()
    }

    /// Detach every session.
    pub async fn shutdown(&self) {
        let ids: Vec<DebugSessionId> = self.inner.sessions.read().keys().copied().collect();
        for id in ids {
            self.detach(id).await;
        }
    }

    fn live_adapter(&self, id: DebugSessionId) -> Result<Arc<dyn DebugAdapter>> {
        let sessions = self.inner.sessions.read();
        let entry = sessions.get(&id).ok_or(DebuggerError::SessionNotFound(id))?;
        if !entry.record.state.accepts_commands() {
            return Err(DebuggerError::SessionNotActive {
                id,
                state: entry.record.state.to_string(),
            });
        }
        Ok(entry.adapter.clone())
    }

    /// Run an execution-control command. A command cut short because the
    /// session was detached underneath it counts as done.
    async fn command<F, Fut>(&self, id: DebugSessionId, run: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn DebugAdapter>) -> Fut,
        Fut: Future<Output = AdapterResult<()>>,
    {
        let adapter = self.live_adapter(id)?;
        match run(adapter).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancellation() && !self.inner.contains(id) => {
                tracing::debug!(target: "tether.debugger", session = %id, "command interrupted by detach");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Run a data query. One cut short by a detach reports the session as gone.
    async fn query<T, F, Fut>(&self, id: DebugSessionId, run: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn DebugAdapter>) -> Fut,
        Fut: Future<Output = AdapterResult<T>>,
    {
        let adapter = self.live_adapter(id)?;
        match run(adapter).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_cancellation() && !self.inner.contains(id) => {
                Err(DebuggerError::SessionNotFound(id))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn attach_error(err: AdapterError) -> DebuggerError {
    match err {
        AdapterError::ConnectionFailed(message) => DebuggerError::ConnectionFailed(message),
        AdapterError::InvalidConfig(message) => DebuggerError::InvalidConfig(message),
        other => DebuggerError::Adapter(other),
    }
}

/// A stream of orchestrator events, optionally scoped to one session.
pub struct EventSubscription {
    events: broadcast::Receiver<DebuggerEvent>,
    session: Option<DebugSessionId>,
    cancel: CancellationToken,
}

impl EventSubscription {
    /// Next matching event; `None` once the handle is cancelled or the
    /// orchestrator is gone. A lagging subscriber skips what it missed.
    pub async fn recv(&mut self) -> Option<DebuggerEvent> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                event = self.events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if self.session.map_or(true, |id| id == event.session_id()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "tether.debugger", skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already-buffered matching event, without waiting.
    pub fn try_recv(&mut self) -> Option<DebuggerEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    if self.session.map_or(true, |id| id == event.session_id()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "tether.debugger", skipped, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }
}

/// Revokes the paired [`EventSubscription`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
