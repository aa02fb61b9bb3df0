//! Feedback engine
//!
//! Ties the framer, correlator, registry and resync monitor to one endpoint
//! connection. The host supplies the transport; the engine never opens
//! sockets itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, ProtocolError, Result};
use crate::protocol::{Correlator, FeedbackKey, Framer, Message, PendingCommand, Protocol};
use crate::registry::{CallbackId, CommandSink, Feedback, FeedbackRegistry};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::transport::Transport;

use super::config::EngineConfig;
use super::resync::{ResyncMonitor, ResyncState, RESYNC_CORRELATION_ID};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Notified when the endpoint goes online or offline
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_changed(&self, online: bool);
}

/// Outbound half: correlation plus serialized transport writes
struct Commander {
    protocol: Arc<dyn Protocol>,
    correlator: Correlator,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Serializes writes so command text never interleaves on the wire
    write_lock: Mutex<()>,
    online: AtomicBool,
    stats: Arc<EngineStats>,
}

impl Commander {
    fn write(&self, command: &str, correlation_id: &str) -> Result<()> {
        if !self.online.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        let transport = self
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::NotConnected)?;

        let wire = self.protocol.encode_command(command, correlation_id);

        let _guard = lock(&self.write_lock);
        match transport.send(&wire) {
            Ok(()) => {
                EngineStats::add(&self.stats.commands_sent, 1);
                EngineStats::add(&self.stats.bytes_sent, wire.len() as u64);
                tracing::trace!(id = correlation_id, command = command, "Command written");
                Ok(())
            }
            Err(e) => {
                tracing::error!(id = correlation_id, error = %e, "Transport write failed");
                Err(e.into())
            }
        }
    }
}

impl CommandSink for Commander {
    fn send_command(&self, command: &str) -> Result<PendingCommand> {
        let id = self.correlator.next_id();
        // Track before writing so a fast reply cannot overtake the entry
        let pending = self.correlator.track(id.clone(), command);
        if let Err(e) = self.write(command, &id) {
            self.correlator.resolve(&id);
            return Err(e);
        }
        Ok(pending)
    }
}

/// Protocol engine for one endpoint
///
/// ```text
/// on_data ─► Framer ─► Protocol::parse ─► resync reply? ─► Resync Monitor
///                                            │ no
///                                            ▼
///                               Correlator::resolve (replies)
///                                            │
///                                            ▼
///                               FeedbackRegistry::dispatch ─► callbacks
/// ```
pub struct Engine {
    config: EngineConfig,
    protocol: Arc<dyn Protocol>,
    framer: Mutex<Framer>,
    commander: Arc<Commander>,
    registry: FeedbackRegistry,
    resync: ResyncMonitor,
    observers: Mutex<Vec<Weak<dyn ConnectionObserver>>>,
    errors: broadcast::Sender<ProtocolError>,
    stats: Arc<EngineStats>,
}

impl Engine {
    /// Create an offline engine for the given protocol family
    pub fn new<P: Protocol>(config: EngineConfig, protocol: P) -> Arc<Self> {
        let protocol: Arc<dyn Protocol> = Arc::new(protocol);
        let stats = Arc::new(EngineStats::new());

        let commander = Arc::new(Commander {
            protocol: Arc::clone(&protocol),
            correlator: Correlator::new(),
            transport: RwLock::new(None),
            write_lock: Mutex::new(()),
            online: AtomicBool::new(false),
            stats: Arc::clone(&stats),
        });

        let registry = FeedbackRegistry::new(
            Arc::clone(&protocol),
            commander.clone(),
            config.name.clone(),
        );
        let (errors, _) = broadcast::channel(config.error_channel_capacity.max(1));

        tracing::debug!(name = %config.name, protocol = protocol.name(), "Engine created");

        Arc::new(Self {
            framer: Mutex::new(Framer::with_max_buffer_size(
                protocol.frame_mode(),
                config.max_buffer_size,
            )),
            resync: ResyncMonitor::new(config.resync_enabled),
            config,
            protocol,
            commander,
            registry,
            observers: Mutex::new(Vec::new()),
            errors,
            stats,
        })
    }

    /// Endpoint label
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Protocol family in use
    pub fn protocol(&self) -> &dyn Protocol {
        self.protocol.as_ref()
    }

    /// The feedback registry
    pub fn registry(&self) -> &FeedbackRegistry {
        &self.registry
    }

    /// The resync monitor
    pub fn resync(&self) -> &ResyncMonitor {
        &self.resync
    }

    /// Number of commands awaiting replies
    pub fn pending_commands(&self) -> usize {
        self.commander.correlator.pending_count()
    }

    /// Whether `id` is still awaiting a reply
    pub fn is_pending(&self, id: &str) -> bool {
        self.commander.correlator.is_pending(id)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Receiver for protocol errors reported by the endpoint
    pub fn errors(&self) -> broadcast::Receiver<ProtocolError> {
        self.errors.subscribe()
    }

    // ---- Consumer API ----

    /// Register a feedback callback (subscribes on first registration)
    pub fn register<F>(&self, key: &FeedbackKey, callback: F) -> CallbackId
    where
        F: Fn(&Feedback<'_>) + Send + Sync + 'static,
    {
        self.registry.register(key, callback)
    }

    /// Register a callback for command replies routed under `key`
    pub fn listen<F>(&self, key: &FeedbackKey, callback: F) -> CallbackId
    where
        F: Fn(&Feedback<'_>) + Send + Sync + 'static,
    {
        self.registry.listen(key, callback)
    }

    /// Remove a callback (unsubscribes when the last remote one leaves)
    pub fn deregister(&self, key: &FeedbackKey, id: CallbackId) -> bool {
        self.registry.deregister(key, id)
    }

    /// Send a command tagged with a fresh correlation id
    ///
    /// Fire-and-forget: the reply, if any, arrives through dispatch.
    pub fn send_command(&self, command: &str) -> Result<PendingCommand> {
        self.commander.send_command(command)
    }

    /// Watch connection state changes; the observer is held weakly
    pub fn observe<T>(&self, observer: &Arc<T>)
    where
        T: ConnectionObserver + 'static,
    {
        let weak: Weak<dyn ConnectionObserver> = Arc::downgrade(observer) as Weak<dyn ConnectionObserver>;
        lock(&self.observers).push(weak);
    }

    // ---- Transport boundary ----

    /// Attach the outbound half of a connected transport
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self
            .commander
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    /// Detach the transport; subsequent sends fail with `NotConnected`
    pub fn detach_transport(&self) {
        self.commander
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether the endpoint is online
    pub fn is_online(&self) -> bool {
        self.commander.online.load(Ordering::Acquire)
    }

    /// Apply a connected/online state change from the transport
    ///
    /// Going offline abandons every pending command, suspends resync and
    /// tells observers (the call tracker force-disconnects its calls). Coming
    /// online replays every registered subscription from scratch.
    pub fn set_online(&self, online: bool) {
        let was = self.commander.online.swap(online, Ordering::AcqRel);
        if was == online {
            return;
        }

        lock(&self.framer).reset();

        if online {
            tracing::info!(endpoint = %self.config.name, "Endpoint online");
            self.registry.replay();
            self.resync.resume();
        } else {
            tracing::info!(endpoint = %self.config.name, "Endpoint offline");
            let abandoned = self.commander.correlator.abandon_all();
            EngineStats::add(&self.stats.abandoned_commands, abandoned.len() as u64);
            self.resync.suspend();
        }

        let observers: Vec<Arc<dyn ConnectionObserver>> = {
            let mut observers = lock(&self.observers);
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_connection_changed(online);
        }
    }

    /// Feed raw bytes received from the transport
    ///
    /// Must be called from a single reader context so dispatch stays
    /// ordered.
    pub fn on_data(&self, chunk: &[u8]) {
        EngineStats::add(&self.stats.bytes_received, chunk.len() as u64);

        let frames = lock(&self.framer).push(chunk);
        for frame in frames {
            match frame {
                Ok(bytes) => {
                    EngineStats::add(&self.stats.frames, 1);
                    match self.protocol.parse(&bytes) {
                        Ok(message) => self.on_message(&message),
                        Err(Error::Protocol(e)) => {
                            if let Some(id) = e.correlation_id() {
                                self.settle_undecodable(id);
                            }
                            self.report(e);
                        }
                        Err(e) => {
                            EngineStats::add(&self.stats.framing_errors, 1);
                            tracing::warn!(error = %e, len = bytes.len(), "Dropping unparseable frame");
                        }
                    }
                }
                Err(e) => {
                    EngineStats::add(&self.stats.framing_errors, 1);
                    tracing::warn!(error = %e, "Framing error");
                }
            }
        }
    }

    /// Handle one parsed message
    pub fn on_message(&self, message: &Message) {
        if self.resync.is_probe_reply(message) {
            self.on_resync_reply(message);
            return;
        }

        if let Some(id) = message.correlation_id.as_deref() {
            if self.commander.correlator.resolve(id).is_some() {
                EngineStats::add(&self.stats.replies_resolved, 1);
            } else {
                tracing::debug!(id = id, "Reply for unknown correlation id, treating as async");
            }
        }

        if let crate::protocol::MessageStatus::Error(reason) = &message.status {
            self.report(ProtocolError::Status {
                key: message.key.clone(),
                reason: reason.clone(),
                correlation_id: message.correlation_id.clone(),
            });
        }

        let delivered = self.registry.dispatch(message);
        if delivered == 0 {
            EngineStats::add(&self.stats.unrouted, 1);
        } else {
            EngineStats::add(&self.stats.deliveries, delivered as u64);
        }
    }

    /// Release whoever waits on a reply that could not be decoded
    fn settle_undecodable(&self, id: &str) {
        if id == RESYNC_CORRELATION_ID {
            self.resync.abort_probe();
        } else if self.commander.correlator.resolve(id).is_some() {
            EngineStats::add(&self.stats.replies_resolved, 1);
        }
    }

    fn report(&self, error: ProtocolError) {
        EngineStats::add(&self.stats.protocol_errors, 1);
        tracing::warn!(endpoint = %self.config.name, error = %error, "Protocol error");
        // No receivers is fine
        let _ = self.errors.send(error);
    }

    // ---- Resync ----

    /// Run one resync tick: prune stale commands, then probe subscriptions
    ///
    /// Returns true if a probe was sent.
    pub fn resync_tick(&self) -> bool {
        let expired = self.commander.correlator.expire(self.config.command_timeout);
        EngineStats::add(&self.stats.abandoned_commands, expired.len() as u64);

        if !self.resync.begin_probe() {
            return false;
        }

        let command = self.protocol.subscription_list_command();
        match self.commander.write(&command, RESYNC_CORRELATION_ID) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Resync probe not sent");
                self.resync.abort_probe();
                false
            }
        }
    }

    fn on_resync_reply(&self, message: &Message) {
        if let crate::protocol::MessageStatus::Error(reason) = &message.status {
            tracing::warn!(reason = %reason, "Resync probe rejected");
            self.resync.abort_probe();
            return;
        }

        let reported = self.protocol.parse_subscription_list(message);
        let repaired = self.resync.complete(&self.registry, &reported);
        EngineStats::add(&self.stats.drift_repairs, repaired.len() as u64);
    }

    /// Current resync state
    pub fn resync_state(&self) -> ResyncState {
        self.resync.state()
    }

    /// Spawn the periodic resync timer
    ///
    /// The task holds the engine weakly and ends once it is dropped. Ticks
    /// while offline are no-ops.
    pub fn spawn_resync_task(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let interval = self.config.resync_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.resync_tick();
            }
        })
    }

    /// Unsubscribe everything and forget every observer
    pub fn shutdown(&self) {
        self.registry.clear();
        lock(&self.observers).clear();
        tracing::info!(endpoint = %self.config.name, "Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::protocol::{JsonProtocol, XapiProtocol};
    use crate::testing::RecordingTransport;

    fn online_engine() -> (Arc<Engine>, RecordingTransport) {
        let engine = Engine::new(EngineConfig::default(), XapiProtocol::new());
        let transport = RecordingTransport::new();
        engine.attach_transport(Arc::new(transport.clone()));
        engine.set_online(true);
        (engine, transport)
    }

    #[test]
    fn test_send_requires_connection() {
        let engine = Engine::new(EngineConfig::default(), XapiProtocol::new());
        assert!(matches!(
            engine.send_command("xStatus Call"),
            Err(Error::NotConnected)
        ));
        assert_eq!(engine.pending_commands(), 0);
    }

    #[test]
    fn test_send_tags_and_reply_resolves() {
        let (engine, transport) = online_engine();

        let pending = engine.send_command("xStatus Call").unwrap();
        assert_eq!(
            transport.take(),
            vec![format!("xStatus Call | resultId=\"{}\"\r\n", pending.id)]
        );
        assert!(engine.is_pending(&pending.id));

        engine.on_data(format!("<XmlDoc resultId=\"{}\"><Status/></XmlDoc>", pending.id).as_bytes());
        assert!(!engine.is_pending(&pending.id));
        assert_eq!(engine.stats().replies_resolved, 1);
    }

    #[test]
    fn test_unknown_correlation_dispatched_as_async() {
        let (engine, _) = online_engine();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        engine.listen(&FeedbackKey::parse("status/audio"), move |fb| {
            assert_eq!(fb.correlation_id, Some("nobody"));
            h.fetch_add(1, Ordering::SeqCst);
        });

        engine.on_data(b"<XmlDoc resultId=\"nobody\"><Status><Audio/></Status></XmlDoc>");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_error_reply_surfaces_on_channel() {
        let (engine, _) = online_engine();
        let mut errors = engine.errors();

        engine.on_data(
            b"<XmlDoc resultId=\"3\"><CommandResponse><DialResult status=\"Error\"><Reason>Busy</Reason></DialResult></CommandResponse></XmlDoc>",
        );

        let error = errors.try_recv().unwrap();
        assert!(matches!(error, ProtocolError::Status { ref reason, .. } if reason == "Busy"));
        assert_eq!(engine.stats().protocol_errors, 1);
    }

    #[test]
    fn test_undecodable_reply_settles_command() {
        let engine = Engine::new(EngineConfig::default(), JsonProtocol::new());
        let transport = RecordingTransport::new();
        engine.attach_transport(Arc::new(transport.clone()));
        engine.set_online(true);
        let mut errors = engine.errors();

        let pending = engine.send_command("zStatus Call Status").unwrap();
        assert!(engine.is_pending(&pending.id));

        let reply = format!(
            "{{\"CallStatus\":\"bad\",\"Sync\":true,\"requestId\":\"{}\",\"topKey\":\"CallStatus\",\"type\":\"zStatus\"}}\n",
            pending.id
        );
        engine.on_data(reply.as_bytes());

        assert!(!engine.is_pending(&pending.id));
        let error = errors.try_recv().unwrap();
        assert!(matches!(error, ProtocolError::Decode { ref tag, .. } if tag == "CallStatus"));
        assert_eq!(error.correlation_id(), Some(pending.id.as_str()));
        assert_eq!(engine.stats().replies_resolved, 1);
    }

    /// Writes every frame a few bytes at a time
    #[derive(Clone, Default)]
    struct ChunkedTransport {
        wire: Arc<Mutex<Vec<u8>>>,
    }

    impl Transport for ChunkedTransport {
        fn send(&self, text: &str) -> std::io::Result<()> {
            for chunk in text.as_bytes().chunks(3) {
                lock(&self.wire).extend_from_slice(chunk);
                std::thread::yield_now();
            }
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_sends_do_not_interleave() {
        let engine = Engine::new(EngineConfig::default(), XapiProtocol::new());
        let transport = ChunkedTransport::default();
        engine.attach_transport(Arc::new(transport.clone()));
        engine.set_online(true);

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for n in 0..25 {
                        engine
                            .send_command(&format!("xCommand Dial Number: {}-{}", t, n))
                            .unwrap();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let wire = String::from_utf8(lock(&transport.wire).clone()).unwrap();
        let lines: Vec<&str> = wire.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 200);

        let mut ids = HashSet::new();
        for line in lines {
            let (command, tag) = line.split_once(" | resultId=").unwrap();
            let number = command.strip_prefix("xCommand Dial Number: ").unwrap();
            let (t, n) = number.split_once('-').unwrap();
            assert!(t.parse::<u32>().is_ok() && n.parse::<u32>().is_ok(), "{}", line);
            assert!(tag.len() > 2 && tag.starts_with('"') && tag.ends_with('"'), "{}", line);
            assert!(ids.insert(tag.to_string()));
        }
        assert_eq!(engine.pending_commands(), 200);
    }

    #[test]
    fn test_framing_errors_counted_not_fatal() {
        let (engine, _) = online_engine();
        engine.on_data(b"<A><B></A></B>");
        engine.on_data(b"<XmlDoc><Status/></XmlDoc>");

        let stats = engine.stats();
        assert_eq!(stats.framing_errors, 1);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.unrouted, 1);
    }

    #[test]
    fn test_offline_abandons_and_online_replays() {
        let (engine, transport) = online_engine();
        engine.register(&FeedbackKey::parse("event/a"), |_| {});
        engine.send_command("xCommand Dial Number: 1").unwrap();
        transport.take();

        engine.set_online(false);
        assert_eq!(engine.pending_commands(), 0);
        assert_eq!(engine.resync_state(), ResyncState::Suspended);
        assert_eq!(engine.stats().abandoned_commands, 2);

        // Registering while offline writes nothing but is remembered
        engine.register(&FeedbackKey::parse("event/b"), |_| {});
        assert!(transport.take().is_empty());

        engine.set_online(true);
        assert_eq!(
            transport.take_commands(),
            vec!["xFeedback register /event/a", "xFeedback register /event/b"]
        );
        assert_eq!(engine.resync_state(), ResyncState::Idle);
    }

    #[test]
    fn test_observers_notified() {
        struct Flag(AtomicUsize);
        impl ConnectionObserver for Flag {
            fn on_connection_changed(&self, online: bool) {
                self.0.fetch_add(if online { 1 } else { 10 }, Ordering::SeqCst);
            }
        }

        let (engine, _) = online_engine();
        let flag = Arc::new(Flag(AtomicUsize::new(0)));
        engine.observe(&flag);

        engine.set_online(false);
        engine.set_online(false);
        engine.set_online(true);
        assert_eq!(flag.0.load(Ordering::SeqCst), 11);

        drop(flag);
        engine.set_online(false);
        assert!(lock(&engine.observers).is_empty());
    }

    #[test]
    fn test_resync_round_trip() {
        let (engine, transport) = online_engine();
        for path in ["event/a", "event/b", "event/c"] {
            engine.register(&FeedbackKey::parse(path), |_| {});
        }
        transport.take();

        assert!(engine.resync_tick());
        assert_eq!(
            transport.take(),
            vec!["xFeedback list | resultId=\"resync\"\r\n"]
        );

        engine.on_data(
            b"<XmlDoc resultId=\"resync\"><FeedbackList><Expression item=\"1\">/event/a</Expression><Expression item=\"2\">/event/c</Expression></FeedbackList></XmlDoc>",
        );

        assert_eq!(transport.take_commands(), vec!["xFeedback register /event/b"]);
        assert_eq!(engine.stats().drift_repairs, 1);
        assert_eq!(engine.resync_state(), ResyncState::Idle);
    }

    #[test]
    fn test_resync_suspended_offline() {
        let engine = Engine::new(EngineConfig::default(), XapiProtocol::new());
        assert!(!engine.resync_tick());
    }

    #[test]
    fn test_json_engine_dispatch() {
        let engine = Engine::new(EngineConfig::default(), JsonProtocol::new());
        let transport = RecordingTransport::new();
        engine.attach_transport(Arc::new(transport.clone()));
        engine.set_online(true);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        engine.register(&FeedbackKey::parse("zStatus/CallStatus"), move |fb| {
            lock(&s).push(fb.payload.child_text("state").unwrap_or_default());
        });

        let written = transport.take();
        assert_eq!(written.len(), 2);
        assert!(written[0].starts_with(
            "{\"command\":\"zFeedback Register Path: /zstatus/callstatus\",\"requestId\":\""
        ));
        assert!(written[1].starts_with("{\"command\":\"zStatus callstatus\""));
        assert!(written.iter().all(|w| w.ends_with('\n')));

        engine.on_data(
            b"{\"CallStatus\":{\"state\":\"IN_MEETING\"},\"topKey\":\"CallStatus\",\"type\":\"zStatus\"}\n",
        );
        assert_eq!(*lock(&seen), vec!["IN_MEETING".to_string()]);
    }
}
