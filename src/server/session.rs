//! Established device sessions.
//!
//! A `DeviceSession` owns the framed encrypted socket left behind by a
//! completed handshake. A reader task decrypts and dispatches inbound
//! messages in arrival order; a writer task encrypts outbound messages with
//! a strictly monotonic counter. Upper layers talk to the session through a
//! plain handle: `send_message`, `listen_for`, the ownership token, and an
//! internal event stream that is distinct from the user-facing event bus.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::config::SessionConfig;
use crate::crypto::{CipherStream, DecipherStream};
use crate::error::{Result, SessionError};
use crate::protocol::{CoapMessage, MessageName, Token};
use crate::server::handshake::HandshakeOutcome;
use crate::types::{ConnectionKey, DeviceId, MessageCounter, TrafficStats};

/// Events the session raises for in-process observers.
///
/// This is the session's internal bus; it is not the user-facing event
/// publisher.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Any inbound message, after counter validation.
    Message {
        name: Option<MessageName>,
        message: CoapMessage,
    },
    /// An inbound `ChunkMissed`, surfaced for the flasher.
    ChunkMissed(CoapMessage),
    /// The session closed.
    Disconnect { cause: String },
}

/// Extra request parameters for [`DeviceSession::send_message`].
#[derive(Debug, Clone, Default)]
pub struct MessageParams {
    /// Additional Uri-Path segment after the canonical one.
    pub uri_segment: Option<String>,
    /// Uri-Query values, in order.
    pub queries: Vec<Vec<u8>>,
    /// Token for response correlation.
    pub token: Option<Token>,
    /// Message payload.
    pub payload: Vec<u8>,
}

struct Listener {
    id: u64,
    name: MessageName,
    uri: Option<String>,
    token: Option<Token>,
    tx: oneshot::Sender<CoapMessage>,
}

impl Listener {
    fn matches(&self, name: Option<MessageName>, msg: &CoapMessage) -> bool {
        let name_ok = match self.name.spec() {
            crate::protocol::MessageSpec::Response { .. } => self.name.matches(msg),
            _ => name == Some(self.name),
        };
        if !name_ok {
            return false;
        }
        if let Some(uri) = &self.uri {
            if msg.uri_path() != *uri {
                return false;
            }
        }
        if let Some(token) = &self.token {
            if msg.token != *token {
                return false;
            }
        }
        true
    }
}

enum Outbound {
    Message(CoapMessage),
}

/// Deregisters a listener whose wait was dropped before it matched: a
/// lost `select!` race or an expired timeout must not leave its entry
/// behind for the life of the session.
struct ListenerGuard {
    id: u64,
    listeners: Arc<Mutex<Vec<Listener>>>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.listeners.lock().retain(|l| l.id != self.id);
    }
}

/// Handle to one established device session.
pub struct DeviceSession {
    device_id: DeviceId,
    connection_key: ConnectionKey,
    outbound: mpsc::UnboundedSender<Outbound>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    owner: Mutex<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    next_message_id: AtomicU32,
    next_token: AtomicU32,
    next_listener_id: AtomicU64,
    inbound_counter: AtomicU32,
    last_inbound: Mutex<Instant>,
    stats: Mutex<TrafficStats>,
}

impl DeviceSession {
    /// Take over a completed handshake and start the session tasks.
    ///
    /// Sends the server `Hello` (announcing the random outbound counter),
    /// then replays any frames buffered during the handshake window before
    /// reading from the socket.
    pub fn spawn<S>(outcome: HandshakeOutcome<S>, config: &SessionConfig) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let HandshakeOutcome {
            device_id,
            framed,
            cipher,
            decipher,
            session_key,
            hello,
            pending,
        } = outcome;
        drop(session_key);
        drop(hello);

        let (sink, stream) = framed.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = Arc::new(Self {
            device_id,
            connection_key: ConnectionKey::new(),
            outbound: outbound_tx,
            listeners: Arc::new(Mutex::new(Vec::new())),
            owner: Mutex::new(None),
            events: events_tx,
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
            next_message_id: AtomicU32::new(u32::from(rand::random::<u16>())),
            next_token: AtomicU32::new(1),
            next_listener_id: AtomicU64::new(1),
            inbound_counter: AtomicU32::new(decipher.expected_counter().0),
            last_inbound: Mutex::new(Instant::now()),
            stats: Mutex::new(TrafficStats::default()),
        });

        // The server Hello announces the counter all later outbound
        // messages run from.
        let announced = MessageCounter::new(rand::random::<u32>());
        let server_hello = MessageName::Hello
            .build(session.alloc_message_id())
            .with_payload(announced.to_be_bytes().to_vec());

        tokio::spawn(writer_task(
            sink,
            outbound_rx,
            shutdown_rx.clone(),
            Arc::clone(&session),
            server_hello,
            announced,
            cipher,
        ));

        tokio::spawn(reader_task(
            stream,
            decipher,
            shutdown_rx,
            Arc::clone(&session),
            pending,
            config.ping_interval(),
        ));

        debug!(device_id = %device_id, connection = %session.connection_key, "session started");
        session
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn connection_key(&self) -> ConnectionKey {
        self.connection_key
    }

    /// Subscribe to the session's internal events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Whether the session is still up.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// The next counter value expected from the device.
    pub fn expected_counter(&self) -> MessageCounter {
        MessageCounter::new(self.inbound_counter.load(Ordering::SeqCst))
    }

    /// Allocate a fresh outbound message id.
    pub fn alloc_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::SeqCst) as u16
    }

    /// Allocate a fresh non-empty token for response correlation.
    pub fn alloc_token(&self) -> Token {
        let raw = self.next_token.fetch_add(1, Ordering::SeqCst);
        Token::from_u8((raw % 255 + 1) as u8)
    }

    /// Claim exclusive send rights. Returns false if another owner holds
    /// them already.
    pub fn take_ownership(&self, owner: &str) -> bool {
        let mut current = self.owner.lock();
        match current.as_deref() {
            None => {
                *current = Some(owner.to_string());
                true
            }
            Some(existing) => existing == owner,
        }
    }

    /// Release previously claimed send rights.
    pub fn release_ownership(&self, owner: &str) -> bool {
        let mut current = self.owner.lock();
        if current.as_deref() == Some(owner) {
            *current = None;
            true
        } else {
            false
        }
    }

    fn may_send(&self, owner: Option<&str>) -> bool {
        let current = self.owner.lock();
        match (current.as_deref(), owner) {
            (None, _) => true,
            (Some(held), Some(caller)) => held == caller,
            (Some(_), None) => false,
        }
    }

    /// Serialise, encrypt, frame, and write a request message.
    ///
    /// Returns false without writing when the socket is closed or a
    /// different owner holds the session.
    pub fn send_message(
        &self,
        name: MessageName,
        params: MessageParams,
        owner: Option<&str>,
    ) -> bool {
        if !self.is_open() || !self.may_send(owner) {
            return false;
        }

        let mut msg = name.build(self.alloc_message_id());
        if let Some(segment) = params.uri_segment {
            msg = msg.with_uri_path(segment);
        }
        for query in params.queries {
            msg = msg.with_uri_query(query);
        }
        if let Some(token) = params.token {
            msg = msg.with_token(token);
        }
        if !params.payload.is_empty() {
            msg = msg.with_payload(params.payload);
        }

        self.outbound.send(Outbound::Message(msg)).is_ok()
    }

    /// Acknowledge an inbound message.
    ///
    /// Replies bypass the ownership check: background dispatch continues
    /// even while an owner holds the session.
    pub fn send_reply(
        &self,
        name: MessageName,
        message_id: u16,
        token: Option<Token>,
        payload: Vec<u8>,
    ) -> bool {
        if !self.is_open() {
            return false;
        }
        let mut msg = name.build(message_id);
        if let Some(token) = token {
            msg = msg.with_token(token);
        }
        if !payload.is_empty() {
            msg = msg.with_payload(payload);
        }
        self.outbound.send(Outbound::Message(msg)).is_ok()
    }

    /// One-shot wait for the next inbound message matching `name` (and,
    /// when given, `uri` and `token`).
    ///
    /// The listener registers before this returns, so a caller can
    /// register, then send, then await without racing the reply, and it
    /// deregisters when the returned future is dropped unmatched. Multiple
    /// concurrent listens are allowed; the first match wins and the rest
    /// stay pending.
    pub fn listen_for(
        &self,
        name: MessageName,
        uri: Option<&str>,
        token: Option<Token>,
    ) -> impl std::future::Future<Output = Result<CoapMessage>> + Send + 'static {
        let registered = if self.is_open() {
            let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            self.listeners.lock().push(Listener {
                id,
                name,
                uri: uri.map(str::to_string),
                token,
                tx,
            });
            let guard = ListenerGuard {
                id,
                listeners: Arc::clone(&self.listeners),
            };
            // The session may have closed between the check and the
            // insert; the guard removes the stranded registration rather
            // than letting a caller wait forever.
            if self.is_open() {
                Ok((guard, rx))
            } else {
                Err(SessionError::Closed)
            }
        } else {
            Err(SessionError::Closed)
        };

        async move {
            match registered {
                // The guard lives across the await: dropping this future
                // early removes the listener entry.
                Ok((_guard, rx)) => rx.await.map_err(|_| SessionError::Closed.into()),
                Err(e) => Err(e.into()),
            }
        }
    }

    /// Number of registered one-shot listeners.
    pub fn pending_listens(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Snapshot of the session's traffic statistics.
    pub fn stats(&self) -> TrafficStats {
        *self.stats.lock()
    }

    fn record_sent(&self, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.bytes_sent += bytes as u64;
        stats.messages_sent += 1;
    }

    fn record_received(&self, bytes: usize) {
        let mut stats = self.stats.lock();
        stats.bytes_received += bytes as u64;
        stats.messages_received += 1;
    }

    /// Call a device function and await its return value.
    pub async fn call_function(&self, function: &str, args: &str) -> Result<CoapMessage> {
        let token = self.alloc_token();
        let listen = self.listen_for(MessageName::FunctionReturn, None, Some(token.clone()));
        let sent = self.send_message(
            MessageName::FunctionCall,
            MessageParams {
                uri_segment: Some(function.to_string()),
                queries: vec![args.as_bytes().to_vec()],
                token: Some(token),
                payload: Vec::new(),
            },
            None,
        );
        if !sent {
            return Err(SessionError::Closed.into());
        }
        with_reply_deadline(listen).await
    }

    /// Read a device variable.
    pub async fn get_variable(&self, variable: &str) -> Result<CoapMessage> {
        let token = self.alloc_token();
        let listen = self.listen_for(MessageName::VariableValue, None, Some(token.clone()));
        let sent = self.send_message(
            MessageName::VariableRequest,
            MessageParams {
                uri_segment: Some(variable.to_string()),
                token: Some(token),
                ..Default::default()
            },
            None,
        );
        if !sent {
            return Err(SessionError::Closed.into());
        }
        with_reply_deadline(listen).await
    }

    /// Ask the device to describe its functions and variables.
    pub async fn describe(&self) -> Result<CoapMessage> {
        let token = self.alloc_token();
        let listen = self.listen_for(MessageName::DescribeReturn, None, Some(token.clone()));
        let sent = self.send_message(
            MessageName::Describe,
            MessageParams {
                token: Some(token),
                ..Default::default()
            },
            None,
        );
        if !sent {
            return Err(SessionError::Closed.into());
        }
        with_reply_deadline(listen).await
    }

    /// Start or stop the device's visual signal (rainbow LED).
    pub fn signal(&self, on: bool) -> bool {
        self.send_message(
            MessageName::SignalStart,
            MessageParams {
                queries: vec![vec![u8::from(on)]],
                ..Default::default()
            },
            None,
        )
    }

    /// Tear the session down with a cause.
    pub fn close(&self, cause: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(device_id = %self.device_id, cause, "session closing");
        let _ = self.shutdown.send(true);
        // Wake pending listens with a closed error.
        self.listeners.lock().clear();
        let _ = self.events.send(SessionEvent::Disconnect {
            cause: cause.to_string(),
        });
    }

    /// Route one decrypted, parsed inbound message.
    fn dispatch(&self, msg: CoapMessage) {
        *self.last_inbound.lock() = Instant::now();
        let name = MessageName::from_request(&msg);
        trace!(device_id = %self.device_id, ?name, id = msg.message_id, "inbound");

        // Session-level autoresponders.
        match name {
            Some(MessageName::Ping) => {
                let _ = self.send_reply(MessageName::PingAck, msg.message_id, None, Vec::new());
            }
            Some(MessageName::GetTime) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as u32;
                let _ = self.send_reply(
                    MessageName::TimeReturn,
                    msg.message_id,
                    Some(msg.token.clone()),
                    now.to_be_bytes().to_vec(),
                );
            }
            _ => {}
        }

        // First matching one-shot listener wins. A listener whose receiver
        // was dropped (a cancelled wait) must not eat the message, so keep
        // trying until a delivery sticks.
        {
            let mut listeners = self.listeners.lock();
            while let Some(index) = listeners.iter().position(|l| l.matches(name, &msg)) {
                let listener = listeners.remove(index);
                if listener.tx.send(msg.clone()).is_ok() {
                    break;
                }
            }
        }

        if name == Some(MessageName::ChunkMissed) {
            let _ = self.events.send(SessionEvent::ChunkMissed(msg.clone()));
        }

        let _ = self.events.send(SessionEvent::Message { name, message: msg });
    }
}

/// Deadline applied to request/response helpers.
async fn with_reply_deadline(
    listen: impl std::future::Future<Output = Result<CoapMessage>>,
) -> Result<CoapMessage> {
    tokio::time::timeout(Duration::from_secs(30), listen)
        .await
        .map_err(|_| SessionError::Io("reply timeout".into()))?
}

/// Writer half: encrypts in submission order with the monotonic counter.
async fn writer_task<W>(
    mut sink: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut shutdown: watch::Receiver<bool>,
    session: Arc<DeviceSession>,
    server_hello: CoapMessage,
    announced: MessageCounter,
    mut cipher: CipherStream,
) where
    W: futures::Sink<Bytes, Error = crate::Error> + Unpin,
{
    // The Hello itself still runs on the key-derived counter; everything
    // after runs from the announced one.
    let encode_send = |cipher: &mut CipherStream, msg: &CoapMessage| -> Option<Bytes> {
        match msg.encode() {
            Ok(plain) => Some(Bytes::from(cipher.encrypt_next(&plain))),
            Err(e) => {
                warn!(error = %e, "dropping unencodable outbound message");
                None
            }
        }
    };

    if let Some(frame) = encode_send(&mut cipher, &server_hello) {
        session.record_sent(frame.len());
        if sink.send(frame).await.is_err() {
            session.close("socket write failed");
            return;
        }
    }
    cipher.set_counter(announced);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            outbound = rx.recv() => {
                let Some(Outbound::Message(msg)) = outbound else { break };
                let Some(frame) = encode_send(&mut cipher, &msg) else { continue };
                session.record_sent(frame.len());
                if sink.send(frame).await.is_err() {
                    session.close("socket write failed");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Reader half: strict arrival-order decrypt, counter check, dispatch.
async fn reader_task<R>(
    mut stream: R,
    mut decipher: DecipherStream,
    mut shutdown: watch::Receiver<bool>,
    session: Arc<DeviceSession>,
    pending: Vec<CoapMessage>,
    ping_interval: Duration,
) where
    R: futures::Stream<Item = std::result::Result<Bytes, crate::Error>> + Unpin,
{
    // Messages buffered during the handshake window come first; the
    // counter already advanced past them while the handshake decrypted.
    session
        .inbound_counter
        .store(decipher.expected_counter().0, Ordering::SeqCst);
    for msg in pending {
        session.dispatch(msg);
    }

    let mut ticker = tokio::time::interval(ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    None => {
                        session.close("socket closed");
                        break;
                    }
                    Some(Err(e)) => {
                        session.close(&format!("read failed: {e}"));
                        break;
                    }
                    Some(Ok(frame)) => {
                        let expected = decipher.expected_counter();
                        let plain = match decipher.decrypt_next(&frame) {
                            Ok(p) => p,
                            Err(_) => {
                                session.close(&SessionError::CounterMismatch {
                                    expected: expected.0,
                                }
                                .to_string());
                                break;
                            }
                        };
                        let msg = match CoapMessage::decode(&plain) {
                            Ok(m) => m,
                            Err(e) => {
                                session.close(&e.to_string());
                                break;
                            }
                        };
                        session.record_received(frame.len());
                        session
                            .inbound_counter
                            .store(decipher.expected_counter().0, Ordering::SeqCst);
                        session.dispatch(msg);
                    }
                }
            }
            _ = ticker.tick() => {
                let idle = session.last_inbound.lock().elapsed();
                if idle > ping_interval * 2 {
                    session.close("ping timeout");
                    break;
                }
                if idle > ping_interval {
                    let id = session.alloc_message_id();
                    let _ = session
                        .outbound
                        .send(Outbound::Message(MessageName::SocketPing.build(id)));
                }
            }
        }
    }
}
