//! WebSocket transport for the race server
//!
//! One background thread per client owns the socket and the reconnect
//! loop; the handle on the caller's thread implements the session's
//! [`IntentSink`]/[`EventSource`] seams over bounded channels. All
//! policy decisions (backoff, pending queue, clean-close rules) come
//! from [`ConnectionManager`]; this module only executes them.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect, Message, WebSocket};

use crate::core::connection::{BackoffPolicy, ConnectionManager, Retry};
use crate::core::error::{ProtocolError, TransportError};
use crate::core::io::{EventSource, IntentSink, LinkStatus, WireEvent};
use crate::core::protocol::{decode_event, encode_intent, Intent};

/// Poll interval of the client thread while connected.
const LOOP_IDLE: Duration = Duration::from_millis(10);

/// How often the thread re-probes while the network itself is down.
const OFFLINE_PROBE: Duration = Duration::from_secs(1);

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

// =============================================================================
// COMMANDS
// =============================================================================

/// Handle -> thread.
#[derive(Debug)]
enum Command {
    Send(Intent),
    Reconnect,
    Shutdown,
}

/// Why the connected message loop ended.
enum CloseReason {
    /// Normal-closure code from either side.
    Clean,
    /// Anything else: read error, abrupt close, send failure.
    Dirty(String),
    /// The handle asked for a fresh connection.
    ReconnectRequested,
    /// The handle is shutting the client down.
    Shutdown,
}

// =============================================================================
// CLIENT HANDLE
// =============================================================================

/// Thread-backed WebSocket client for one race view.
///
/// The handle is the session's intent sink and event source; dropping
/// it disconnects cleanly.
pub struct RaceClient {
    tx: Option<Sender<Command>>,
    rx: Option<Receiver<WireEvent>>,
    thread_handle: Option<JoinHandle<()>>,
    shutdown_flag: Arc<AtomicBool>,
    race_over: Arc<AtomicBool>,
    current_status: LinkStatus,
}

impl RaceClient {
    /// Open a connection to `url` and start the client thread.
    pub fn connect(url: &str, policy: BackoffPolicy) -> Self {
        let (command_tx, command_rx) = bounded::<Command>(128);
        let (event_tx, event_rx) = bounded::<WireEvent>(128);

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let race_over = Arc::new(AtomicBool::new(false));

        let thread_shutdown = Arc::clone(&shutdown_flag);
        let thread_race_over = Arc::clone(&race_over);
        let url = url.to_string();

        let handle = thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                client_thread(
                    &url,
                    policy,
                    command_rx,
                    event_tx.clone(),
                    thread_shutdown,
                    thread_race_over,
                );
            }));

            if result.is_err() {
                error!("[WS] Client thread panic");
                let _ = event_tx.send(WireEvent::Fault("client thread panic".to_string()));
                let _ = event_tx.send(WireEvent::Status(LinkStatus::Failed));
            }
        });

        Self {
            tx: Some(command_tx),
            rx: Some(event_rx),
            thread_handle: Some(handle),
            shutdown_flag,
            race_over,
            current_status: LinkStatus::Connecting,
        }
    }

    pub fn status(&self) -> LinkStatus {
        self.current_status
    }

    pub fn is_connected(&self) -> bool {
        self.current_status.is_connected()
    }

    fn disconnect(&mut self) {
        self.shutdown_flag.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.tx {
            let _ = tx.send(Command::Shutdown);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.tx = None;
        self.rx = None;
        self.current_status = LinkStatus::Disconnected;
    }
}

impl IntentSink for RaceClient {
    fn send(&mut self, intent: Intent) -> Result<(), TransportError> {
        let Some(tx) = &self.tx else {
            return Err(TransportError::Closed);
        };
        match tx.try_send(Command::Send(intent)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Closed),
        }
    }

    fn request_reconnect(&mut self) {
        if let Some(tx) = &self.tx {
            if tx.try_send(Command::Reconnect).is_err() {
                warn!("[WS] Failed to queue reconnect request");
            }
        }
    }

    fn mark_race_over(&mut self) {
        self.race_over.store(true, Ordering::SeqCst);
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

impl EventSource for RaceClient {
    fn poll_event(&mut self) -> Option<WireEvent> {
        let rx = self.rx.as_ref()?;
        match rx.try_recv() {
            Ok(event) => {
                if let WireEvent::Status(status) = &event {
                    self.current_status = *status;
                }
                Some(event)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.current_status = LinkStatus::Disconnected;
                None
            }
        }
    }
}

impl Drop for RaceClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// =============================================================================
// CLIENT THREAD
// =============================================================================

fn client_thread(
    url: &str,
    policy: BackoffPolicy,
    command_rx: Receiver<Command>,
    event_tx: Sender<WireEvent>,
    shutdown_flag: Arc<AtomicBool>,
    race_over: Arc<AtomicBool>,
) {
    let mut mgr = ConnectionManager::new(policy);

    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            break;
        }

        mgr.connecting();
        let _ = event_tx.send(WireEvent::Status(mgr.status()));
        info!(url = %url, "[WS] Connecting...");

        let retry = match connect(url) {
            Ok((mut socket, _)) => {
                set_nonblocking(&socket);

                let mut flush_failure = None;
                let mut queued: VecDeque<Intent> = mgr.opened().into();
                let _ = event_tx.send(WireEvent::Status(LinkStatus::Connected));
                if !queued.is_empty() {
                    info!(count = queued.len(), "[WS] Flushing pending intents");
                }
                while let Some(intent) = queued.pop_front() {
                    if let Err(e) = send_intent(&mut socket, &intent) {
                        // Put the unsent tail back, in original order
                        mgr.dispatch(intent);
                        for rest in queued.drain(..) {
                            mgr.dispatch(rest);
                        }
                        flush_failure = Some(e);
                        break;
                    }
                }

                let reason = match flush_failure {
                    Some(e) => CloseReason::Dirty(e),
                    None => message_loop(&mut socket, &command_rx, &event_tx, &shutdown_flag),
                };
                let _ = socket.close(None);

                match reason {
                    CloseReason::Shutdown => break,
                    CloseReason::Clean => {
                        info!("[WS] Closed cleanly");
                        mgr.closed(true, race_over.load(Ordering::SeqCst))
                    }
                    CloseReason::Dirty(detail) => {
                        warn!(detail = %detail, "[WS] Disconnected");
                        let _ = event_tx.send(WireEvent::Fault(detail));
                        mgr.closed(false, race_over.load(Ordering::SeqCst))
                    }
                    CloseReason::ReconnectRequested => {
                        info!("[WS] Reconnect requested");
                        mgr.manual_retry()
                    }
                }
            }
            Err(e) => {
                let network_down = is_network_down(&e);
                warn!(error = %e, network_down, "[WS] Connection attempt failed");
                let _ = event_tx.send(WireEvent::Fault(e.to_string()));
                mgr.connect_failed(network_down)
            }
        };

        match retry {
            Retry::After(delay) => {
                let _ = event_tx.send(WireEvent::Status(LinkStatus::Reconnecting));
                info!(delay_ms = delay.as_millis() as u64, "[WS] Reconnecting after backoff");
                if !wait_out(delay, &command_rx, &mut mgr, &shutdown_flag) {
                    break;
                }
            }
            Retry::Offline => {
                let _ = event_tx.send(WireEvent::Status(LinkStatus::Reconnecting));
                debug!("[WS] Network down, probing");
                if !wait_out(OFFLINE_PROBE, &command_rx, &mut mgr, &shutdown_flag) {
                    break;
                }
            }
            Retry::GiveUp => {
                let _ = event_tx.send(WireEvent::Status(LinkStatus::Failed));
                error!("[WS] Reconnection attempts exhausted");
                if !idle_until_retry(&command_rx, &mut mgr, &shutdown_flag, false) {
                    break;
                }
            }
            Retry::No => {
                let _ = event_tx.send(WireEvent::Status(LinkStatus::Disconnected));
                // A queued intent re-opens the connection; a clean close
                // alone does not.
                if !idle_until_retry(&command_rx, &mut mgr, &shutdown_flag, true) {
                    break;
                }
            }
        }
    }

    let _ = event_tx.send(WireEvent::Status(LinkStatus::Disconnected));
    debug!("[WS] Client thread exiting");
}

/// Sleep through a backoff delay while still queueing intents and
/// honoring reconnect/shutdown commands. Returns false on shutdown.
fn wait_out(
    delay: Duration,
    command_rx: &Receiver<Command>,
    mgr: &mut ConnectionManager,
    shutdown_flag: &Arc<AtomicBool>,
) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            return false;
        }
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        match command_rx.recv_timeout(left.min(LOOP_IDLE * 5)) {
            Ok(Command::Send(intent)) => {
                let _ = mgr.dispatch(intent);
            }
            // An explicit request skips the rest of the delay
            Ok(Command::Reconnect) => return true,
            Ok(Command::Shutdown) => return false,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return false,
        }
    }
}

/// Park after a clean close or exhausted backoff. Returns false on
/// shutdown. When `sends_wake` is set, a queued intent triggers a fresh
/// connection round; from the terminal failed state only an explicit
/// retry does.
fn idle_until_retry(
    command_rx: &Receiver<Command>,
    mgr: &mut ConnectionManager,
    shutdown_flag: &Arc<AtomicBool>,
    sends_wake: bool,
) -> bool {
    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            return false;
        }
        match command_rx.recv_timeout(LOOP_IDLE * 5) {
            Ok(Command::Send(intent)) => {
                let _ = mgr.dispatch(intent);
                if sends_wake {
                    return true;
                }
            }
            Ok(Command::Reconnect) => {
                mgr.manual_retry();
                return true;
            }
            Ok(Command::Shutdown) => return false,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return false,
        }
    }
}

// =============================================================================
// MESSAGE LOOP
// =============================================================================

fn message_loop(
    socket: &mut Socket,
    command_rx: &Receiver<Command>,
    event_tx: &Sender<WireEvent>,
    shutdown_flag: &Arc<AtomicBool>,
) -> CloseReason {
    loop {
        if shutdown_flag.load(Ordering::SeqCst) {
            return CloseReason::Shutdown;
        }

        // Outgoing
        match command_rx.try_recv() {
            Ok(Command::Send(intent)) => {
                if let Err(e) = send_intent(socket, &intent) {
                    return CloseReason::Dirty(e);
                }
            }
            Ok(Command::Reconnect) => return CloseReason::ReconnectRequested,
            Ok(Command::Shutdown) => return CloseReason::Shutdown,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return CloseReason::Shutdown,
        }

        // Incoming
        match socket.read() {
            Ok(Message::Text(text)) => match decode_event(&text) {
                Ok(event) => {
                    if event_tx.send(WireEvent::Envelope(event)).is_err() {
                        return CloseReason::Shutdown;
                    }
                }
                // Protocol violations are logged and dropped, never fatal
                Err(ProtocolError::UnknownKind { kind }) => {
                    debug!(kind = %kind, "[WS] Unknown envelope kind, dropped");
                }
                Err(e) => {
                    warn!(error = %e, "[WS] Malformed envelope, dropped");
                }
            },
            Ok(Message::Close(frame)) => {
                let clean = frame
                    .as_ref()
                    .map(|f| f.code == CloseCode::Normal)
                    .unwrap_or(false);
                return if clean {
                    CloseReason::Clean
                } else {
                    CloseReason::Dirty(format!("close frame: {frame:?}"))
                };
            }
            Ok(_) => {} // ping/pong/binary: nothing to do
            Err(tungstenite::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(tungstenite::Error::ConnectionClosed) => return CloseReason::Clean,
            Err(e) => return CloseReason::Dirty(format!("read error: {e}")),
        }

        thread::sleep(LOOP_IDLE);
    }
}

fn send_intent(socket: &mut Socket, intent: &Intent) -> Result<(), String> {
    let json = encode_intent(intent).map_err(|e| e.to_string())?;
    socket
        .send(Message::Text(json))
        .map_err(|e| format!("send error: {e}"))
}

fn set_nonblocking(socket: &Socket) {
    match socket.get_ref() {
        MaybeTlsStream::Plain(tcp) => {
            let _ = tcp.set_nonblocking(true);
        }
        MaybeTlsStream::NativeTls(tls) => {
            let _ = tls.get_ref().set_nonblocking(true);
        }
        _ => {}
    }
}

fn is_network_down(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::NetworkUnreachable
                | std::io::ErrorKind::NetworkDown
                | std::io::ErrorKind::HostUnreachable
        ),
        _ => false,
    }
}
