use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::CtrlError;
use crate::frame::{CtrlMessage, CH_OUT_OF_SYNC, CH_SYSTEM_MESSAGE, MAX_PAYLOAD};
use crate::outbox::Outbox;
use crate::stack::{Stack, StackEvent};
use crate::system::{self, RtcTime};

/// Host-side capability surface. Called from the session task, one call at
/// a time; implementations must not block.
pub trait CtrlApp: Send + 'static {
    /// A fresh, in-sequence application message (its ACK is already on the
    /// wire).
    fn on_app_message(&mut self, header: u8, tx_sender: u32, payload: &[u8]);

    /// The server acknowledged one of our messages. The header may carry
    /// OUT_OF_SYNC; recovery is handled before this is invoked.
    fn on_ack(&mut self, header: u8, tx_sender: u32);

    fn on_auth_ok(&mut self) {}

    /// Server wall clock arrived in response to a GET_RTC.
    fn rtc_set(&mut self, _rtc: RtcTime) {}
}

/// Connection lifecycle. The WiFi phases exist for hosts that manage the
/// link themselves and report through the same enum; this driver starts at
/// `TcpConnecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    WifiConnecting,
    WifiError,
    TcpConnecting,
    TcpConnected,
    Authenticating,
    Authenticated,
    TcpDisconnected,
}

/// Timer periods and queue sizing. Defaults mirror the protocol's reference
/// deployment; every knob is per-session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long a partial inbound frame may stall before the buffer is
    /// flushed.
    pub data_expecter: Duration,
    /// Pace of the outbox drain, one row per tick.
    pub sender_tick: Duration,
    pub reconnect_delay: Duration,
    /// Applied after `max_connect_failures` consecutive connect errors.
    pub reconnect_delay_long: Duration,
    pub max_connect_failures: u32,
    pub outbox_capacity: usize,
    /// With the outbox off, sends bypass queueing: the caller owns
    /// retransmission and every reconnect starts a fresh sequence.
    pub use_outbox: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            data_expecter: Duration::from_millis(500),
            sender_tick: Duration::from_millis(150),
            reconnect_delay: Duration::from_secs(1),
            reconnect_delay_long: Duration::from_secs(10),
            max_connect_failures: 5,
            outbox_capacity: 64,
            use_outbox: true,
        }
    }
}

enum Command {
    Send { payload: Vec<u8>, notification: bool, reply: oneshot::Sender<Result<(), CtrlError>> },
    SetBackoff(bool),
    GetRtc,
    Keepalive(bool),
    GetState(oneshot::Sender<ConnState>),
    Shutdown,
}

/// Clone-able handle to a running session task.
#[derive(Clone)]
pub struct CtrlHandle {
    tx: mpsc::Sender<Command>,
}

impl CtrlHandle {
    /// Hand a payload to the session. Regular messages are queued in the
    /// outbox (at-least-once); notifications go straight to the wire,
    /// best-effort.
    pub async fn send(&self, payload: &[u8], notification: bool) -> Result<(), CtrlError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send { payload: payload.to_vec(), notification, reply })
            .await
            .map_err(|_| CtrlError::NotConnected)?;
        rx.await.map_err(|_| CtrlError::NotConnected)?
    }

    /// Like [`CtrlHandle::send`] but never waits for a free slot in the
    /// session mailbox.
    pub fn try_send(&self, payload: &[u8], notification: bool) -> Result<(), CtrlError> {
        let (reply, _rx) = oneshot::channel();
        self.tx
            .try_send(Command::Send { payload: payload.to_vec(), notification, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => CtrlError::TransportBusy,
                mpsc::error::TrySendError::Closed(_) => CtrlError::NotConnected,
            })
    }

    pub async fn set_backoff(&self, on: bool) -> Result<(), CtrlError> {
        self.command(Command::SetBackoff(on)).await
    }

    pub async fn get_rtc(&self) -> Result<(), CtrlError> {
        self.command(Command::GetRtc).await
    }

    pub async fn keepalive(&self, on: bool) -> Result<(), CtrlError> {
        self.command(Command::Keepalive(on)).await
    }

    pub async fn state(&self) -> Result<ConnState, CtrlError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::GetState(reply)).await?;
        rx.await.map_err(|_| CtrlError::NotConnected)
    }

    pub async fn shutdown(&self) -> Result<(), CtrlError> {
        self.command(Command::Shutdown).await
    }

    async fn command(&self, cmd: Command) -> Result<(), CtrlError> {
        self.tx.send(cmd).await.map_err(|_| CtrlError::NotConnected)
    }
}

/// The session actor: one task owns the stack, the outbox and every timer,
/// so transport bytes, ticks and API commands are naturally serialized.
pub struct CtrlSession;

impl CtrlSession {
    pub fn spawn<A: CtrlApp>(
        cfg: Config,
        opts: SessionOptions,
        app: A,
    ) -> (CtrlHandle, JoinHandle<()>) {
        let (tx, rx_cmd) = mpsc::channel(32);
        let stack = Stack::new(cfg.base_id, cfg.key);
        let outbox = Outbox::new(opts.outbox_capacity);
        let driver = Driver {
            cfg,
            opts,
            app,
            stack,
            outbox,
            rx_cmd,
            state: ConnState::TcpConnecting,
            synchronized: false,
            oos_count: 0,
            tcp_failures: 0,
            tx_base: 1,
        };
        let join = tokio::spawn(driver.run());
        (CtrlHandle { tx }, join)
    }
}

enum Exit {
    Shutdown,
    Reconnect,
}

struct Driver<A: CtrlApp> {
    cfg: Config,
    opts: SessionOptions,
    app: A,
    stack: Stack,
    outbox: Outbox,
    rx_cmd: mpsc::Receiver<Command>,
    state: ConnState,
    synchronized: bool,
    oos_count: u8,
    tcp_failures: u32,
    /// Raw counter for outbox-disabled mode.
    tx_base: u32,
}

impl<A: CtrlApp> Driver<A> {
    async fn run(mut self) {
        loop {
            self.state = ConnState::TcpConnecting;
            let addr = self.cfg.server_addr();
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    self.tcp_failures = 0;
                    self.state = ConnState::TcpConnected;
                    info!(%addr, "connected");
                    let exit = self.drive(stream).await;
                    self.state = ConnState::TcpDisconnected;
                    self.synchronized = false;
                    if matches!(exit, Exit::Shutdown) {
                        return;
                    }
                    info!("reconnecting in {:?}", self.opts.reconnect_delay);
                    if self.idle_wait(self.opts.reconnect_delay).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(%addr, error = %e, "tcp connect failed");
                    self.tcp_failures += 1;
                    let delay = if self.tcp_failures >= self.opts.max_connect_failures {
                        self.tcp_failures = 0;
                        self.state = ConnState::TcpDisconnected;
                        self.opts.reconnect_delay_long
                    } else {
                        self.opts.reconnect_delay
                    };
                    if self.idle_wait(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Service one live connection until it drops or the host shuts us
    /// down.
    async fn drive(&mut self, stream: TcpStream) -> Exit {
        let (mut rd, mut wr) = stream.into_split();

        // Reconnect ritual: trim what the server already confirmed,
        // schedule the rest for retransmission, and only claim SYNC when
        // nothing is pending.
        self.outbox.flush_acked();
        self.outbox.unsend_all();
        let sync = if self.opts.use_outbox {
            self.outbox.count_unacked() == 0
        } else {
            self.tx_base = 1;
            true
        };
        if sync {
            self.outbox.reset_tx_base();
        }
        self.oos_count = 0;
        self.state = ConnState::Authenticating;
        debug!(sync, "authorizing");

        let mut expecter: Option<Instant> = None;
        let mut sender_at: Option<Instant> = None;

        let events = self.stack.authorize(sync);
        if let Err(exit) = self.perform(events, &mut wr, &mut sender_at).await {
            return exit;
        }

        let mut buf = vec![0u8; 4096];
        loop {
            tokio::select! {
                res = rd.read(&mut buf) => match res {
                    Ok(0) => {
                        info!("server closed the connection");
                        return Exit::Reconnect;
                    }
                    Ok(n) => {
                        let events = self.stack.recv(&buf[..n]);
                        if let Err(exit) = self.perform(events, &mut wr, &mut sender_at).await {
                            return exit;
                        }
                        expecter = self
                            .stack
                            .rx_pending()
                            .then(|| Instant::now() + self.opts.data_expecter);
                    }
                    Err(e) => {
                        warn!(error = %e, "read error");
                        return Exit::Reconnect;
                    }
                },
                cmd = self.rx_cmd.recv() => match cmd {
                    None | Some(Command::Shutdown) => return Exit::Shutdown,
                    Some(cmd) => {
                        if let Err(exit) = self.handle_command(cmd, &mut wr, &mut sender_at).await {
                            return exit;
                        }
                    }
                },
                _ = maybe_sleep(expecter) => {
                    self.stack.on_expecter_timeout();
                    expecter = None;
                }
                _ = maybe_sleep(sender_at) => {
                    sender_at = None;
                    if let Err(exit) = self.sender_tick(&mut wr, &mut sender_at).await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn perform(
        &mut self,
        events: Vec<StackEvent>,
        wr: &mut OwnedWriteHalf,
        sender_at: &mut Option<Instant>,
    ) -> Result<(), Exit> {
        for ev in events {
            match ev {
                StackEvent::Transmit(frame) => write_frame(wr, &frame).await?,
                StackEvent::Message(msg) => self.deliver(msg),
                StackEvent::Acked(msg) => self.handle_ack(msg, sender_at)?,
                StackEvent::AuthOk => {
                    self.state = ConnState::Authenticated;
                    self.synchronized = true;
                    info!(tx_server = self.stack.tx_server(), "authenticated");
                    self.app.on_auth_ok();

                    // first order of business on a fresh session: keep-alive
                    // on, clock synced
                    let mut follow = self.stack.keepalive(true);
                    follow.extend(self.stack.get_rtc());
                    for ev in follow {
                        if let StackEvent::Transmit(frame) = ev {
                            write_frame(wr, &frame).await?;
                        }
                    }

                    if self.opts.use_outbox && self.outbox.count_unacked() > 0 {
                        *sender_at = Some(Instant::now() + self.opts.sender_tick);
                    }
                }
            }
        }
        Ok(())
    }

    fn deliver(&mut self, msg: CtrlMessage) {
        if msg.has(CH_SYSTEM_MESSAGE) {
            // private Base<->Server traffic, not for the application
            match system::parse_rtc(&msg.payload) {
                Some(rtc) => {
                    debug!(?rtc, "rtc update from server");
                    self.app.rtc_set(rtc);
                }
                None => debug!(
                    code = msg.payload.first().copied().unwrap_or(0),
                    "unhandled system message"
                ),
            }
            return;
        }
        self.app.on_app_message(msg.header, msg.tx_sender, &msg.payload);
    }

    fn handle_ack(
        &mut self,
        msg: CtrlMessage,
        sender_at: &mut Option<Instant>,
    ) -> Result<(), Exit> {
        let mut out = Ok(());
        if msg.has(CH_OUT_OF_SYNC) {
            self.oos_count += 1;
            warn!(report = self.oos_count, "server reports out-of-sync");
            if self.oos_count >= 3 {
                // nothing left to salvage: wipe the queue and let the auth
                // handshake re-sync us on reconnect
                warn!(error = %CtrlError::OutOfSyncFatal, "wiping outbox and disconnecting");
                self.oos_count = 0;
                self.outbox.delete_all();
                *sender_at = None;
                out = Err(Exit::Reconnect);
            } else {
                self.outbox.unsend_all();
                if self.opts.use_outbox {
                    *sender_at = Some(Instant::now() + self.opts.sender_tick);
                }
            }
        } else {
            self.oos_count = 0;
            self.outbox.ack(msg.tx_sender);
        }
        self.app.on_ack(msg.header, msg.tx_sender);
        out
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        wr: &mut OwnedWriteHalf,
        sender_at: &mut Option<Instant>,
    ) -> Result<(), Exit> {
        match cmd {
            Command::Send { payload, notification, reply } => {
                self.submit(payload, notification, reply, wr, sender_at).await?;
            }
            Command::SetBackoff(on) => self.stack.set_backoff(on),
            Command::GetRtc => {
                let events = self.stack.get_rtc();
                self.perform(events, wr, sender_at).await?;
            }
            Command::Keepalive(on) => {
                let events = self.stack.keepalive(on);
                self.perform(events, wr, sender_at).await?;
            }
            Command::GetState(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Shutdown => unreachable!("handled by the select loop"),
        }
        Ok(())
    }

    async fn submit(
        &mut self,
        payload: Vec<u8>,
        notification: bool,
        reply: oneshot::Sender<Result<(), CtrlError>>,
        wr: &mut OwnedWriteHalf,
        sender_at: &mut Option<Instant>,
    ) -> Result<(), Exit> {
        if payload.len() > MAX_PAYLOAD {
            let _ = reply.send(Err(CtrlError::PayloadTooLong));
            return Ok(());
        }

        if notification || !self.opts.use_outbox {
            // straight to the wire, no queue and no delivery order
            if self.state != ConnState::Authenticated
                || (self.opts.use_outbox && !self.synchronized)
            {
                let _ = reply.send(Err(CtrlError::NotConnected));
                return Ok(());
            }
            let tx_sender = if self.opts.use_outbox {
                0 // notifications are not sequence-bound
            } else {
                let t = self.tx_base;
                self.tx_base = self.tx_base.wrapping_add(1);
                t
            };
            match self.stack.send(&payload, tx_sender, notification) {
                Ok(events) => {
                    let _ = reply.send(Ok(()));
                    self.perform(events, wr, sender_at).await?;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            return Ok(());
        }

        if !self.synchronized {
            let _ = reply.send(Err(CtrlError::NotSynchronized));
            return Ok(());
        }
        match self.outbox.add(payload) {
            Ok(tx_base) => {
                debug!(tx_base, "queued");
                let _ = reply.send(Ok(()));
                *sender_at = Some(Instant::now() + self.opts.sender_tick);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
        Ok(())
    }

    /// Emit at most one outbox row, then rearm. The one-row pace keeps the
    /// loop responsive and gives the server breathing room.
    async fn sender_tick(
        &mut self,
        wr: &mut OwnedWriteHalf,
        sender_at: &mut Option<Instant>,
    ) -> Result<(), Exit> {
        if self.state != ConnState::Authenticated || !self.synchronized || !self.opts.use_outbox {
            debug!("sender tick while not authed or synced");
            return Ok(());
        }
        let Some(row) = self.outbox.next_unsent() else {
            return Ok(());
        };
        let tx_base = row.tx_base;
        let payload = row.payload.clone();

        let events = match self.stack.send(&payload, tx_base, false) {
            Ok(events) => events,
            Err(e) => {
                warn!(tx_base, error = %e, "unencodable outbox row dropped");
                self.outbox.ack(tx_base);
                self.outbox.flush_acked();
                *sender_at = Some(Instant::now() + self.opts.sender_tick);
                return Ok(());
            }
        };

        self.outbox.mark_sent(tx_base);
        for ev in events {
            if let StackEvent::Transmit(frame) = ev {
                if let Err(e) = wr.write_all(&frame).await {
                    warn!(tx_base, error = %e, "transport write failed");
                    // keep at-least-once alive: the row goes back into the
                    // queue before we tear the connection down
                    self.outbox.mark_unsent(tx_base);
                    return Err(Exit::Reconnect);
                }
            }
        }
        *sender_at = Some(Instant::now() + self.opts.sender_tick);
        Ok(())
    }

    /// Between connections: answer commands without a transport.
    async fn idle_wait(&mut self, dur: Duration) -> bool {
        let deadline = Instant::now() + dur;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                cmd = self.rx_cmd.recv() => match cmd {
                    None | Some(Command::Shutdown) => return true,
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(CtrlError::NotConnected));
                    }
                    Some(Command::SetBackoff(on)) => self.stack.set_backoff(on),
                    Some(Command::GetState(reply)) => {
                        let _ = reply.send(self.state);
                    }
                    Some(Command::GetRtc) | Some(Command::Keepalive(_)) => {
                        debug!("system command while disconnected, dropped");
                    }
                }
            }
        }
    }
}

async fn write_frame(wr: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), Exit> {
    wr.write_all(frame).await.map_err(|e| {
        warn!(error = %e, "transport write failed");
        Exit::Reconnect
    })
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(t) => sleep_until(t).await,
        None => std::future::pending().await,
    }
}
