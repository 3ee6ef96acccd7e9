use bytes::BytesMut;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::ZERO_KEY;
use crate::error::CtrlError;
use crate::frame::{
    CtrlMessage, FrameCodec, CH_ACK, CH_BACKOFF, CH_NOTIFICATION, CH_OUT_OF_SYNC, CH_PROCESSED,
    CH_SAVE_TXSERVER, CH_SYNC, CH_SYSTEM_MESSAGE,
};
use crate::rxbuf::RxBuffer;
use crate::system::{SM_GET_RTC, SM_KEEPALIVE_OFF, SM_KEEPALIVE_ON};

/// Side effects the core asks its driver to carry out, in order.
#[derive(Debug)]
pub enum StackEvent {
    /// Write one encoded frame to the transport.
    Transmit(BytesMut),
    /// A fresh in-sequence message (application or system). Always queued
    /// after its own ACK's `Transmit`, so application work cannot delay the
    /// acknowledgement.
    Message(CtrlMessage),
    /// The peer acknowledged one of our frames.
    Acked(CtrlMessage),
    /// Authentication completed; `tx_server` is valid from here on.
    AuthOk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Idle,
    /// base-id sent, waiting for the challenge (zero key active).
    Phase1,
    /// challenge answered, waiting for the verdict (session key active).
    Phase2,
    Done,
}

/// The synchronous protocol core: authentication handshake, TXserver
/// accounting, ACK generation and the backoff barrier.
///
/// The stack never touches a socket or a clock. Entry points return the
/// [`StackEvent`]s they produced and the driver performs them; timers are
/// signalled through [`Stack::rx_pending`] / [`Stack::on_expecter_timeout`].
pub struct Stack {
    codec: FrameCodec,
    rx: RxBuffer,
    base_id: [u8; 16],
    key: [u8; 16],
    auth: AuthState,
    auth_sync: bool,
    tx_server: u32,
    backoff: bool,
    safe_to_unbackoff: bool,
    events: Vec<StackEvent>,
}

impl Stack {
    pub fn new(base_id: [u8; 16], key: [u8; 16]) -> Self {
        Self {
            codec: FrameCodec::new(),
            rx: RxBuffer::new(),
            base_id,
            key,
            auth: AuthState::Idle,
            auth_sync: false,
            tx_server: 0,
            backoff: false,
            safe_to_unbackoff: true,
            events: Vec::new(),
        }
    }

    /// Start the challenge/response handshake. `sync` tells the server we
    /// have nothing pending and both sides should reset their counters.
    ///
    /// Any half-received frame from the previous connection is dropped: the
    /// rest of it will never arrive.
    pub fn authorize(&mut self, sync: bool) -> Vec<StackEvent> {
        self.rx.clear();
        self.auth = AuthState::Phase1;
        self.auth_sync = sync;

        self.codec.set_key(ZERO_KEY);
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut iv);
        self.codec.reset_iv(iv);

        // header and TXsender carry no meaning during authentication
        let hello = CtrlMessage::new(0, 0, self.base_id.to_vec());
        self.send_msg(&hello);
        self.take_events()
    }

    /// Feed raw transport bytes; whole frames are decoded and processed,
    /// invalid ones dropped without a reply.
    pub fn recv(&mut self, data: &[u8]) -> Vec<StackEvent> {
        self.rx.push(data);
        while let Some(mut body) = self.rx.next_frame() {
            match self.codec.decode(&mut body) {
                Some(msg) => self.process(msg),
                None => debug!(len = body.len(), "dropped invalid frame"),
            }
        }
        self.take_events()
    }

    /// True while a frame prefix sits in the reassembly buffer; the driver
    /// keeps the data-expecter timer armed exactly as long as this holds.
    pub fn rx_pending(&self) -> bool {
        self.rx.has_partial()
    }

    /// Data-expecter fired: the tail of a partial frame is considered lost.
    pub fn on_expecter_timeout(&mut self) {
        if self.rx.has_partial() {
            debug!("data expecter timeout, flushing rx buffer");
            self.rx.clear();
        }
    }

    /// Wrap an application payload and emit it. `tx_base` identifies the
    /// message for the ACK that will come back; notifications are
    /// fire-and-forget and never acknowledged.
    pub fn send(
        &mut self,
        payload: &[u8],
        tx_base: u32,
        notification: bool,
    ) -> Result<Vec<StackEvent>, CtrlError> {
        let header = if notification { CH_NOTIFICATION } else { 0 };
        let msg = CtrlMessage::new(header, tx_base, payload.to_vec());
        let frame = self.codec.encode(&msg)?;
        self.events.push(StackEvent::Transmit(frame));
        Ok(self.take_events())
    }

    /// Ask the server for its wall clock. The reply arrives later as a
    /// regular system message.
    pub fn get_rtc(&mut self) -> Vec<StackEvent> {
        self.system_command(SM_GET_RTC)
    }

    /// Toggle the server-side keep-alive for this connection.
    pub fn keepalive(&mut self, on: bool) -> Vec<StackEvent> {
        self.system_command(if on { SM_KEEPALIVE_ON } else { SM_KEEPALIVE_OFF })
    }

    /// Backoff is latched: clearing it is refused until the peer has
    /// confirmed our BACKOFF with a BACKOFF-flagged ACK. That ACK is the
    /// barrier behind the last in-flight message we still had to reject.
    pub fn set_backoff(&mut self, on: bool) {
        if !on && !self.safe_to_unbackoff {
            return;
        }
        if on {
            self.safe_to_unbackoff = false;
        }
        self.backoff = on;
    }

    pub fn backoff(&self) -> bool {
        self.backoff
    }

    pub fn safe_to_unbackoff(&self) -> bool {
        self.safe_to_unbackoff
    }

    pub fn authenticated(&self) -> bool {
        self.auth == AuthState::Done
    }

    /// Next TXsender value we expect from the server.
    pub fn tx_server(&self) -> u32 {
        self.tx_server
    }

    fn system_command(&mut self, code: u8) -> Vec<StackEvent> {
        // notification-type on purpose: losing one of these is cheap and an
        // ACK exchange would be pure overhead
        let msg = CtrlMessage::new(CH_SYSTEM_MESSAGE | CH_NOTIFICATION, 0, vec![code]);
        self.send_msg(&msg);
        self.take_events()
    }

    fn process(&mut self, msg: CtrlMessage) {
        match self.auth {
            AuthState::Phase1 => self.auth_phase1(msg),
            AuthState::Phase2 => self.auth_phase2(msg),
            AuthState::Idle | AuthState::Done => self.steady(msg),
        }
    }

    /// The server's 16-byte challenge, still under the zero key. Answer
    /// with 16 random bytes plus the challenge, then arm the session key
    /// for everything that follows.
    fn auth_phase1(&mut self, msg: CtrlMessage) {
        if msg.payload.len() < 16 {
            debug!(len = msg.payload.len(), "short challenge, dropped");
            return;
        }

        let mut response = Vec::with_capacity(32);
        let mut rand16 = [0u8; 16];
        OsRng.fill_bytes(&mut rand16);
        response.extend_from_slice(&rand16);
        response.extend_from_slice(&msg.payload[..16]);

        let header = if self.auth_sync { CH_SYNC } else { 0 };
        let reply = CtrlMessage::new(header, 0, response);
        self.send_msg(&reply);

        self.auth = AuthState::Phase2;
        self.codec.set_key(self.key);
    }

    /// The verdict frame, under the session key. SYNC means both sides
    /// start from zero; otherwise the server hands back the TXserver it
    /// stored for us.
    fn auth_phase2(&mut self, msg: CtrlMessage) {
        if msg.has(CH_SYNC) {
            self.tx_server = 0;
        } else if msg.payload.len() >= 4 {
            self.tx_server =
                u32::from_le_bytes(msg.payload[..4].try_into().expect("4 bytes"));
        } else {
            debug!("auth verdict without TXserver, dropped");
            return;
        }

        self.auth = AuthState::Done;
        self.events.push(StackEvent::AuthOk);
    }

    fn steady(&mut self, msg: CtrlMessage) {
        if msg.has(CH_ACK) {
            // a BACKOFF-flagged ack is the server confirming our backoff
            // request, not an ack the application should hear about
            if msg.has(CH_BACKOFF) {
                self.safe_to_unbackoff = true;
            } else {
                self.events.push(StackEvent::Acked(msg));
            }
            return;
        }

        if msg.has(CH_NOTIFICATION) {
            // best-effort: no ACK, no TXserver movement
            self.events.push(StackEvent::Message(msg));
            return;
        }

        let mut ack = CtrlMessage::new(CH_ACK, msg.tx_sender, Vec::new());
        if self.backoff {
            ack.header |= CH_BACKOFF;
        }

        let next = self.tx_server.wrapping_add(1);
        if msg.tx_sender == next {
            self.tx_server = next;
            ack.header |= CH_PROCESSED | CH_SAVE_TXSERVER;
            // the server stores this for us so our flash does not wear out;
            // it ignores the value while we are backing it off
            ack.payload = self.tx_server.to_le_bytes().to_vec();
        } else if msg.tx_sender <= self.tx_server {
            debug!(tx_sender = msg.tx_sender, "retransmitted message, not delivered");
        } else {
            debug!(
                tx_sender = msg.tx_sender,
                expected = next,
                "message gap, reporting out-of-sync"
            );
            ack.header |= CH_OUT_OF_SYNC;
        }

        let deliver = ack.header & CH_PROCESSED != 0;
        self.send_msg(&ack);
        if deliver {
            self.events.push(StackEvent::Message(msg));
        }
    }

    fn send_msg(&mut self, msg: &CtrlMessage) {
        match self.codec.encode(msg) {
            Ok(frame) => self.events.push(StackEvent::Transmit(frame)),
            Err(e) => warn!(error = %e, "could not encode frame"),
        }
    }

    fn take_events(&mut self) -> Vec<StackEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
