//! End-to-end protocol scenarios: the client stack talks to a scripted
//! server built from the same codec primitives.

use ctrl_base::frame::{
    CtrlMessage, FrameCodec, CH_ACK, CH_BACKOFF, CH_NOTIFICATION, CH_OUT_OF_SYNC, CH_PROCESSED,
    CH_SAVE_TXSERVER, CH_SYNC, CH_SYSTEM_MESSAGE,
};
use ctrl_base::outbox::Outbox;
use ctrl_base::stack::{Stack, StackEvent};
use ctrl_base::system::{parse_rtc, SM_GET_RTC, SM_KEEPALIVE_OFF, SM_KEEPALIVE_ON};

const BASE_ID: [u8; 16] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
    0x10,
];
const KEY: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
    0x0f,
];
const CHALLENGE: [u8; 16] = [0xaa; 16];

/// Server half of the conversation, sharing the wire format with the
/// client but running its own key schedule and IV chain.
struct TestServer {
    tx: FrameCodec,
    rx: FrameCodec,
}

impl TestServer {
    fn new() -> Self {
        let mut tx = FrameCodec::new();
        tx.reset_iv([0x99; 16]);
        Self { tx, rx: FrameCodec::new() }
    }

    fn set_key(&mut self, key: [u8; 16]) {
        self.tx.set_key(key);
        self.rx.set_key(key);
    }

    fn encode(&mut self, msg: &CtrlMessage) -> Vec<u8> {
        self.tx.encode(msg).unwrap().to_vec()
    }

    /// Decode every Transmit in the event list, in order.
    fn sent(&self, events: &[StackEvent]) -> Vec<CtrlMessage> {
        events
            .iter()
            .filter_map(|ev| match ev {
                StackEvent::Transmit(frame) => {
                    let mut inner = frame[2..].to_vec();
                    Some(self.rx.decode(&mut inner).expect("server failed to decode frame"))
                }
                _ => None,
            })
            .collect()
    }

    fn sent_one(&self, events: &[StackEvent]) -> CtrlMessage {
        let mut all = self.sent(events);
        assert_eq!(all.len(), 1, "expected exactly one outbound frame");
        all.remove(0)
    }
}

fn messages(events: &[StackEvent]) -> Vec<&CtrlMessage> {
    events
        .iter()
        .filter_map(|ev| match ev {
            StackEvent::Message(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn acked(events: &[StackEvent]) -> Vec<&CtrlMessage> {
    events
        .iter()
        .filter_map(|ev| match ev {
            StackEvent::Acked(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn has_auth_ok(events: &[StackEvent]) -> bool {
    events.iter().any(|ev| matches!(ev, StackEvent::AuthOk))
}

/// Run the full challenge/response handshake. With `sync` the server
/// resets the counter; otherwise it hands back `stored_tx_server`.
fn authenticate(sync: bool, stored_tx_server: u32) -> (Stack, TestServer) {
    let mut stack = Stack::new(BASE_ID, KEY);
    let mut server = TestServer::new();

    let events = stack.authorize(sync);
    let hello = server.sent_one(&events);
    assert_eq!(hello.payload, BASE_ID);

    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 0, CHALLENGE.to_vec())));
    let response = server.sent_one(&events);
    assert_eq!(response.payload.len(), 32);
    assert_eq!(&response.payload[16..], &CHALLENGE);
    assert_eq!(response.has(CH_SYNC), sync);
    assert!(!has_auth_ok(&events));

    // challenge answered: both sides move to the session key
    server.set_key(KEY);
    let verdict = if sync {
        CtrlMessage::new(CH_SYNC, 0, Vec::new())
    } else {
        CtrlMessage::new(0, 0, stored_tx_server.to_le_bytes().to_vec())
    };
    let events = stack.recv(&server.encode(&verdict));
    assert!(has_auth_ok(&events));
    assert!(stack.authenticated());

    (stack, server)
}

#[test]
fn s1_clean_auth_with_sync() {
    let (stack, _server) = authenticate(true, 0);
    assert_eq!(stack.tx_server(), 0);
}

#[test]
fn auth_restores_stored_tx_server() {
    let (mut stack, mut server) = authenticate(false, 41);
    assert_eq!(stack.tx_server(), 41);

    // next in-sequence message is 42
    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 42, b"resumed".to_vec())));
    let ack = server.sent_one(&events);
    assert!(ack.has(CH_PROCESSED));
    assert_eq!(stack.tx_server(), 42);
}

#[test]
fn s2_in_order_delivery() {
    let (mut stack, mut server) = authenticate(true, 0);

    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 1, b"hi".to_vec())));

    // the ACK is queued before the delivery
    assert!(matches!(events[0], StackEvent::Transmit(_)));
    let ack = server.sent_one(&events);
    assert!(ack.has(CH_ACK) && ack.has(CH_PROCESSED) && ack.has(CH_SAVE_TXSERVER));
    assert_eq!(ack.tx_sender, 1);
    assert_eq!(ack.payload, vec![0x01, 0x00, 0x00, 0x00]);

    let delivered = messages(&events);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, b"hi");
    assert_eq!(stack.tx_server(), 1);
}

#[test]
fn s3_duplicate_suppressed() {
    let (mut stack, mut server) = authenticate(true, 0);
    stack.recv(&server.encode(&CtrlMessage::new(0, 1, b"hi".to_vec())));

    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 1, b"hi".to_vec())));
    let ack = server.sent_one(&events);
    assert!(ack.has(CH_ACK));
    assert!(!ack.has(CH_PROCESSED));
    assert!(!ack.has(CH_OUT_OF_SYNC));
    assert!(messages(&events).is_empty());
    assert_eq!(stack.tx_server(), 1);
}

#[test]
fn s4_gap_reports_out_of_sync() {
    let (mut stack, mut server) = authenticate(true, 0);
    stack.recv(&server.encode(&CtrlMessage::new(0, 1, b"hi".to_vec())));

    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 3, b"skipped".to_vec())));
    let ack = server.sent_one(&events);
    assert!(ack.has(CH_OUT_OF_SYNC));
    assert!(!ack.has(CH_PROCESSED));
    assert!(messages(&events).is_empty());
    assert_eq!(stack.tx_server(), 1);
}

#[test]
fn notification_is_not_acked() {
    let (mut stack, mut server) = authenticate(true, 0);

    let events =
        stack.recv(&server.encode(&CtrlMessage::new(CH_NOTIFICATION, 77, b"fyi".to_vec())));
    assert!(server.sent(&events).is_empty());
    let delivered = messages(&events);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload, b"fyi");
    assert_eq!(stack.tx_server(), 0);
}

#[test]
fn ack_reaches_application() {
    let (mut stack, mut server) = authenticate(true, 0);

    let events = stack.recv(&server.encode(&CtrlMessage::new(CH_ACK | CH_PROCESSED, 5, vec![])));
    let acks = acked(&events);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].tx_sender, 5);

    // OUT_OF_SYNC rides the same path; the driver counts it
    let events = stack
        .recv(&server.encode(&CtrlMessage::new(CH_ACK | CH_OUT_OF_SYNC, 6, vec![])));
    assert!(acked(&events)[0].has(CH_OUT_OF_SYNC));
}

#[test]
fn s6_backoff_handshake() {
    let (mut stack, mut server) = authenticate(true, 0);

    stack.set_backoff(true);
    assert!(stack.backoff());

    // server keeps streaming; every ACK we emit carries BACKOFF
    for tx in 1..=10u32 {
        let events = stack.recv(&server.encode(&CtrlMessage::new(0, tx, b"m".to_vec())));
        let ack = server.sent_one(&events);
        assert!(ack.has(CH_BACKOFF), "ack {tx} missing BACKOFF");
        assert!(ack.has(CH_PROCESSED));
    }

    // not safe to unbackoff until the server confirms
    stack.set_backoff(false);
    assert!(stack.backoff());

    let events = stack.recv(&server.encode(&CtrlMessage::new(CH_ACK | CH_BACKOFF, 1, vec![])));
    assert!(acked(&events).is_empty(), "backoff confirmation is not an app ack");
    assert!(stack.safe_to_unbackoff());

    stack.set_backoff(false);
    assert!(!stack.backoff());

    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 11, b"m".to_vec())));
    assert!(!server.sent_one(&events).has(CH_BACKOFF));
}

#[test]
fn system_commands_on_the_wire() {
    let (mut stack, server) = authenticate(true, 0);

    let events = stack.get_rtc();
    let req = server.sent_one(&events);
    assert!(req.has(CH_SYSTEM_MESSAGE) && req.has(CH_NOTIFICATION));
    assert_eq!(req.payload, vec![SM_GET_RTC]);

    let on = server.sent_one(&stack.keepalive(true));
    assert_eq!(on.payload, vec![SM_KEEPALIVE_ON]);
    let off = server.sent_one(&stack.keepalive(false));
    assert_eq!(off.payload, vec![SM_KEEPALIVE_OFF]);
}

#[test]
fn rtc_response_is_sequenced_and_parsable() {
    let (mut stack, mut server) = authenticate(true, 0);

    let payload = vec![SM_GET_RTC, 2, 0, 2, 5, 0, 8, 0, 1, 1, 2, 3, 4, 5, 6, 6];
    let events =
        stack.recv(&server.encode(&CtrlMessage::new(CH_SYSTEM_MESSAGE, 1, payload)));
    let ack = server.sent_one(&events);
    assert!(ack.has(CH_PROCESSED));

    let delivered = messages(&events);
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].has(CH_SYSTEM_MESSAGE));
    let rtc = parse_rtc(&delivered[0].payload).unwrap();
    assert_eq!((rtc.year, rtc.month, rtc.day), (2025, 8, 1));
    assert_eq!((rtc.hour, rtc.minute, rtc.second, rtc.weekday), (12, 34, 56, 6));
}

#[test]
fn frames_survive_tcp_fragmentation() {
    let (mut stack, mut server) = authenticate(true, 0);

    let wire = server.encode(&CtrlMessage::new(0, 1, b"fragmented".to_vec()));
    let events = stack.recv(&wire[..5]);
    assert!(events.is_empty());
    assert!(stack.rx_pending());

    let events = stack.recv(&wire[5..]);
    assert_eq!(messages(&events)[0].payload, b"fragmented");
    assert!(!stack.rx_pending());
}

#[test]
fn corrupted_frame_is_dropped_silently() {
    let (mut stack, mut server) = authenticate(true, 0);

    let mut wire = server.encode(&CtrlMessage::new(0, 1, b"bits".to_vec()));
    let n = wire.len();
    wire[n - 1] ^= 0x80;
    let events = stack.recv(&wire);
    assert!(events.is_empty());
    assert_eq!(stack.tx_server(), 0);
}

#[test]
fn s5_outbox_resilience_across_reconnect() {
    let (mut stack, mut server) = authenticate(true, 0);
    let mut outbox = Outbox::new(8);
    for p in [b"A" as &[u8], b"B", b"C"] {
        outbox.add(p.to_vec()).unwrap();
    }

    // sender ticks drain one row each
    let mut seen = Vec::new();
    while let Some(row) = outbox.next_unsent() {
        let (tx_base, payload) = (row.tx_base, row.payload.clone());
        let events = stack.send(&payload, tx_base, false).unwrap();
        seen.push(server.sent_one(&events));
        outbox.mark_sent(tx_base);
    }
    assert_eq!(
        seen.iter().map(|m| m.tx_sender).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    // only A gets acked before the transport drops
    let events = stack.recv(&server.encode(&CtrlMessage::new(CH_ACK | CH_PROCESSED, 1, vec![])));
    for m in acked(&events) {
        outbox.ack(m.tx_sender);
    }

    // reconnect ritual
    outbox.flush_acked();
    outbox.unsend_all();
    let sync = outbox.count_unacked() == 0;
    assert!(!sync, "B and C are still pending");

    let mut server = TestServer::new();
    let events = stack.authorize(sync);
    assert_eq!(server.sent_one(&events).payload, BASE_ID);
    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 0, CHALLENGE.to_vec())));
    let response = server.sent_one(&events);
    assert!(!response.has(CH_SYNC), "pending rows forbid SYNC");
    server.set_key(KEY);
    let events = stack.recv(&server.encode(&CtrlMessage::new(0, 0, 0u32.to_le_bytes().to_vec())));
    assert!(has_auth_ok(&events));

    // the next two ticks re-send B then C, tx_base values unchanged
    let mut resent = Vec::new();
    while let Some(row) = outbox.next_unsent() {
        let (tx_base, payload) = (row.tx_base, row.payload.clone());
        let events = stack.send(&payload, tx_base, false).unwrap();
        resent.push(server.sent_one(&events));
        outbox.mark_sent(tx_base);
    }
    assert_eq!(resent.len(), 2);
    assert_eq!(resent[0].tx_sender, 2);
    assert_eq!(resent[0].payload, b"B");
    assert_eq!(resent[1].tx_sender, 3);
    assert_eq!(resent[1].payload, b"C");
}

#[test]
fn sync_restarts_tx_base_at_one() {
    let (mut stack, server) = authenticate(true, 0);
    let mut outbox = Outbox::new(8);
    outbox.reset_tx_base(); // driver does this on every SYNC handshake

    let tx_base = outbox.add(b"first".to_vec()).unwrap();
    assert_eq!(tx_base, 1);
    let row = outbox.next_unsent().unwrap();
    let events = stack.send(&row.payload.clone(), row.tx_base, false).unwrap();
    assert_eq!(server.sent_one(&events).tx_sender, 1);
}
