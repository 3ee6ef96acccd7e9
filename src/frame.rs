use bytes::{BufMut, BytesMut};
use zeroize::Zeroize;

use crate::crypto::{self, BLOCK};
use crate::error::CtrlError;

/// Largest application payload that still fits the u16 length prefix once
/// header, padding and MAC are added.
pub const MAX_PAYLOAD: usize = 65480;

// Header bits, shared with the server.
pub const CH_ACK: u8 = 0x01;
pub const CH_PROCESSED: u8 = 0x02;
pub const CH_OUT_OF_SYNC: u8 = 0x04;
pub const CH_BACKOFF: u8 = 0x08;
pub const CH_SAVE_TXSERVER: u8 = 0x10;
pub const CH_NOTIFICATION: u8 = 0x20;
pub const CH_SYNC: u8 = 0x40;
pub const CH_SYSTEM_MESSAGE: u8 = 0x80;

/// One protocol message, header and payload in the clear.
///
/// The wire-level `MSG_LEN` field is derived from the payload
/// (`1 + 4 + payload.len()`), never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtrlMessage {
    pub header: u8,
    pub tx_sender: u32,
    pub payload: Vec<u8>,
}

impl CtrlMessage {
    pub fn new(header: u8, tx_sender: u32, payload: Vec<u8>) -> Self {
        Self { header, tx_sender, payload }
    }

    pub fn length(&self) -> usize {
        1 + 4 + self.payload.len()
    }

    #[inline]
    pub fn has(&self, bit: u8) -> bool {
        self.header & bit != 0
    }
}

/// Encrypt-then-MAC framing.
///
/// Wire layout, multi-byte integers little-endian:
///
/// ```text
/// [ALL_LEN u16] { [IV 16] [MSG_LEN u16] [HDR u8] [TXSENDER u32] [PAYLOAD n] [PAD p] } [CMAC 16]
/// ```
///
/// The braced region is AES-128-CBC under the active key; `ALL_LEN` counts
/// everything after itself. Padding is 1..=16 bytes so the encrypted region
/// is block-aligned even when the plaintext already is.
///
/// The codec carries the IV for the next outbound frame: the CMAC of frame N
/// is the IV of frame N+1. Inbound frames bring their own IV.
pub struct FrameCodec {
    key: [u8; 16],
    next_iv: [u8; 16],
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { key: crypto::ZERO_KEY, next_iv: [0u8; 16] }
    }

    /// Switch the active key. Happens once per `authorize`: zero key for
    /// phase 1, session key from phase 2 on.
    pub fn set_key(&mut self, key: [u8; 16]) {
        self.key.zeroize();
        self.key = key;
    }

    /// Restart the outbound IV chain (bootstrap IV at `authorize`).
    pub fn reset_iv(&mut self, iv: [u8; 16]) {
        self.next_iv = iv;
    }

    pub fn next_iv(&self) -> [u8; 16] {
        self.next_iv
    }

    /// Serialize, pad, encrypt and MAC one message. Advances the IV chain.
    pub fn encode(&mut self, msg: &CtrlMessage) -> Result<BytesMut, CtrlError> {
        let msg_len = msg.length();
        let pad = BLOCK - ((BLOCK + 2 + msg_len) % BLOCK); // 1..=16
        let total = 2 + BLOCK + 2 + msg_len + pad + BLOCK;
        if total > 0xFFFF {
            return Err(CtrlError::PayloadTooLong);
        }

        let mut out = BytesMut::with_capacity(total);
        out.put_u16_le((total - 2) as u16);
        out.put_slice(&self.next_iv);
        out.put_u16_le(msg_len as u16);
        out.put_u8(msg.header);
        out.put_u32_le(msg.tx_sender);
        out.put_slice(&msg.payload);
        out.put_slice(&self.next_iv[..pad]); // padding content is arbitrary

        let iv = self.next_iv;
        let end = out.len();
        crypto::aes128_cbc_encrypt(&self.key, &iv, &mut out[2..end]);
        let tag = crypto::cmac_tag(&self.key, &out[2..end]);
        out.put_slice(&tag);

        self.next_iv = tag;
        Ok(out)
    }

    /// Authenticate and decrypt one frame body (everything after `ALL_LEN`).
    /// Anything malformed is dropped silently; the wire is untrusted.
    pub fn decode(&self, inner: &mut [u8]) -> Option<CtrlMessage> {
        if inner.len() % BLOCK != 0 || inner.len() < 3 * BLOCK {
            return None;
        }
        let split = inner.len() - BLOCK;
        let (body, tag) = inner.split_at_mut(split);
        if !crypto::cmac_verify(&self.key, body, tag) {
            return None;
        }

        let (iv, ct) = body.split_at_mut(BLOCK);
        let iv: [u8; 16] = (&*iv).try_into().expect("iv slice is 16 bytes");
        crypto::aes128_cbc_decrypt(&self.key, &iv, ct);

        let msg_len = u16::from_le_bytes([ct[0], ct[1]]) as usize;
        if msg_len < 5 || 2 + msg_len > ct.len() {
            return None;
        }
        let header = ct[2];
        let tx_sender = u32::from_le_bytes(ct[3..7].try_into().expect("4 bytes"));
        let payload = ct[7..2 + msg_len].to_vec();
        Some(CtrlMessage { header, tx_sender, payload })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameCodec {
    fn drop(&mut self) {
        self.key.zeroize();
        self.next_iv.zeroize();
    }
}
