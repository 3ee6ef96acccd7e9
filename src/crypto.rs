use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

pub const BLOCK: usize = 16;

/// Key used for the auth phase-1 exchange, before the server knows who is
/// talking and can pick the real key.
pub const ZERO_KEY: [u8; 16] = [0u8; 16];

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES-128-CBC encrypt `buf` in place. `buf.len()` must be a multiple of 16;
/// callers build the buffer padded, so a violation is a programming error.
pub fn aes128_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) {
    let n = buf.len();
    Aes128CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(buf, n)
        .expect("cbc encrypt: length not a multiple of 16");
}

/// AES-128-CBC decrypt `buf` in place. Same length contract as encryption.
pub fn aes128_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], buf: &mut [u8]) {
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(buf)
        .expect("cbc decrypt: length not a multiple of 16");
}

/// AES-CMAC tag over `data`.
pub fn cmac_tag(key: &[u8; 16], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).expect("cmac key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time check of a 16-byte CMAC tag.
pub fn cmac_verify(key: &[u8; 16], data: &[u8], tag: &[u8]) -> bool {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).expect("cmac key length");
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}
