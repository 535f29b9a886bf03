//! AES-128 primitives for the encrypted tunnel.
//!
//! The firmware encrypts tunnel traffic with a bespoke counter chaining mode:
//! the 8-byte nonce/counter (zero padded to a block) is encrypted with the
//! session key to form a keystream which is xored over the cleartext. The MIC
//! is derived by incrementing the counter, encrypting it, xoring the result
//! with the (padded) ciphertext and encrypting once more; the first four
//! bytes of that block are appended to the packet. The counter values at each
//! step must match the firmware bit for bit.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use thiserror::Error;

pub const KEY_LENGTH: usize = 16;
pub const MIC_LENGTH: usize = 4;
pub const HANDSHAKE_NONCE_LENGTH: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("key id cannot be resolved to a long-term key")]
    UnknownKeyId,
    #[error("long-term key is unprogrammed (all 0xFF)")]
    UnprogrammedKey,
}

/// One AES-128 block encryption, the only primitive the firmware uses.
pub fn aes128_block_encrypt(cleartext: &[u8; 16], key: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut block = (*cleartext).into();
    cipher.encrypt_block(&mut block);
    block.into()
}

fn xor_block(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn nonce_block(nonce: &[u32; 2]) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&nonce[0].to_le_bytes());
    block[4..8].copy_from_slice(&nonce[1].to_le_bytes());
    block
}

/// Derives a session key as `AES128(central_node_id ‖ nonce ‖ 0…, long_term_key)`.
pub fn derive_session_key(nonce: &[u32; 2], central_node_id: u16, long_term_key: &[u8; 16]) -> [u8; 16] {
    let mut cleartext = [0u8; 16];
    cleartext[0..2].copy_from_slice(&central_node_id.to_le_bytes());
    cleartext[2..6].copy_from_slice(&nonce[0].to_le_bytes());
    cleartext[6..10].copy_from_slice(&nonce[1].to_le_bytes());
    aes128_block_encrypt(&cleartext, long_term_key)
}

/// Derives a user key as `AES128(fm_key_id ‖ 0…, user_base_key)`.
pub fn derive_user_key(fm_key_id: u32, user_base_key: &[u8; 16]) -> [u8; 16] {
    let mut cleartext = [0u8; 16];
    cleartext[0..4].copy_from_slice(&fm_key_id.to_le_bytes());
    aes128_block_encrypt(&cleartext, user_base_key)
}

/// True if the key was never programmed into the config page.
pub fn is_unprogrammed(key: &[u8; 16]) -> bool {
    key.iter().all(|&b| b == 0xFF)
}

/// Encrypts `data` in place and returns the 4-byte MIC to append.
///
/// The nonce is NOT committed here: `nonce[1]` is temporarily incremented for
/// the MIC keystream and restored before returning. The caller advances the
/// counter by 2 only once the packet was accepted by the softdevice,
/// otherwise a queueing failure would desynchronize both sides.
pub fn encrypt_packet(data: &mut [u8], nonce: &[u32; 2], key: &[u8; 16]) -> [u8; MIC_LENGTH] {
    debug_assert!(data.len() <= 16);

    // Keystream from the current counter, xored over the cleartext.
    let keystream = aes128_block_encrypt(&nonce_block(nonce), key);
    let mut cleartext = [0u8; 16];
    cleartext[..data.len()].copy_from_slice(data);
    let ciphertext = xor_block(&keystream, &cleartext);
    data.copy_from_slice(&ciphertext[..data.len()]);

    // MIC: encrypt the incremented counter, xor with the padded ciphertext,
    // encrypt again. First four bytes become the MIC.
    let mic_nonce = [nonce[0], nonce[1].wrapping_add(1)];
    let keystream2 = aes128_block_encrypt(&nonce_block(&mic_nonce), key);
    let mut padded_ct = [0u8; 16];
    padded_ct[..data.len()].copy_from_slice(data);
    let mixed = xor_block(&keystream2, &padded_ct);
    let mic_block = aes128_block_encrypt(&mixed, key);

    let mut mic = [0u8; MIC_LENGTH];
    mic.copy_from_slice(&mic_block[..MIC_LENGTH]);
    mic
}

/// Verifies the trailing MIC of `data` and decrypts the payload.
///
/// Returns the plaintext on MIC match, `None` on mismatch. As with
/// encryption, the nonce is not advanced here; the caller commits `+2` after
/// a successful call.
pub fn decrypt_packet(data: &[u8], nonce: &[u32; 2], key: &[u8; 16]) -> Option<Vec<u8>> {
    if data.len() < MIC_LENGTH || data.len() > 16 + MIC_LENGTH {
        return None;
    }
    let payload_len = data.len() - MIC_LENGTH;

    // Recompute the MIC from the ciphertext exactly as the sender did.
    let mic_nonce = [nonce[0], nonce[1].wrapping_add(1)];
    let keystream2 = aes128_block_encrypt(&nonce_block(&mic_nonce), key);
    let mut padded_ct = [0u8; 16];
    padded_ct[..payload_len].copy_from_slice(&data[..payload_len]);
    let mixed = xor_block(&keystream2, &padded_ct);
    let mic_block = aes128_block_encrypt(&mixed, key);
    if mic_block[..MIC_LENGTH] != data[payload_len..] {
        return None;
    }

    // MIC matched: decrypt with the original counter.
    let keystream = aes128_block_encrypt(&nonce_block(nonce), key);
    let mut plaintext = vec![0u8; payload_len];
    for i in 0..payload_len {
        plaintext[i] = keystream[i] ^ data[i];
    }
    Some(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; 16];
        let nonce = [0xAABBCCDD, 17];
        let mut data = b"hello mesh".to_vec();
        let mic = encrypt_packet(&mut data, &nonce, &key);
        assert_ne!(&data[..], b"hello mesh");

        let mut wire = data.clone();
        wire.extend_from_slice(&mic);
        let plain = decrypt_packet(&wire, &nonce, &key).expect("mic must verify");
        assert_eq!(plain, b"hello mesh");
    }

    #[test]
    fn corrupted_mic_is_rejected() {
        let key = [3u8; 16];
        let nonce = [1, 2];
        let mut data = vec![1, 2, 3, 4, 5];
        let mic = encrypt_packet(&mut data, &nonce, &key);
        let mut wire = data.clone();
        wire.extend_from_slice(&mic);
        *wire.last_mut().unwrap() ^= 0x01;
        assert!(decrypt_packet(&wire, &nonce, &key).is_none());
    }

    #[test]
    fn wrong_counter_is_rejected() {
        let key = [9u8; 16];
        let mut data = vec![0x42; 8];
        let mic = encrypt_packet(&mut data, &[0, 10], &key);
        let mut wire = data.clone();
        wire.extend_from_slice(&mic);
        assert!(decrypt_packet(&wire, &[0, 12], &key).is_none());
    }

    #[test]
    fn session_key_depends_on_all_inputs() {
        let lt = [0x11u8; 16];
        let a = derive_session_key(&[1, 2], 5, &lt);
        assert_ne!(a, derive_session_key(&[1, 3], 5, &lt));
        assert_ne!(a, derive_session_key(&[1, 2], 6, &lt));
        assert_ne!(a, derive_session_key(&[1, 2], 5, &[0x12u8; 16]));
    }

    #[test]
    fn unprogrammed_key_detection() {
        assert!(is_unprogrammed(&[0xFF; 16]));
        assert!(!is_unprogrammed(&[0xFE; 16]));
    }
}
