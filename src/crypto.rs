//! Block encryption and hashing primitives.
//!
//! Data blocks are encrypted with AES-256-CTR under a random 16-byte nonce
//! which is prepended to the ciphertext, so the stored form of a block is
//! always 16 bytes longer than its compressed form. Blocks are content
//! addressed by their SHA3-512 digest; whole files carry a SHA-1 checksum.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use miette::{bail, Result};
use rand::{rngs::OsRng, RngCore};
use sha1::{Digest as _, Sha1};
use sha3::Sha3_512;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Length of the nonce prepended to every encrypted block.
pub const NONCE_SIZE: usize = 16;

/// Length of an AES key.
pub const KEY_SIZE: usize = 32;

/// Content address of a block: its SHA3-512 digest.
pub type BlockId = [u8; 64];

/// Generate a fresh AES key from the system CSPRNG.
pub fn generate_key() -> [u8; KEY_SIZE] {
	let mut key = [0u8; KEY_SIZE];
	OsRng.fill_bytes(&mut key);
	key
}

/// Encrypt `data` under `key`, prepending a fresh random nonce.
pub fn encrypt_aes(data: &[u8], key: &[u8; KEY_SIZE]) -> Vec<u8> {
	let mut nonce = [0u8; NONCE_SIZE];
	OsRng.fill_bytes(&mut nonce);

	let mut out = Vec::with_capacity(NONCE_SIZE + data.len());
	out.extend_from_slice(&nonce);
	out.extend_from_slice(data);

	let mut cipher = Aes256Ctr::new(key.into(), &nonce.into());
	cipher.apply_keystream(&mut out[NONCE_SIZE..]);
	out
}

/// Decrypt a blob produced by [`encrypt_aes`].
pub fn decrypt_aes(blob: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
	if blob.len() < NONCE_SIZE {
		bail!("encrypted block is too short ({} bytes)", blob.len());
	}

	let nonce: [u8; NONCE_SIZE] = blob[..NONCE_SIZE]
		.try_into()
		.expect("BUG: length checked above");
	let mut out = blob[NONCE_SIZE..].to_vec();
	let mut cipher = Aes256Ctr::new(key.into(), &nonce.into());
	cipher.apply_keystream(&mut out);
	Ok(out)
}

/// SHA3-512 of a block's raw bytes.
pub fn block_id(data: &[u8]) -> BlockId {
	let digest = Sha3_512::digest(data);
	let mut id = [0u8; 64];
	id.copy_from_slice(&digest);
	id
}

/// SHA-1 digest of a byte slice.
pub fn sha1(data: &[u8]) -> [u8; 20] {
	Sha1::digest(data).into()
}

/// SHA-1 hex digest of a string, used for cache directory names.
pub fn sha1_hex(data: &str) -> String {
	hex::encode(Sha1::digest(data.as_bytes()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn aes_round_trip() {
		let key = [b'x'; KEY_SIZE];
		assert_eq!(
			decrypt_aes(&encrypt_aes(b"hello", &key), &key).unwrap(),
			b"hello"
		);

		let long: Vec<u8> = b"\x00\x01\x02".repeat(999);
		assert_eq!(decrypt_aes(&encrypt_aes(&long, &key), &key).unwrap(), long);
	}

	#[test]
	fn encrypted_form_is_nonce_plus_data() {
		let key = generate_key();
		let blob = encrypt_aes(b"some data", &key);
		assert_eq!(blob.len(), NONCE_SIZE + 9);
	}

	#[test]
	fn nonces_are_fresh() {
		let key = generate_key();
		let a = encrypt_aes(b"same input", &key);
		let b = encrypt_aes(b"same input", &key);
		assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
		assert_ne!(a[NONCE_SIZE..], b[NONCE_SIZE..]);
	}

	#[test]
	fn short_blob_is_rejected() {
		let key = generate_key();
		assert!(decrypt_aes(b"too short", &key).is_err());
	}

	#[test]
	fn wrong_key_scrambles() {
		let blob = encrypt_aes(b"secret", &generate_key());
		let plain = decrypt_aes(&blob, &generate_key()).unwrap();
		assert_ne!(plain, b"secret");
	}

	#[test]
	fn block_id_is_stable() {
		assert_eq!(block_id(b"abc"), block_id(b"abc"));
		assert_ne!(block_id(b"abc"), block_id(b"abd"));
	}
}
