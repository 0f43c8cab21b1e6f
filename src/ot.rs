//! 1-out-of-4 Chou-Orlandi oblivious transfer (cf.
//! <https://eprint.iacr.org/2015/267>).
//!
//! This is the base OT underneath every AND gate: the sender offers four
//! table rows, the receiver learns exactly the row matching its two wire
//! shares, and the sender learns nothing about the choice. The construction
//! uses the Ristretto prime order group from `curve25519-dalek`; the
//! receiver blinds its choice `c` as `R = c*S + x*G` and the sender derives
//! the four row keys as `H(gate, y*R - i*y*S)`, of which the receiver can
//! compute only `H(gate, x*S)`. The gate index is folded into the key
//! derivation so that no two gates ever share row keys.
//!
//! Rows are sealed with ChaCha20-Poly1305 under the derived keys, so a row
//! opened with the wrong key fails authentication instead of yielding
//! garbage.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_TABLE,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use rand::RngCore;
use rand_chacha::ChaCha20Rng;
use thiserror::Error;

/// A failure inside the oblivious transfer for one gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum OtError {
    /// A received group element did not decode to a Ristretto point.
    #[error("received bytes do not encode a Ristretto point")]
    InvalidPoint,
    /// A table row could not be sealed.
    #[error("sealing a table row failed")]
    Encryption,
    /// The selected table row failed authentication.
    #[error("opening the selected table row failed")]
    Decryption,
}

/// The sender half of one transfer, offering four boolean rows.
pub(crate) struct OtSender {
    y: Scalar,
    s: RistrettoPoint,
    gate: u32,
}

impl OtSender {
    /// Starts a transfer, returning the public point to send as round 0.
    pub(crate) fn new(gate: u32, rng: &mut ChaCha20Rng) -> (Self, [u8; 32]) {
        let y = random_scalar(rng);
        let s = &y * RISTRETTO_BASEPOINT_TABLE;
        let bytes = s.compress().to_bytes();
        (Self { y, s, gate }, bytes)
    }

    /// Consumes the receiver's blinded choice point and seals the four rows.
    pub(crate) fn seal_table(
        &self,
        choice_point: &[u8; 32],
        rows: [bool; 4],
    ) -> Result<[Vec<u8>; 4], OtError> {
        let r = decode_point(choice_point)?;
        let ys = self.y * self.s;
        let mut key_point = self.y * r;
        let mut sealed = [const { Vec::new() }; 4];
        for (i, row) in rows.into_iter().enumerate() {
            let key = hash_point(self.gate, &key_point);
            sealed[i] = seal_row(&key, self.gate, i as u8, row)?;
            key_point -= ys;
        }
        Ok(sealed)
    }
}

/// The receiver half of one transfer, learning exactly one row.
#[derive(Debug)]
pub(crate) struct OtReceiver {
    key: [u8; 32],
    choice: u8,
    gate: u32,
}

impl OtReceiver {
    /// Consumes the sender's public point and picks row `choice` (0..4),
    /// returning the blinded choice point to send as round 1.
    pub(crate) fn new(
        gate: u32,
        choice: u8,
        sender_point: &[u8; 32],
        rng: &mut ChaCha20Rng,
    ) -> Result<(Self, [u8; 32]), OtError> {
        debug_assert!(choice < 4);
        let s = decode_point(sender_point)?;
        let x = random_scalar(rng);
        let r = Scalar::from(choice as u64) * s + &x * RISTRETTO_BASEPOINT_TABLE;
        let key = hash_point(gate, &(x * s));
        Ok((Self { key, choice, gate }, r.compress().to_bytes()))
    }

    /// Opens the chosen row of the sender's sealed table.
    pub(crate) fn open_table(&self, table: &[Vec<u8>; 4]) -> Result<bool, OtError> {
        open_row(&self.key, self.gate, self.choice, &table[self.choice as usize])
    }
}

fn random_scalar(rng: &mut ChaCha20Rng) -> Scalar {
    // Scalar::random is pinned to a rand_core below the one our rand stack
    // uses, so draw wide bytes and reduce instead.
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

fn decode_point(bytes: &[u8; 32]) -> Result<RistrettoPoint, OtError> {
    let compressed =
        CompressedRistretto::from_slice(bytes).map_err(|_| OtError::InvalidPoint)?;
    compressed.decompress().ok_or(OtError::InvalidPoint)
}

fn hash_point(gate: u32, point: &RistrettoPoint) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key("duotune v1 gate ot");
    hasher.update(&gate.to_le_bytes());
    hasher.update(point.compress().as_bytes());
    *hasher.finalize().as_bytes()
}

fn row_nonce(gate: u32, row: u8) -> Nonce {
    let mut nonce = [0; 12];
    nonce[..4].copy_from_slice(&gate.to_le_bytes());
    nonce[4] = row;
    nonce.into()
}

fn seal_row(key: &[u8; 32], gate: u32, row: u8, bit: bool) -> Result<Vec<u8>, OtError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(&row_nonce(gate, row), [bit as u8].as_ref())
        .map_err(|_| OtError::Encryption)
}

fn open_row(key: &[u8; 32], gate: u32, row: u8, sealed: &[u8]) -> Result<bool, OtError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(&row_nonce(gate, row), sealed)
        .map_err(|_| OtError::Decryption)?;
    match plaintext.as_slice() {
        [bit @ (0 | 1)] => Ok(*bit == 1),
        _ => Err(OtError::Decryption),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn transfers_exactly_the_chosen_row() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let rows = [true, false, false, true];
        for choice in 0..4u8 {
            let (sender, point) = OtSender::new(42, &mut rng);
            let (receiver, blinded) = OtReceiver::new(42, choice, &point, &mut rng).unwrap();
            let table = sender.seal_table(&blinded, rows).unwrap();
            assert_eq!(receiver.open_table(&table).unwrap(), rows[choice as usize]);
        }
    }

    #[test]
    fn unchosen_rows_stay_sealed() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let (sender, point) = OtSender::new(3, &mut rng);
        let (receiver, blinded) = OtReceiver::new(3, 2, &point, &mut rng).unwrap();
        let table = sender.seal_table(&blinded, [true; 4]).unwrap();
        for other in [0u8, 1, 3] {
            assert_eq!(
                open_row(&receiver.key, 3, other, &table[other as usize]),
                Err(OtError::Decryption)
            );
        }
    }

    #[test]
    fn tampered_table_fails_to_open() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let (sender, point) = OtSender::new(1, &mut rng);
        let (receiver, blinded) = OtReceiver::new(1, 0, &point, &mut rng).unwrap();
        let mut table = sender.seal_table(&blinded, [false; 4]).unwrap();
        table[0][0] ^= 1;
        assert_eq!(receiver.open_table(&table), Err(OtError::Decryption));
    }

    #[test]
    fn rejects_invalid_points() {
        let mut rng = ChaCha20Rng::seed_from_u64(10);
        let err = OtReceiver::new(0, 0, &[0xff; 32], &mut rng).unwrap_err();
        assert_eq!(err, OtError::InvalidPoint);
        let (sender, _) = OtSender::new(0, &mut rng);
        assert_eq!(
            sender.seal_table(&[0xff; 32], [false; 4]).unwrap_err(),
            OtError::InvalidPoint
        );
    }
}
