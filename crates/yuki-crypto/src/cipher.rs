//! Per-session cipher split into a sealing half and an opening half.
//!
//! A [`SessionCipher`] is built from a freshly generated key and the local
//! [`Role`], then split with [`SessionCipher::into_halves`] so that each relay
//! direction exclusively owns the state it mutates. Only the [`Sealer`] can
//! produce a nonce, and it advances its sequence before every use.
//!
//! Envelope: `LEN(4, BE) || nonce(24) || ciphertext || tag(16)`. The additional
//! data is empty.

use crate::aead::{AeadKey, NONCE_SIZE, Nonce, TAG_SIZE, Tag};
use crate::sequence::{ReplayWindow, Role, SendSequence};
use crate::{CryptoError, LEN_PREFIX_SIZE};

/// Smallest legal value of the LEN prefix (empty plaintext).
pub const MIN_ENVELOPE_BODY: usize = NONCE_SIZE + TAG_SIZE;

/// Largest plaintext a single envelope can carry.
pub const MAX_PLAINTEXT: usize = u32::MAX as usize - MIN_ENVELOPE_BODY;

/// Session key bound to a role, not yet split.
pub struct SessionCipher {
    key: AeadKey,
    role: Role,
}

impl SessionCipher {
    /// Bind a key to the local role.
    #[must_use]
    pub fn new(key: AeadKey, role: Role) -> Self {
        Self { key, role }
    }

    /// Local role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Raw key, for delivery to the peer during the handshake.
    #[must_use]
    pub fn key(&self) -> &AeadKey {
        &self.key
    }

    /// Split into the send and receive halves.
    #[must_use]
    pub fn into_halves(self) -> (Sealer, Opener) {
        let sealer = Sealer {
            key: self.key.clone(),
            sequence: SendSequence::new(self.role),
            role: self.role,
        };
        let opener = Opener {
            key: self.key,
            window: ReplayWindow::for_peer(self.role.peer()),
            role: self.role,
        };
        (sealer, opener)
    }
}

/// Sending half: owns the send sequence.
pub struct Sealer {
    key: AeadKey,
    sequence: SendSequence,
    role: Role,
}

impl Sealer {
    /// Seal a plaintext into a length-prefixed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::NonceExhausted`] when the sequence cannot
    /// advance, or [`CryptoError::EncryptionFailed`] on an AEAD fault or a
    /// plaintext too large for the LEN prefix.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(CryptoError::EncryptionFailed);
        }
        let body_len = MIN_ENVELOPE_BODY + plaintext.len();
        let nonce = Nonce::from_sequence(self.sequence.advance()?);

        let mut envelope = Vec::with_capacity(LEN_PREFIX_SIZE + body_len);
        envelope.extend_from_slice(&(body_len as u32).to_be_bytes());
        envelope.extend_from_slice(nonce.as_bytes());
        envelope.extend_from_slice(plaintext);

        let tag = self.key.encrypt_in_place(
            &nonce,
            &mut envelope[LEN_PREFIX_SIZE + NONCE_SIZE..],
            &[],
        )?;
        envelope.extend_from_slice(tag.as_bytes());
        Ok(envelope)
    }

    /// Last sequence value used (the role's start value before any seal).
    #[must_use]
    pub fn last_sequence(&self) -> u128 {
        self.sequence.current()
    }

    /// Local role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }
}

/// Receiving half: owns the replay window.
pub struct Opener {
    key: AeadKey,
    window: ReplayWindow,
    role: Role,
}

impl Opener {
    /// Open a length-prefixed envelope.
    ///
    /// The nonce is validated before decryption and committed only after the
    /// tag verifies. Bytes beyond the declared length are ignored.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::IncompleteFrame`] if the prefix, body or declared
    ///   minimum is short
    /// - [`CryptoError::ReplayOrOutOfOrder`] if the nonce is outside the window
    /// - [`CryptoError::AuthenticationFailed`] if the tag does not verify
    pub fn open(&mut self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let body = envelope_body(envelope)?;

        let nonce = Nonce::from_slice(&body[..NONCE_SIZE]).ok_or(CryptoError::IncompleteFrame {
            expected: NONCE_SIZE,
            actual: body.len(),
        })?;
        let value = nonce.sequence().ok_or(CryptoError::ReplayOrOutOfOrder {
            last: self.window.last_accepted(),
        })?;
        self.window.check(value)?;

        let tag_start = body.len() - TAG_SIZE;
        let tag = Tag::from_slice(&body[tag_start..]).ok_or(CryptoError::AuthenticationFailed)?;
        let mut plaintext = body[NONCE_SIZE..tag_start].to_vec();
        self.key.decrypt_in_place(&nonce, &mut plaintext, &tag, &[])?;

        self.window.commit(value);
        Ok(plaintext)
    }

    /// Last accepted peer sequence value.
    #[must_use]
    pub fn last_accepted(&self) -> u128 {
        self.window.last_accepted()
    }

    /// Local role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }
}

/// Slice out `nonce || ciphertext || tag` according to the LEN prefix.
///
/// # Errors
///
/// Returns [`CryptoError::IncompleteFrame`] when the buffer is shorter than the
/// prefix, the declared length is below nonce + tag, or fewer bytes are
/// present than declared.
pub fn envelope_body(envelope: &[u8]) -> Result<&[u8], CryptoError> {
    let Some(prefix) = envelope.get(..LEN_PREFIX_SIZE) else {
        return Err(CryptoError::IncompleteFrame {
            expected: LEN_PREFIX_SIZE,
            actual: envelope.len(),
        });
    };
    let declared = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    if declared < MIN_ENVELOPE_BODY {
        return Err(CryptoError::IncompleteFrame {
            expected: MIN_ENVELOPE_BODY,
            actual: declared,
        });
    }

    let end = LEN_PREFIX_SIZE + declared;
    envelope
        .get(LEN_PREFIX_SIZE..end)
        .ok_or(CryptoError::IncompleteFrame {
            expected: end,
            actual: envelope.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ENVELOPE_OVERHEAD;
    use rand_core::OsRng;

    fn pair() -> ((Sealer, Opener), (Sealer, Opener)) {
        let key = AeadKey::generate(&mut OsRng);
        let client = SessionCipher::new(key.clone(), Role::Initiator).into_halves();
        let server = SessionCipher::new(key, Role::Responder).into_halves();
        (client, server)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();

        let envelope = c_seal.seal(b"hello tunnel").unwrap();
        assert_eq!(envelope.len(), 12 + ENVELOPE_OVERHEAD);

        let plaintext = s_open.open(&envelope).unwrap();
        assert_eq!(plaintext, b"hello tunnel");
        assert_eq!(s_open.last_accepted(), 2);
    }

    #[test]
    fn test_both_directions() {
        let ((mut c_seal, mut c_open), (mut s_seal, mut s_open)) = pair();

        for i in 0..20u8 {
            let up = c_seal.seal(&[i; 8]).unwrap();
            let down = s_seal.seal(&[i; 9]).unwrap();
            assert_eq!(s_open.open(&up).unwrap(), vec![i; 8]);
            assert_eq!(c_open.open(&down).unwrap(), vec![i; 9]);
        }
        assert_eq!(c_seal.last_sequence(), 40);
        assert_eq!(s_seal.last_sequence(), 41);
    }

    #[test]
    fn test_len_prefix_covers_body() {
        let ((mut c_seal, _), _) = pair();
        let envelope = c_seal.seal(&[0u8; 100]).unwrap();
        let declared = u32::from_be_bytes(envelope[..4].try_into().unwrap()) as usize;
        assert_eq!(declared, 100 + NONCE_SIZE + TAG_SIZE);
        assert_eq!(declared + 4, envelope.len());
    }

    #[test]
    fn test_empty_plaintext() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        let envelope = c_seal.seal(&[]).unwrap();
        assert_eq!(envelope.len(), ENVELOPE_OVERHEAD);
        assert!(s_open.open(&envelope).unwrap().is_empty());
    }

    #[test]
    fn test_replay_rejected() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        let envelope = c_seal.seal(b"once").unwrap();

        s_open.open(&envelope).unwrap();
        assert_eq!(
            s_open.open(&envelope),
            Err(CryptoError::ReplayOrOutOfOrder { last: 2 })
        );
    }

    #[test]
    fn test_own_envelope_rejected() {
        // Reflecting a sender's envelope back to it must not open.
        let ((mut c_seal, mut c_open), _) = pair();
        let envelope = c_seal.seal(b"echo").unwrap();
        assert!(matches!(
            c_open.open(&envelope),
            Err(CryptoError::ReplayOrOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_reordered_older_rejected() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        let first = c_seal.seal(b"first").unwrap();
        let second = c_seal.seal(b"second").unwrap();

        s_open.open(&second).unwrap();
        assert!(s_open.open(&first).is_err());
    }

    #[test]
    fn test_gap_within_window_accepted() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        for _ in 0..9 {
            c_seal.seal(b"lost").unwrap();
        }
        let tenth = c_seal.seal(b"arrives").unwrap();
        assert_eq!(s_open.open(&tenth).unwrap(), b"arrives");
    }

    #[test]
    fn test_gap_beyond_window_rejected() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        for _ in 0..10 {
            c_seal.seal(b"lost").unwrap();
        }
        let eleventh = c_seal.seal(b"too far").unwrap();
        assert!(matches!(
            s_open.open(&eleventh),
            Err(CryptoError::ReplayOrOutOfOrder { .. })
        ));
    }

    #[test]
    fn test_tamper_leaves_window_untouched() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        let mut envelope = c_seal.seal(b"payload").unwrap();
        let last = envelope.len() - 1;
        envelope[last] ^= 0x80;

        assert_eq!(s_open.open(&envelope), Err(CryptoError::AuthenticationFailed));
        assert_eq!(s_open.last_accepted(), 0);

        envelope[last] ^= 0x80;
        assert_eq!(s_open.open(&envelope).unwrap(), b"payload");
    }

    #[test]
    fn test_wrong_key_fails() {
        let (mut c_seal, _) =
            SessionCipher::new(AeadKey::new([1; 32]), Role::Initiator).into_halves();
        let (_, mut s_open) =
            SessionCipher::new(AeadKey::new([2; 32]), Role::Responder).into_halves();

        let envelope = c_seal.seal(b"payload").unwrap();
        assert_eq!(s_open.open(&envelope), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_short_prefix() {
        let (_, (_, mut s_open)) = pair();
        assert_eq!(
            s_open.open(&[0, 0]),
            Err(CryptoError::IncompleteFrame {
                expected: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn test_declared_below_minimum() {
        let (_, (_, mut s_open)) = pair();
        let mut envelope = 10u32.to_be_bytes().to_vec();
        envelope.extend_from_slice(&[0u8; 10]);
        assert_eq!(
            s_open.open(&envelope),
            Err(CryptoError::IncompleteFrame {
                expected: MIN_ENVELOPE_BODY,
                actual: 10
            })
        );
    }

    #[test]
    fn test_truncated_body() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        let envelope = c_seal.seal(b"truncate me").unwrap();
        let short = &envelope[..envelope.len() - 1];
        assert_eq!(
            s_open.open(short),
            Err(CryptoError::IncompleteFrame {
                expected: envelope.len(),
                actual: envelope.len() - 1
            })
        );
        assert_eq!(s_open.open(&envelope).unwrap(), b"truncate me");
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let ((mut c_seal, _), (_, mut s_open)) = pair();
        let mut envelope = c_seal.seal(b"body").unwrap();
        envelope.extend_from_slice(b"garbage");
        assert_eq!(s_open.open(&envelope).unwrap(), b"body");
    }

    #[test]
    fn test_halves_report_role() {
        let (sealer, opener) =
            SessionCipher::new(AeadKey::new([0; 32]), Role::Responder).into_halves();
        assert_eq!(sealer.role(), Role::Responder);
        assert_eq!(opener.role(), Role::Responder);
        assert_eq!(sealer.last_sequence(), 1);
        assert_eq!(opener.last_accepted(), 0);
    }
}
