//! Handshake boundary.
//!
//! The protocol only shuttles opaque handshake records between a [`CryptoSession`] and the
//! wire, inside `CryptHandshake` packets. [`PskSession`] is a pre-shared key
//! implementation: both sides exchange random nonces and prove knowledge of the key with
//! ChaCha20-Poly1305 tags over the transcript.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};
use chacha20poly1305::{
    aead::{rand_core::RngCore, OsRng},
    AeadInPlace, ChaCha20Poly1305, KeyInit, Tag,
};

use crate::consts::{NONCE_BYTES_SIZE, PRIVATE_KEY_SIZE};

pub type Key = [u8; PRIVATE_KEY_SIZE];

pub const HANDSHAKE_NONCE_SIZE: usize = 32;
pub const AUTH_TAG_BYTES: usize = 16;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const CLIENT_FINISHED: u8 = 3;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("failed to generate random bytes: {0}")]
    Random(String),
    #[error("malformed handshake record")]
    Malformed,
    #[error("unexpected handshake record type {0}")]
    UnexpectedRecord(u8),
    #[error("handshake authentication failed")]
    Authentication,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// An opaque, TLS-like handshake state machine.
pub trait CryptoSession: Send {
    fn is_handshake_finished(&self) -> bool;
    /// Consumes pending inbound records and produces outbound ones until no progress
    /// can be made.
    fn advance_handshake(&mut self) -> Result<(), CryptoError>;
    /// Feeds a record received from the peer.
    fn push_wire(&mut self, bytes: &[u8]);
    /// Takes the next record that must be sent to the peer.
    fn pull_wire(&mut self) -> Option<Vec<u8>>;
}

/// Builds a fresh session per connection attempt.
pub type CryptoFactory = Arc<dyn Fn(Role) -> Box<dyn CryptoSession> + Send + Sync>;

pub fn generate_key() -> Result<Key, CryptoError> {
    let mut key: Key = [0; PRIVATE_KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| CryptoError::Random(e.to_string()))?;
    Ok(key)
}

/// Factory for [`PskSession`]s sharing `key`.
pub fn psk_factory(key: Key) -> CryptoFactory {
    Arc::new(move |role| Box::new(PskSession::new(role, key)) as Box<dyn CryptoSession>)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PskState {
    Start,
    AwaitServerHello,
    AwaitClientHello,
    AwaitClientFinished,
    Finished,
}

pub struct PskSession {
    role: Role,
    key: Key,
    state: PskState,
    client_nonce: [u8; HANDSHAKE_NONCE_SIZE],
    server_nonce: [u8; HANDSHAKE_NONCE_SIZE],
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
}

impl PskSession {
    pub fn new(role: Role, key: Key) -> Self {
        Self {
            role,
            key,
            state: PskState::Start,
            client_nonce: [0; HANDSHAKE_NONCE_SIZE],
            server_nonce: [0; HANDSHAKE_NONCE_SIZE],
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn transcript(&self, label: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(label.len() + 2 * HANDSHAKE_NONCE_SIZE);
        aad.extend_from_slice(label);
        aad.extend_from_slice(&self.client_nonce);
        aad.extend_from_slice(&self.server_nonce);
        aad
    }

    fn tag(&self, label: &[u8], nonce: u64) -> Result<Tag, CryptoError> {
        let mut empty = [0u8; 0];
        ChaCha20Poly1305::new((&self.key).into())
            .encrypt_in_place_detached(
                &final_nonce(nonce)?.into(),
                &self.transcript(label),
                &mut empty,
            )
            .map_err(|_| CryptoError::Authentication)
    }

    fn verify(&self, label: &[u8], nonce: u64, tag: &[u8]) -> Result<(), CryptoError> {
        if tag.len() != AUTH_TAG_BYTES {
            return Err(CryptoError::Malformed);
        }
        let mut empty = [0u8; 0];
        ChaCha20Poly1305::new((&self.key).into())
            .decrypt_in_place_detached(
                &final_nonce(nonce)?.into(),
                &self.transcript(label),
                &mut empty,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::Authentication)
    }

    fn fill_nonce(nonce: &mut [u8; HANDSHAKE_NONCE_SIZE]) -> Result<(), CryptoError> {
        OsRng
            .try_fill_bytes(nonce)
            .map_err(|e| CryptoError::Random(e.to_string()))
    }

    /// Runs one step. Returns false when waiting for the peer.
    fn step(&mut self) -> Result<bool, CryptoError> {
        match (self.role, self.state) {
            (_, PskState::Finished) => Ok(false),
            (Role::Initiator, PskState::Start) => {
                Self::fill_nonce(&mut self.client_nonce)?;
                let mut record = vec![CLIENT_HELLO];
                record.extend_from_slice(&self.client_nonce);
                self.outbound.push_back(record);
                self.state = PskState::AwaitServerHello;
                Ok(true)
            }
            (Role::Responder, PskState::Start) => {
                self.state = PskState::AwaitClientHello;
                Ok(true)
            }
            (_, PskState::AwaitServerHello) => {
                let Some(record) = self.inbound.pop_front() else {
                    return Ok(false);
                };
                let body = expect_record(
                    &record,
                    SERVER_HELLO,
                    HANDSHAKE_NONCE_SIZE + AUTH_TAG_BYTES,
                )?;
                self.server_nonce.copy_from_slice(&body[..HANDSHAKE_NONCE_SIZE]);
                self.verify(b"server", 1, &body[HANDSHAKE_NONCE_SIZE..])?;

                let mut finished = vec![CLIENT_FINISHED];
                finished.extend_from_slice(&self.tag(b"client", 2)?);
                self.outbound.push_back(finished);
                self.state = PskState::Finished;
                log::debug!("psk handshake finished (initiator)");
                Ok(true)
            }
            (_, PskState::AwaitClientHello) => {
                let Some(record) = self.inbound.pop_front() else {
                    return Ok(false);
                };
                let body = expect_record(&record, CLIENT_HELLO, HANDSHAKE_NONCE_SIZE)?;
                self.client_nonce.copy_from_slice(body);
                Self::fill_nonce(&mut self.server_nonce)?;

                let mut hello = vec![SERVER_HELLO];
                hello.extend_from_slice(&self.server_nonce);
                hello.extend_from_slice(&self.tag(b"server", 1)?);
                self.outbound.push_back(hello);
                self.state = PskState::AwaitClientFinished;
                Ok(true)
            }
            (_, PskState::AwaitClientFinished) => {
                let Some(record) = self.inbound.pop_front() else {
                    return Ok(false);
                };
                let body = expect_record(&record, CLIENT_FINISHED, AUTH_TAG_BYTES)?;
                self.verify(b"client", 2, body)?;
                self.state = PskState::Finished;
                log::debug!("psk handshake finished (responder)");
                Ok(true)
            }
        }
    }
}

impl CryptoSession for PskSession {
    fn is_handshake_finished(&self) -> bool {
        self.state == PskState::Finished
    }

    fn advance_handshake(&mut self) -> Result<(), CryptoError> {
        while self.step()? {}
        Ok(())
    }

    fn push_wire(&mut self, bytes: &[u8]) {
        self.inbound.push_back(bytes.to_vec());
    }

    fn pull_wire(&mut self) -> Option<Vec<u8>> {
        self.outbound.pop_front()
    }
}

fn final_nonce(nonce: u64) -> Result<[u8; NONCE_BYTES_SIZE], CryptoError> {
    let mut final_nonce = [0; NONCE_BYTES_SIZE];
    io::Cursor::new(&mut final_nonce[4..])
        .write_u64::<LittleEndian>(nonce)
        .map_err(|_| CryptoError::Malformed)?;
    Ok(final_nonce)
}

fn expect_record(record: &[u8], kind: u8, body_len: usize) -> Result<&[u8], CryptoError> {
    match record.split_first() {
        Some((first, body)) if *first == kind && body.len() == body_len => Ok(body),
        Some((first, _)) if *first != kind => Err(CryptoError::UnexpectedRecord(*first)),
        _ => Err(CryptoError::Malformed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump(from: &mut dyn CryptoSession, to: &mut dyn CryptoSession) -> usize {
        let mut moved = 0;
        while let Some(record) = from.pull_wire() {
            to.push_wire(&record);
            moved += 1;
        }
        moved
    }

    #[test]
    fn handshake_with_matching_keys() {
        let key = generate_key().unwrap();
        let mut client = PskSession::new(Role::Initiator, key);
        let mut server = PskSession::new(Role::Responder, key);

        client.advance_handshake().unwrap();
        server.advance_handshake().unwrap();
        assert_eq!(pump(&mut client, &mut server), 1);
        server.advance_handshake().unwrap();
        assert_eq!(pump(&mut server, &mut client), 1);
        client.advance_handshake().unwrap();
        assert!(client.is_handshake_finished());
        assert!(!server.is_handshake_finished());
        assert_eq!(pump(&mut client, &mut server), 1);
        server.advance_handshake().unwrap();
        assert!(server.is_handshake_finished());
    }

    #[test]
    fn handshake_with_wrong_key_fails() {
        let mut client = PskSession::new(Role::Initiator, [1; PRIVATE_KEY_SIZE]);
        let mut server = PskSession::new(Role::Responder, [2; PRIVATE_KEY_SIZE]);

        client.advance_handshake().unwrap();
        pump(&mut client, &mut server);
        server.advance_handshake().unwrap();
        pump(&mut server, &mut client);
        assert_eq!(
            client.advance_handshake(),
            Err(CryptoError::Authentication)
        );
        assert!(!client.is_handshake_finished());
    }

    #[test]
    fn garbage_records_are_rejected() {
        let mut server = PskSession::new(Role::Responder, [0; PRIVATE_KEY_SIZE]);
        server.push_wire(&[CLIENT_HELLO, 1, 2]);
        assert_eq!(server.advance_handshake(), Err(CryptoError::Malformed));

        let mut server = PskSession::new(Role::Responder, [0; PRIVATE_KEY_SIZE]);
        server.push_wire(&[CLIENT_FINISHED; 17]);
        assert_eq!(
            server.advance_handshake(),
            Err(CryptoError::UnexpectedRecord(CLIENT_FINISHED))
        );
    }
}
