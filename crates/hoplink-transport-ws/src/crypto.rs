//! Authenticated encryption layered over any byte stream.
//!
//! Records on the wire are `[u32 BE length][24-byte nonce][ciphertext]`,
//! sealed with XChaCha20-Poly1305 under keys derived from a 32-byte
//! pre-shared secret. Each direction uses its own subkey, so a record
//! can never be reflected back to its sender.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{AeadCore, Key, XChaCha20Poly1305, XNonce};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use hoplink_core::{ProxyError, ProxyResult};

/// Pre-shared keys are exactly this many bytes.
pub const KEY_LEN: usize = 32;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const LEN_PREFIX: usize = 4;
const MAX_PLAINTEXT: usize = 16 * 1024;
const MAX_RECORD: usize = NONCE_LEN + MAX_PLAINTEXT + TAG_LEN;

const LABEL_TO_RESPONDER: &[u8] = b"hoplink stream client to server";
const LABEL_TO_INITIATOR: &[u8] = b"hoplink stream server to client";

/// Which end of the link this stream is. The two ends must disagree, or
/// each will seal with the subkey the other one seals with and nothing
/// will decrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that dialed the connection.
    Initiator,
    /// The side that accepted it.
    Responder,
}

fn derive_subkey(secret: &[u8], label: &[u8]) -> Key {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(label);
    Key::clone_from_slice(&hasher.finalize())
}

/// Encrypting wrapper around an inner duplex stream.
///
/// Writes are sealed into records of at most 16 KiB plaintext; reads
/// reassemble records and hand back plaintext, tolerating any read size.
/// A record that fails to authenticate surfaces as an `InvalidData` read
/// error, and an inner stream that ends mid-record as `UnexpectedEof`.
pub struct EncryptedStream<S> {
    inner: S,
    seal: XChaCha20Poly1305,
    open: XChaCha20Poly1305,
    read_plain: BytesMut,
    read_cipher: BytesMut,
    write_buf: BytesMut,
    read_eof: bool,
}

impl<S> std::fmt::Debug for EncryptedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStream")
            .field("read_eof", &self.read_eof)
            .finish_non_exhaustive()
    }
}

impl<S> EncryptedStream<S> {
    /// Wrap `inner`, deriving directional subkeys from `secret`.
    ///
    /// Fails if the secret is not exactly [`KEY_LEN`] bytes; a truncated
    /// or empty key silently weakening the link is not an option.
    pub fn new(inner: S, secret: &[u8], role: Role) -> ProxyResult<Self> {
        if secret.len() != KEY_LEN {
            return Err(ProxyError::Crypto(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                secret.len()
            )));
        }
        let to_responder = derive_subkey(secret, LABEL_TO_RESPONDER);
        let to_initiator = derive_subkey(secret, LABEL_TO_INITIATOR);
        let (seal_key, open_key) = match role {
            Role::Initiator => (to_responder, to_initiator),
            Role::Responder => (to_initiator, to_responder),
        };
        Ok(Self {
            inner,
            seal: XChaCha20Poly1305::new(&seal_key),
            open: XChaCha20Poly1305::new(&open_key),
            read_plain: BytesMut::new(),
            read_cipher: BytesMut::new(),
            write_buf: BytesMut::new(),
            read_eof: false,
        })
    }
}

impl<S> EncryptedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for EncryptedStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.read_plain.is_empty() {
                let n = me.read_plain.len().min(buf.remaining());
                buf.put_slice(&me.read_plain[..n]);
                me.read_plain.advance(n);
                return Poll::Ready(Ok(()));
            }

            if me.read_cipher.len() >= LEN_PREFIX {
                let mut len_bytes = [0u8; LEN_PREFIX];
                len_bytes.copy_from_slice(&me.read_cipher[..LEN_PREFIX]);
                let record_len = u32::from_be_bytes(len_bytes) as usize;
                if record_len < NONCE_LEN + TAG_LEN || record_len > MAX_RECORD {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid record length {record_len}"),
                    )));
                }
                if me.read_cipher.len() >= LEN_PREFIX + record_len {
                    me.read_cipher.advance(LEN_PREFIX);
                    let record = me.read_cipher.split_to(record_len);
                    let (nonce, ciphertext) = record.split_at(NONCE_LEN);
                    let plain = me
                        .open
                        .decrypt(XNonce::from_slice(nonce), ciphertext)
                        .map_err(|_| {
                            io::Error::new(io::ErrorKind::InvalidData, "record failed to decrypt")
                        })?;
                    me.read_plain.extend_from_slice(&plain);
                    continue;
                }
            }

            if me.read_eof {
                if me.read_cipher.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended mid record",
                )));
            }

            let mut chunk = [0u8; 16 * 1024];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut me.inner).poll_read(cx, &mut chunk_buf))?;
            let filled = chunk_buf.filled();
            if filled.is_empty() {
                me.read_eof = true;
            } else {
                me.read_cipher.extend_from_slice(filled);
            }
        }
    }
}

impl<S> AsyncWrite for EncryptedStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let me = self.get_mut();
        // One sealed record in flight at a time.
        ready!(me.poll_write_pending(cx))?;

        let chunk = &data[..data.len().min(MAX_PLAINTEXT)];
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = me
            .seal
            .encrypt(&nonce, chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "encryption failed"))?;

        let record_len = (NONCE_LEN + ciphertext.len()) as u32;
        me.write_buf.extend_from_slice(&record_len.to_be_bytes());
        me.write_buf.extend_from_slice(&nonce);
        me.write_buf.extend_from_slice(&ciphertext);

        // The record is committed; push what the inner stream will take
        // now and leave the rest for the next flush.
        if let Poll::Ready(Err(e)) = me.poll_write_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_write_pending(cx))?;
        Pin::new(&mut me.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        ready!(me.poll_write_pending(cx))?;
        Pin::new(&mut me.inner).poll_shutdown(cx)
    }
}
