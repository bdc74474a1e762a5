// Streaming AES-128-CBC segment decryption.

use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit};
use futures::Stream;

use crate::error::DownloadError;
use crate::fetch::ByteStream;
use crate::playlist::EncryptionSpec;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_LEN: usize = 16;

/// Wrap an encrypted byte stream into a plaintext byte stream.
///
/// The returned stream owns the ciphertext stream: dropping the outer stream
/// drops the inner one, and a crypto failure detaches the inner stream
/// before the error is surfaced.
pub trait Decryptor: Send + Sync {
    fn decrypt(
        &self,
        ciphertext: ByteStream,
        key: &[u8; 16],
        spec: &EncryptionSpec,
        iv_index: u64,
    ) -> Result<ByteStream, DownloadError>;
}

/// Default decryptor: AES-128-CBC with PKCS#7 padding, streaming. Whole
/// blocks are decrypted as they arrive; the final block is withheld until
/// EOF so the padding can be stripped.
#[derive(Debug, Default)]
pub struct Aes128CbcDecryptor;

impl Decryptor for Aes128CbcDecryptor {
    fn decrypt(
        &self,
        ciphertext: ByteStream,
        key: &[u8; 16],
        spec: &EncryptionSpec,
        iv_index: u64,
    ) -> Result<ByteStream, DownloadError> {
        let iv = spec.iv.unwrap_or_else(|| index_to_iv(iv_index));
        let cipher = Aes128CbcDec::new_from_slices(key, &iv).map_err(|e| {
            DownloadError::decryption(format!("failed to initialize AES decryptor: {e}"))
        })?;
        Ok(Box::pin(CbcDecryptStream {
            inner: Some(ciphertext),
            cipher,
            pending: BytesMut::new(),
            finished: false,
        }))
    }
}

/// The default HLS IV: the 128-bit big-endian representation of the
/// media-sequence-adjusted segment index.
pub fn index_to_iv(index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&index.to_be_bytes());
    iv
}

struct CbcDecryptStream {
    inner: Option<ByteStream>,
    cipher: Aes128CbcDec,
    pending: BytesMut,
    finished: bool,
}

/// How many buffered bytes can be decrypted now. The last complete block is
/// withheld while it could still be the final (padded) one; a trailing
/// partial block proves more ciphertext follows, so every complete block is
/// fair game.
fn decryptable_len(buffered: usize) -> usize {
    let remainder = buffered % BLOCK_LEN;
    if remainder == 0 {
        buffered.saturating_sub(BLOCK_LEN)
    } else {
        buffered - remainder
    }
}

impl CbcDecryptStream {
    fn decrypt_pending(&mut self, take: usize) -> Bytes {
        let mut blocks = self.pending.split_to(take);
        for block in blocks.chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        blocks.freeze()
    }

    fn finalize(&mut self) -> Result<Option<Bytes>, DownloadError> {
        if self.pending.is_empty() {
            return Err(DownloadError::decryption("ciphertext is empty"));
        }
        if self.pending.len() != BLOCK_LEN {
            return Err(DownloadError::decryption(format!(
                "ciphertext length is not a multiple of the AES block size ({} trailing bytes)",
                self.pending.len() % BLOCK_LEN
            )));
        }

        let mut block = self.pending.split_to(BLOCK_LEN);
        self.cipher
            .decrypt_block_mut(GenericArray::from_mut_slice(&mut block));

        let pad = block[BLOCK_LEN - 1] as usize;
        if pad == 0 || pad > BLOCK_LEN {
            return Err(DownloadError::decryption("invalid PKCS#7 padding"));
        }
        if block[BLOCK_LEN - pad..].iter().any(|&b| b as usize != pad) {
            return Err(DownloadError::decryption("invalid PKCS#7 padding"));
        }

        block.truncate(BLOCK_LEN - pad);
        if block.is_empty() {
            Ok(None)
        } else {
            Ok(Some(block.freeze()))
        }
    }
}

impl Stream for CbcDecryptStream {
    type Item = Result<Bytes, DownloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            let Some(inner) = this.inner.as_mut() else {
                this.finished = true;
                return Poll::Ready(None);
            };

            match inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    this.pending.extend_from_slice(&chunk);
                    let take = decryptable_len(this.pending.len());
                    if take > 0 {
                        let plaintext = this.decrypt_pending(take);
                        return Poll::Ready(Some(Ok(plaintext)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    // Close the ciphertext stream before surfacing the error.
                    this.inner = None;
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.inner = None;
                    this.finished = true;
                    return match this.finalize() {
                        Ok(Some(tail)) => Poll::Ready(Some(Ok(tail))),
                        Ok(None) => Poll::Ready(None),
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
            }
        }
    }
}
