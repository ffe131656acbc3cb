use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use aead::{AeadInPlace, Key, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::error::{Result, TransportError};
use crate::security::parameters::SecuritySessionParameters;

/// The negotiated per-session transformation applied to serialized messages.
pub trait SessionTransform: Send + Sync + 'static {
    fn encrypt(&self, buf: &mut BytesMut) -> Result<()>;

    fn decrypt(&self, buf: &mut BytesMut) -> Result<()>;
}

/// Establishes security sessions of one kind with remote hosts. Establishment is asynchronous
///  and may involve network round trips.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecuritySessionProvider: Send + Sync + 'static {
    async fn establish(&self, remote_uri: &str) -> Result<Arc<dyn SessionTransform>>;
}


pub struct NoTransform;
impl SessionTransform for NoTransform {
    fn encrypt(&self, _buf: &mut BytesMut) -> Result<()> {
        // nothing to be done
        Ok(())
    }

    fn decrypt(&self, _buf: &mut BytesMut) -> Result<()> {
        // nothing to be done
        Ok(())
    }
}

/// Pass-through sessions - registered under [SecuritySessionParameters::DEFAULT_NAME]
pub struct NoSecurityProvider;
#[async_trait]
impl SecuritySessionProvider for NoSecurityProvider {
    async fn establish(&self, _remote_uri: &str) -> Result<Arc<dyn SessionTransform>> {
        Ok(Arc::new(NoTransform))
    }
}


/// AES-256-GCM with a pre-shared key. The nonce is appended to the ciphertext, so the overhead
///  is 12 bytes of nonce plus 16 bytes of tag.
pub struct Aes256GcmTransform {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl Aes256GcmTransform {
    const NONCE_LEN: usize = 12;

    pub fn new(key: &[u8]) -> Result<Aes256GcmTransform> {
        if key.len() != 32 {
            return Err(TransportError::Configuration(format!("AES-256 keys must have 32 bytes, was {}", key.len())));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);

        Ok(Aes256GcmTransform {
            cipher: Aes256Gcm::new(key),
            nonce_fixed: rand::random(),
            nonce_incremented: AtomicU64::new(rand::random()),
        })
    }

    fn unique_nonce(&self) -> Nonce<Aes256Gcm> {
        let mut buf = [0u8; Self::NONCE_LEN];
        buf[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        buf[4..].copy_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        Nonce::<Aes256Gcm>::clone_from_slice(&buf)
    }
}

impl SessionTransform for Aes256GcmTransform {
    fn encrypt(&self, buf: &mut BytesMut) -> Result<()> {
        let nonce = self.unique_nonce();
        self.cipher.encrypt_in_place(&nonce, b"", buf)
            .map_err(|_| TransportError::SecurityFailure { name: "aes-256-gcm".to_string(), cause: "encryption failed".to_string() })?;
        buf.extend_from_slice(nonce.as_slice());
        Ok(())
    }

    fn decrypt(&self, buf: &mut BytesMut) -> Result<()> {
        if buf.len() < Self::NONCE_LEN {
            return Err(TransportError::malformed("encrypted content shorter than its nonce"));
        }

        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(&buf[buf.len() - Self::NONCE_LEN..]);
        buf.truncate(buf.len() - Self::NONCE_LEN);
        trace!("decrypting {} bytes", buf.len());
        self.cipher.decrypt_in_place(&nonce, b"", buf)
            .map_err(|_| TransportError::SecurityFailure { name: "aes-256-gcm".to_string(), cause: "decryption failed".to_string() })
    }
}

/// Pre-shared key sessions: establishment is local, there is no handshake.
pub struct Aes256GcmProvider {
    key: Vec<u8>,
}

impl Aes256GcmProvider {
    pub fn new(key: &[u8]) -> Result<Aes256GcmProvider> {
        // fail at setup time rather than on the first message
        Aes256GcmTransform::new(key)?;
        Ok(Aes256GcmProvider { key: key.to_vec() })
    }
}

#[async_trait]
impl SecuritySessionProvider for Aes256GcmProvider {
    async fn establish(&self, remote_uri: &str) -> Result<Arc<dyn SessionTransform>> {
        debug!("establishing AES-256-GCM session with {}", remote_uri);
        Ok(Arc::new(Aes256GcmTransform::new(&self.key)?))
    }
}


/// Security session providers by session name
pub struct SecuritySessionProviders {
    providers: RwLock<FxHashMap<String, Arc<dyn SecuritySessionProvider>>>,
}

impl Default for SecuritySessionProviders {
    fn default() -> Self {
        let result = SecuritySessionProviders {
            providers: Default::default(),
        };
        result.register(SecuritySessionParameters::DEFAULT_NAME, Arc::new(NoSecurityProvider));
        result
    }
}

impl SecuritySessionProviders {
    pub fn register(&self, name: impl Into<String>, provider: Arc<dyn SecuritySessionProvider>) {
        self.providers.write().unwrap().insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn SecuritySessionProvider>> {
        self.providers.read().unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::SecurityFailure { name: name.to_string(), cause: "no provider registered under this name".to_string() })
    }
}
