//! Key service: a dedicated task that owns the KDF parameters and answers
//! typed requests, so passphrase derivation never runs on the caller's task.
//!
//! Each request is executed on the blocking pool. Callers get an answer,
//! a cancellation, or a timeout; whichever comes first. A late answer to an
//! abandoned request is dropped.

use std::time::Duration;

use dm_core::config::CryptoConfig;
use dm_core::{DmError, DmResult};
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::kdf::{self, DerivedKey, KdfAlgorithm, KdfParams, MasterKey};
use crate::keys::{self, FileKey, WrappedKey};
use crate::SALT_SIZE;

const REQUEST_QUEUE_DEPTH: usize = 32;

pub enum KeyRequest {
    /// Derive a master key. With `algorithm` set the fallback is disabled
    /// and the given scheme is used; this requires a salt.
    Derive {
        passphrase: SecretString,
        salt: Option<[u8; SALT_SIZE]>,
        algorithm: Option<KdfAlgorithm>,
    },
    WrapFileKey {
        master: MasterKey,
        file_key: FileKey,
    },
    UnwrapFileKey {
        master: MasterKey,
        wrapped: WrappedKey,
    },
}

impl KeyRequest {
    fn kind(&self) -> &'static str {
        match self {
            KeyRequest::Derive { .. } => "derive",
            KeyRequest::WrapFileKey { .. } => "wrap_file_key",
            KeyRequest::UnwrapFileKey { .. } => "unwrap_file_key",
        }
    }
}

#[derive(Debug)]
pub enum KeyReply {
    Derived(DerivedKey),
    WrappedKey(WrappedKey),
    Unwrapped(FileKey),
    Error(DmError),
}

struct Envelope {
    request: KeyRequest,
    reply: oneshot::Sender<KeyReply>,
}

/// Handle to the key service task. Cheap to clone.
#[derive(Clone)]
pub struct KeyService {
    tx: mpsc::Sender<Envelope>,
    derive_timeout: Duration,
    wrap_timeout: Duration,
}

impl KeyService {
    /// Spawn the service on the current runtime. It stops when every handle is dropped.
    pub fn spawn(params: KdfParams, derive_timeout: Duration, wrap_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        tokio::spawn(serve(rx, params));
        Self {
            tx,
            derive_timeout,
            wrap_timeout,
        }
    }

    pub fn from_config(config: &CryptoConfig) -> Self {
        Self::spawn(
            KdfParams::from(config),
            Duration::from_secs(config.derive_timeout_secs),
            Duration::from_secs(config.wrap_timeout_secs),
        )
    }

    /// Derive with Argon2id, falling back to PBKDF2. Missing salt is generated.
    pub async fn derive(
        &self,
        passphrase: SecretString,
        salt: Option<[u8; SALT_SIZE]>,
        cancel: &CancellationToken,
    ) -> DmResult<DerivedKey> {
        let request = KeyRequest::Derive {
            passphrase,
            salt,
            algorithm: None,
        };
        match self.call(request, self.derive_timeout, cancel).await? {
            KeyReply::Derived(k) => Ok(k),
            other => Err(unexpected(other)),
        }
    }

    /// Re-derive using the scheme recorded for a file.
    pub async fn derive_with(
        &self,
        algorithm: KdfAlgorithm,
        passphrase: SecretString,
        salt: [u8; SALT_SIZE],
        cancel: &CancellationToken,
    ) -> DmResult<DerivedKey> {
        let request = KeyRequest::Derive {
            passphrase,
            salt: Some(salt),
            algorithm: Some(algorithm),
        };
        match self.call(request, self.derive_timeout, cancel).await? {
            KeyReply::Derived(k) => Ok(k),
            other => Err(unexpected(other)),
        }
    }

    pub async fn wrap_file_key(
        &self,
        master: &MasterKey,
        file_key: &FileKey,
        cancel: &CancellationToken,
    ) -> DmResult<WrappedKey> {
        let request = KeyRequest::WrapFileKey {
            master: master.clone(),
            file_key: file_key.clone(),
        };
        match self.call(request, self.wrap_timeout, cancel).await? {
            KeyReply::WrappedKey(w) => Ok(w),
            other => Err(unexpected(other)),
        }
    }

    pub async fn unwrap_file_key(
        &self,
        master: &MasterKey,
        wrapped: &WrappedKey,
        cancel: &CancellationToken,
    ) -> DmResult<FileKey> {
        let request = KeyRequest::UnwrapFileKey {
            master: master.clone(),
            wrapped: wrapped.clone(),
        };
        match self.call(request, self.wrap_timeout, cancel).await? {
            KeyReply::Unwrapped(k) => Ok(k),
            other => Err(unexpected(other)),
        }
    }

    async fn call(
        &self,
        request: KeyRequest,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> DmResult<KeyReply> {
        let kind = request.kind();
        let fail = failure_for(&request);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| fail("key service is not running".into()))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(kind, "key request cancelled");
                Err(fail("cancelled".into()))
            }
            res = tokio::time::timeout(limit, reply_rx) => {
                match res {
                    Err(_) => {
                        warn!(kind, timeout_ms = limit.as_millis() as u64, "key request timed out");
                        Err(fail(format!("timed out after {}ms", limit.as_millis())))
                    }
                    Ok(Err(_)) => Err(fail("key service dropped the request".into())),
                    Ok(Ok(KeyReply::Error(e))) => Err(e),
                    Ok(Ok(reply)) => Ok(reply),
                }
            }
        }
    }
}

fn failure_for(request: &KeyRequest) -> fn(String) -> DmError {
    match request {
        KeyRequest::Derive { .. } => DmError::DerivationFailure,
        KeyRequest::WrapFileKey { .. } => DmError::WrapFailure,
        KeyRequest::UnwrapFileKey { .. } => DmError::UnwrapFailure,
    }
}

fn unexpected(reply: KeyReply) -> DmError {
    DmError::Other(anyhow::anyhow!("key service answered with {reply:?}"))
}

async fn serve(mut rx: mpsc::Receiver<Envelope>, params: KdfParams) {
    debug!("key service started");
    while let Some(Envelope { request, reply }) = rx.recv().await {
        let params = params.clone();
        tokio::spawn(async move {
            let kind = request.kind();
            let fail = failure_for(&request);
            let answer = match tokio::task::spawn_blocking(move || handle(request, &params)).await {
                Ok(answer) => answer,
                Err(e) => KeyReply::Error(fail(format!("worker panicked: {e}"))),
            };
            if let KeyReply::Error(e) = &answer {
                error!(kind, error = %e, "key request failed");
            }
            // receiver gone means the caller timed out or was cancelled
            let _ = reply.send(answer);
        });
    }
    debug!("key service stopped");
}

fn handle(request: KeyRequest, params: &KdfParams) -> KeyReply {
    let result = match request {
        KeyRequest::Derive {
            passphrase,
            salt,
            algorithm: None,
        } => kdf::derive_master_key(&passphrase, salt, params).map(KeyReply::Derived),
        KeyRequest::Derive {
            passphrase,
            salt,
            algorithm: Some(algorithm),
        } => match salt {
            Some(salt) => kdf::derive_with(algorithm, &passphrase, &salt, params).map(|master| {
                KeyReply::Derived(DerivedKey {
                    master,
                    salt,
                    algorithm,
                })
            }),
            None => Err(DmError::DerivationFailure(
                "explicit KDF algorithm requires the recorded salt".into(),
            )),
        },
        KeyRequest::WrapFileKey { master, file_key } => {
            keys::wrap_file_key(&master, &file_key).map(KeyReply::WrappedKey)
        }
        KeyRequest::UnwrapFileKey { master, wrapped } => {
            keys::unwrap_file_key(&master, &wrapped).map(KeyReply::Unwrapped)
        }
    };
    result.unwrap_or_else(KeyReply::Error)
}
