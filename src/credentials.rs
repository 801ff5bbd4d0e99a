//! API key rotation with per-key cool-down after failures.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Default window a failed key stays out of rotation.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);

const PREFIX_LEN: usize = 6;

/// Opaque API secret. `Debug` and `Display` only ever show the prefix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    secret: String,
}

impl Credential {
    /// Wraps a raw secret, trimming surrounding whitespace.
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into().trim().to_string(),
        }
    }

    /// Full secret for the `Authorization` header.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// First characters of the secret, safe to log.
    pub fn prefix(&self) -> &str {
        let end = self
            .secret
            .char_indices()
            .nth(PREFIX_LEN)
            .map(|(idx, _)| idx)
            .unwrap_or(self.secret.len());
        &self.secret[..end]
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({}…)", self.prefix())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

struct Slot {
    credential: Credential,
    failed_at: Option<Instant>,
}

/// Ordered set of credentials for one caller and provider base URL.
///
/// Keys are never removed. A failed key is skipped until its cool-down has
/// elapsed; when every key is cooling down the cursor key is still handed out
/// and the caller's attempt budget decides when to stop.
pub struct CredentialRotator {
    slots: Vec<Slot>,
    cursor: usize,
    cooldown: Duration,
}

impl CredentialRotator {
    /// Builds a rotator with the default five minute cool-down.
    pub fn new<I, S>(secrets: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_cooldown(secrets, DEFAULT_COOLDOWN)
    }

    /// Builds a rotator with a custom cool-down window.
    pub fn with_cooldown<I, S>(secrets: I, cooldown: Duration) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut slots: Vec<Slot> = Vec::new();
        for credential in secrets.into_iter().map(Credential::new) {
            if credential.secret.is_empty() {
                continue;
            }
            if slots.iter().any(|slot| slot.credential == credential) {
                tracing::warn!(key = %credential, "ignoring duplicate API key");
                continue;
            }
            slots.push(Slot {
                credential,
                failed_at: None,
            });
        }
        if slots.is_empty() {
            return Err(Error::NoCredentials);
        }
        Ok(Self {
            slots,
            cursor: 0,
            cooldown,
        })
    }

    /// Number of distinct configured keys.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; construction rejects an empty key list.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the key to use for the next attempt.
    pub fn current(&mut self) -> Credential {
        let now = Instant::now();
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if let Some(failed_at) = slot.failed_at {
                if now.saturating_duration_since(failed_at) >= self.cooldown {
                    tracing::info!(key = %slot.credential, "credential recovered from cool-down");
                    slot.failed_at = None;
                    self.cursor = idx;
                    break;
                }
            }
        }

        let count = self.slots.len();
        if let Some(offset) = (0..count).find(|offset| {
            let idx = (self.cursor + offset) % count;
            self.is_usable(idx, now)
        }) {
            self.cursor = (self.cursor + offset) % count;
        }
        self.slots[self.cursor].credential.clone()
    }

    /// Advances the cursor to the next key, wrapping around.
    pub fn rotate(&mut self) -> Credential {
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.slots[self.cursor].credential.clone()
    }

    /// Stamps the key as failed now; it is skipped until the cool-down passes.
    pub fn mark_failed(&mut self, credential: &Credential) {
        let now = Instant::now();
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| &slot.credential == credential)
        {
            slot.failed_at = Some(now);
        }
    }

    /// Marks `credential` failed and moves on to the next usable key.
    ///
    /// The cursor only advances when it still points at `credential`, so two
    /// attempts failing on the same key concurrently rotate once.
    pub fn fail_over(&mut self, credential: &Credential) -> Credential {
        self.mark_failed(credential);
        if self.slots[self.cursor].credential == *credential {
            self.rotate();
        }
        self.current()
    }

    fn is_usable(&self, idx: usize, now: Instant) -> bool {
        match self.slots[idx].failed_at {
            None => true,
            Some(failed_at) => now.saturating_duration_since(failed_at) >= self.cooldown,
        }
    }
}

impl fmt::Debug for CredentialRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRotator")
            .field("keys", &self.slots.len())
            .field("cursor", &self.cursor)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}
