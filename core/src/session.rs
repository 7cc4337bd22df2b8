//! Explicit identity and privilege context.
//!
//! The acting user is injected once at startup as an [`Identity`] and passed
//! into every mutating call. Admin-only operations take a [`Session`], which
//! can only be elevated through [`AdminGate::unlock`].

use serde::{Deserialize, Serialize};

use crate::errors::{IntakeError, Result};
use crate::hasher;
use crate::logging::{self, LogAction};
use crate::settings::{Setting, ADMIN_PIN_DIGEST};
use crate::store::Store;

const MIN_PIN_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    user: String,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Result<Self> {
        let user = user.into().trim().to_string();
        if user.is_empty() {
            return Err(IntakeError::InvalidInput("user must not be empty".into()));
        }
        Ok(Self { user })
    }

    pub fn user(&self) -> &str {
        &self.user
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    identity: Identity,
    elevated: bool,
}

impl Session {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            elevated: false,
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// The acting identity, provided the session holds admin rights.
    pub fn require_elevated(&self) -> Result<&Identity> {
        if self.elevated {
            Ok(&self.identity)
        } else {
            Err(IntakeError::Unauthorized)
        }
    }

    /// Give up admin rights, e.g. when the admin panel is closed.
    pub fn lock(self) -> Self {
        Self::new(self.identity)
    }
}

/// Verifies the admin PIN against the digest kept in settings.
pub struct AdminGate;

impl AdminGate {
    /// Store the first PIN. Returns `false` if one is already configured.
    pub async fn provision(store: &Store, identity: &Identity, pin: &str) -> Result<bool> {
        validate_pin(pin)?;
        let digest = hasher::digest(pin.as_bytes());
        let identity = identity.clone();
        store
            .write(move |tx| {
                if tx.exists::<Setting>(ADMIN_PIN_DIGEST)? {
                    return Ok(false);
                }
                tx.add(&Setting::new(ADMIN_PIN_DIGEST, digest.into()))?;
                logging::append(tx, LogAction::SettingChange, None, None, &identity)?;
                Ok(true)
            })
            .await
    }

    /// Exchange a correct PIN for an elevated session.
    pub async fn unlock(store: &Store, identity: &Identity, pin: &str) -> Result<Session> {
        let stored = store.get::<Setting>(ADMIN_PIN_DIGEST).await?;
        let Some(stored) = stored.and_then(|s| s.value.as_str().map(str::to_string)) else {
            log::warn!("admin unlock attempted before a PIN was provisioned");
            return Err(IntakeError::Unauthorized);
        };
        if !hasher::verify_secret(pin, &stored) {
            log::warn!("admin unlock denied for {}", identity.user());
            return Err(IntakeError::Unauthorized);
        }
        let actor = identity.clone();
        store
            .write(move |tx| logging::append(tx, LogAction::AdminUnlock, None, None, &actor))
            .await?;
        Ok(Session {
            identity: identity.clone(),
            elevated: true,
        })
    }

    pub async fn change_pin(store: &Store, session: &Session, pin: &str) -> Result<()> {
        let actor = session.require_elevated()?.clone();
        validate_pin(pin)?;
        let digest = hasher::digest(pin.as_bytes());
        store
            .write(move |tx| {
                tx.put(&Setting::new(ADMIN_PIN_DIGEST, digest.into()))?;
                logging::append(tx, LogAction::SettingChange, None, None, &actor)?;
                Ok(())
            })
            .await
    }
}

fn validate_pin(pin: &str) -> Result<()> {
    if pin.chars().count() < MIN_PIN_LEN {
        return Err(IntakeError::InvalidInput(format!(
            "PIN must have at least {MIN_PIN_LEN} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_pool;

    #[tokio::test]
    async fn unlock_requires_the_provisioned_pin() {
        let (_dir, pool) = temp_pool();
        let store = Store::new(pool);
        let me = Identity::new("lager-1").unwrap();

        assert!(matches!(
            AdminGate::unlock(&store, &me, "1234").await,
            Err(IntakeError::Unauthorized)
        ));
        assert!(AdminGate::provision(&store, &me, "1234").await.unwrap());
        assert!(!AdminGate::provision(&store, &me, "9999").await.unwrap());

        assert!(AdminGate::unlock(&store, &me, "9999").await.is_err());
        let session = AdminGate::unlock(&store, &me, "1234").await.unwrap();
        assert!(session.is_elevated());
        assert!(!session.lock().is_elevated());
    }

    #[tokio::test]
    async fn pin_digest_is_stored_not_plaintext() {
        let (_dir, pool) = temp_pool();
        let store = Store::new(pool);
        let me = Identity::new("lager-1").unwrap();
        AdminGate::provision(&store, &me, "2468").await.unwrap();
        let stored = store.get::<Setting>(ADMIN_PIN_DIGEST).await.unwrap().unwrap();
        assert_eq!(stored.value, hasher::digest(b"2468"));
    }

    #[tokio::test]
    async fn change_pin_needs_elevation() {
        let (_dir, pool) = temp_pool();
        let store = Store::new(pool);
        let me = Identity::new("lager-1").unwrap();
        AdminGate::provision(&store, &me, "1234").await.unwrap();

        let plain = Session::new(me.clone());
        assert!(matches!(
            AdminGate::change_pin(&store, &plain, "5678").await,
            Err(IntakeError::Unauthorized)
        ));
        let admin = AdminGate::unlock(&store, &me, "1234").await.unwrap();
        AdminGate::change_pin(&store, &admin, "5678").await.unwrap();
        assert!(AdminGate::unlock(&store, &me, "5678").await.is_ok());
    }

    #[test]
    fn identity_rejects_blank_user() {
        assert!(Identity::new("  ").is_err());
        assert_eq!(Identity::new(" scanner ").unwrap().user(), "scanner");
    }
}
