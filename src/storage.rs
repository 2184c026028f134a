//! Secure sync credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Holds the remote API endpoint and
//! key so the sync engine can authenticate across restarts; pending local
//! writes survive logout because only credentials are cleared, never the
//! queue.

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "ordersync";

// Credential keys
pub const KEY_REMOTE_URL: &str = "remote_api_url";
pub const KEY_API_KEY: &str = "sync_api_key";
pub const KEY_BUSINESS_ID: &str = "business_id";
pub const KEY_DEVICE_ID: &str = "device_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_API_KEY, KEY_BUSINESS_ID, KEY_DEVICE_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring. The in-memory copy of the secret is
/// wiped after handoff.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let secret = Zeroizing::new(value.to_string());
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(&secret).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Sync is considered configured when the remote URL and API key are both
/// present in the credential store.
pub fn is_configured() -> bool {
    has_credential(KEY_REMOTE_URL) && has_credential(KEY_API_KEY)
}

/// Store sync credentials received during setup. `api_key` may be a plain
/// key or a connection string carrying the URL and device id.
pub fn update_credentials(remote_url: Option<&str>, api_key: &str) -> Result<(), String> {
    let mut resolved_key = api_key.trim().to_string();
    let mut resolved_url = remote_url
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    if let Some(decoded_key) = crate::api::extract_api_key_from_connection_string(api_key) {
        resolved_key = decoded_key;
        if let Some(decoded_url) = crate::api::extract_remote_url_from_connection_string(api_key) {
            resolved_url = Some(decoded_url);
        }
        if let Some(decoded_did) = crate::api::extract_device_id_from_connection_string(api_key) {
            set_credential(KEY_DEVICE_ID, &decoded_did)?;
        }
    }

    if resolved_key.is_empty() {
        return Err("Missing required field: apiKey".to_string());
    }
    let resolved_url = resolved_url.ok_or("Missing required field: remoteUrl")?;

    set_credential(KEY_REMOTE_URL, &crate::api::normalize_remote_url(&resolved_url))?;
    set_credential(KEY_API_KEY, &resolved_key)?;

    info!("Sync credentials updated");
    Ok(())
}

/// Remove every stored credential. Called on explicit logout; the sync queue
/// and entity store are untouched so pending local writes survive
/// re-authentication.
pub fn clear_credentials() -> Result<(), String> {
    let mut last_error = None;
    for key in ALL_KEYS {
        if let Err(e) = delete_credential(key) {
            warn!(key, error = %e, "keyring: failed to delete credential");
            last_error = Some(e);
        }
    }
    match last_error {
        Some(e) => Err(e),
        None => {
            info!("Sync credentials cleared");
            Ok(())
        }
    }
}
