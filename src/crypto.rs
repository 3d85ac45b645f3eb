// =============================================================================
// Credential decryption — Fernet tokens keyed from the environment
// =============================================================================

use anyhow::{Context, Result};
use fernet::Fernet;

/// Decrypt an optional Fernet token with the key from `BOT_ENC_KEY` (or the
/// `FERNET_KEY` alias). Empty input passes through as `None`.
pub fn decrypt(token: Option<&str>) -> Result<Option<String>> {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return Ok(None);
    };

    let key = std::env::var("BOT_ENC_KEY")
        .or_else(|_| std::env::var("FERNET_KEY"))
        .context("BOT_ENC_KEY is not set")?;
    let fernet = Fernet::new(&key).context("BOT_ENC_KEY is not a valid Fernet key")?;
    let plaintext = fernet
        .decrypt(token)
        .ok()
        .context("credential token failed to decrypt")?;
    let value = String::from_utf8(plaintext).context("decrypted credential is not UTF-8")?;
    Ok(Some(value))
}
