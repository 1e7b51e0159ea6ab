//! Service principal credentials from the process environment.
//!
//! All four values are required.  A missing or empty variable is a
//! configuration error: it is reported immediately and never retried.

use std::fmt;

use crate::config::CredentialEnvNames;
use crate::errors::PushError;

/// Service principal identity used to obtain a bearer token.
#[derive(Clone)]
pub struct Credentials {
    pub subscription_id: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("subscription_id", &self.subscription_id)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// Load credentials from the real process environment.
pub fn load_credentials(names: &CredentialEnvNames) -> Result<Credentials, PushError> {
    load_credentials_with(names, |name| std::env::var(name).ok())
}

/// Load credentials through `lookup`, which maps a variable name to its value.
///
/// Every missing variable is listed in the error, not just the first.
pub fn load_credentials_with<F>(names: &CredentialEnvNames, lookup: F) -> Result<Credentials, PushError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let mut read = |name: &str| match lookup(name) {
        Some(value) if !value.trim().is_empty() => value,
        _ => {
            missing.push(name.to_string());
            String::new()
        }
    };

    let credentials = Credentials {
        subscription_id: read(&names.subscription_id),
        tenant_id: read(&names.tenant_id),
        client_id: read(&names.client_id),
        client_secret: read(&names.client_secret),
    };

    if !missing.is_empty() {
        return Err(PushError::Configuration(format!(
            "missing environment variable{} {}",
            if missing.len() > 1 { "s" } else { "" },
            missing.join(", ")
        )));
    }

    Ok(credentials)
}

// -- Tests -------------------------------------------------------------------
