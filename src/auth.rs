//! Credential verification.

use std::collections::HashMap;

/// What the client presented during startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub database: String,
    /// Set only when a password was requested.
    pub password: Option<String>,
}

pub trait Authenticator: Send + Sync {
    /// Whether the connection must send a password before it is verified.
    fn requires_password(&self, user: &str) -> bool;

    /// Accepts the credentials or returns the reason they were refused.
    fn verify(&self, credentials: &Credentials) -> Result<(), String>;
}

/// Lets everyone in.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trust;

impl Authenticator for Trust {
    fn requires_password(&self, _user: &str) -> bool {
        false
    }

    fn verify(&self, _credentials: &Credentials) -> Result<(), String> {
        Ok(())
    }
}

/// Cleartext passwords per user. Unknown users are refused.
#[derive(Debug, Clone, Default)]
pub struct PasswordTable {
    users: HashMap<String, String>,
}

impl PasswordTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(user.into(), password.into());
        self
    }
}

impl FromIterator<(String, String)> for PasswordTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            users: iter.into_iter().collect(),
        }
    }
}

impl Authenticator for PasswordTable {
    fn requires_password(&self, _user: &str) -> bool {
        true
    }

    fn verify(&self, credentials: &Credentials) -> Result<(), String> {
        match (self.users.get(&credentials.user), &credentials.password) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            _ => Err(format!(
                "password authentication failed for user \"{}\"",
                credentials.user
            )),
        }
    }
}
