use std::sync::Arc;

use clap::Parser;

use crate::auth::{Authenticator, PasswordTable, Trust};
use crate::codec::DEFAULT_MAX_MESSAGE_SIZE;

pub const PORT: u16 = 5432;
pub const HOST: &str = "127.0.0.1";
/// Reported to clients in the `server_version` parameter.
pub const SERVER_VERSION: &str = "16.0";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "pgwired", version, about = "A PostgreSQL wire protocol server")]
pub struct Config {
    /// The address to listen on
    #[arg(long, env = "PGWIRED_HOST", default_value = HOST)]
    pub host: String,

    /// The port to listen on
    #[arg(short, long, env = "PGWIRED_PORT", default_value_t = PORT)]
    pub port: u16,

    /// Largest frame accepted from a client, in bytes
    #[arg(long, env = "PGWIRED_MAX_MESSAGE_SIZE", default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Version reported to clients
    #[arg(long, env = "PGWIRED_SERVER_VERSION", default_value = SERVER_VERSION)]
    pub server_version: String,

    /// Require a password for USER, given as USER=PASSWORD. May be repeated; without any,
    /// every user is trusted
    #[arg(
        long = "password",
        env = "PGWIRED_PASSWORDS",
        value_delimiter = ',',
        value_parser = parse_user_password
    )]
    pub passwords: Vec<(String, String)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: HOST.to_string(),
            port: PORT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            server_version: SERVER_VERSION.to_string(),
            passwords: Vec::new(),
        }
    }
}

impl Config {
    /// Password authentication when any password is configured, trust otherwise.
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        if self.passwords.is_empty() {
            Arc::new(Trust)
        } else {
            Arc::new(self.passwords.iter().cloned().collect::<PasswordTable>())
        }
    }
}

fn parse_user_password(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((user, password)) if !user.is_empty() => Ok((user.to_string(), password.to_string())),
        _ => Err(format!("expected USER=PASSWORD, got \"{arg}\"")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;

    #[test]
    fn defaults() {
        let config = Config::try_parse_from(["pgwired"]).unwrap();

        assert_eq!(config.port, PORT);
        assert_eq!(config.max_message_size, 16 * 1024 * 1024);
        assert!(config.passwords.is_empty());
    }

    #[test]
    fn passwords_are_collected() {
        let config = Config::try_parse_from([
            "pgwired",
            "--port",
            "6543",
            "--password",
            "alice=secret",
            "--password",
            "bob=",
        ])
        .unwrap();

        assert_eq!(config.port, 6543);
        assert_eq!(
            config.passwords,
            vec![
                ("alice".to_string(), "secret".to_string()),
                ("bob".to_string(), String::new())
            ]
        );

        let authenticator = config.authenticator();
        assert!(authenticator.requires_password("alice"));
        assert!(authenticator
            .verify(&Credentials {
                user: "alice".into(),
                database: "alice".into(),
                password: Some("secret".into()),
            })
            .is_ok());
    }

    #[test]
    fn malformed_password_is_rejected() {
        assert!(Config::try_parse_from(["pgwired", "--password", "nobody"]).is_err());
        assert!(Config::try_parse_from(["pgwired", "--password", "=x"]).is_err());
    }
}
