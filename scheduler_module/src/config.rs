//! Environment-driven engine configuration.
//!
//! `.env` files are honored via dotenvy. Provider credentials found in
//! the environment seed the service manager on first start; once
//! stored, the database copy wins.

use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use sms_services_module::Credentials;

use crate::scheduler::SchedulerError;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub poll_interval: Duration,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, SchedulerError> {
        dotenvy::dotenv().ok();

        let database_path = match env_var_non_empty("MESSAGE_DB_PATH") {
            Some(raw) => resolve_path(raw)?,
            None => default_database_path()?,
        };
        let poll_interval = Duration::from_secs(env_u64(
            "SCHEDULER_POLL_INTERVAL_SECS",
            DEFAULT_POLL_INTERVAL_SECS,
        ));

        Ok(Self {
            database_path,
            poll_interval,
        })
    }
}

/// Credentials for `service` taken from the environment, if every
/// required variable is present. Used to seed a fresh database.
pub fn env_credentials(service: &str) -> Option<Credentials> {
    match service {
        "twilio" => {
            let account_sid = env_var_non_empty("TWILIO_ACCOUNT_SID")?;
            let auth_token = env_var_non_empty("TWILIO_AUTH_TOKEN")?;
            let from_number = env_var_non_empty("TWILIO_PHONE_NUMBER")?;
            let mut credentials = Credentials::new();
            credentials.insert("account_sid".to_string(), account_sid);
            credentials.insert("auth_token".to_string(), auth_token);
            credentials.insert("from_number".to_string(), from_number);
            Some(credentials)
        }
        "textbelt" => {
            let api_key = env_var_non_empty("TEXTBELT_API_KEY")?;
            let mut credentials = Credentials::new();
            credentials.insert("api_key".to_string(), api_key);
            Some(credentials)
        }
        _ => None,
    }
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env_var_non_empty(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("invalid value for {}, using default {}", key, default);
                default
            }
        },
        None => default,
    }
}

fn default_database_path() -> Result<PathBuf, io::Error> {
    let home =
        env::var("HOME").map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home)
        .join(".message_master")
        .join("messages.db"))
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}

/// Env-mutating tests anywhere in the crate serialize through this
/// one mutex and restore variables on drop.
#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::Mutex;

    pub(crate) static ENV_MUTEX: Mutex<()> = Mutex::new(());

    pub(crate) struct EnvGuard {
        key: String,
        previous: Option<String>,
    }

    impl EnvGuard {
        pub(crate) fn set(key: &str, value: &str) -> Self {
            let previous = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                previous,
            }
        }

        pub(crate) fn unset(key: &str) -> Self {
            let previous = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                previous,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(&self.key, value),
                None => env::remove_var(&self.key),
            }
        }
    }
}
