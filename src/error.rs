// ===============================
// src/error.rs
// ===============================

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy.
///
/// `Config` is fatal at startup. `Transport` is transient and feeds the
/// reconnect policy until `ReconnectExhausted`. `Validation` and `Venue`
/// are recoverable per quote leg. `SessionClosed` is the terminal signal
/// delivered to every pending request when a trading session goes down.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("validation rejected order: {0}")]
    Validation(String),

    #[error("request timeout for {method}")]
    RequestTimeout { method: String },

    #[error("venue error (code={code}): {msg}")]
    Venue { code: i64, msg: String },

    #[error("session closed")]
    SessionClosed,

    #[error("reconnect attempts exhausted after {attempts}")]
    ReconnectExhausted { attempts: u32 },

    #[error("http error: {0}")]
    Http(#[from] Box<reqwest::Error>),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(Box::new(e))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("bad url: {e}"))
    }
}

/// Classifies a venue error document. Credential rejections surface as
/// `Auth` so they are never retried as if they were transient.
pub fn venue_error(code: i64, msg: String) -> Error {
    match code {
        // -1022 invalid signature, -2014 bad api key format, -2015 rejected key
        -1022 | -2014 | -2015 => Error::Auth(format!("venue rejected credentials (code={code}): {msg}")),
        _ => Error::Venue { code, msg },
    }
}

impl Error {
    /// Venue errors and timeouts leave the leg failed but the engine running.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Venue { .. }
                | Error::RequestTimeout { .. }
                | Error::SessionClosed
                | Error::Transport(_)
                | Error::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_rejections_map_to_auth() {
        assert!(matches!(venue_error(-2014, "bad key".into()), Error::Auth(_)));
        assert!(matches!(venue_error(-1022, "bad signature".into()), Error::Auth(_)));
        assert!(matches!(venue_error(-2010, "no balance".into()), Error::Venue { code: -2010, .. }));
    }

    #[test]
    fn recoverability_split() {
        assert!(venue_error(-2010, "no balance".into()).is_recoverable());
        assert!(Error::SessionClosed.is_recoverable());
        assert!(!Error::Config("bad".into()).is_recoverable());
        assert!(!Error::Auth("rejected".into()).is_recoverable());
    }
}
