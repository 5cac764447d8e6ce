use crate::message::Message;
use std::{fmt, fs::OpenOptions, path::Path, sync::Arc};
use thiserror::Error as ThisError;
use tracing::{event, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global event subscriber. Only call once, at startup.
///
/// With `log_dir`, events are appended as JSON to a dated file in that
/// directory. Otherwise they go to standard error, as JSON when `json` is
/// set. `RUST_LOG` selects the events, defaulting to `info`.
pub fn init_events(json: bool, log_dir: Option<&Path>) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder().with_env_filter(filter);
    let result = match log_dir {
        Some(dir) => {
            let file_path = dir.join(format!(
                "coap-{}.log",
                chrono::offset::Local::now().format("%y-%m-%d")
            ));
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&file_path)
                .map_err(|e| LoggingError::File(file_path.display().to_string(), e.to_string()))?;
            tracing::subscriber::set_global_default(
                builder.with_writer(Arc::new(file)).json().finish(),
            )
        }
        None if json => tracing::subscriber::set_global_default(
            builder.with_writer(std::io::stderr).json().finish(),
        ),
        None => {
            tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish())
        }
    };
    result.map_err(|e| LoggingError::Subscriber(e.to_string()))
}

/// Which way a message crossed the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str("sent"),
            Direction::Received => f.write_str("received"),
        }
    }
}

/// Records a message crossing the transport of the stack called `stack`.
/// Captures the following data: stack, direction, peer, type, code,
/// message id, token, payload length.
pub fn message_event(stack: &str, direction: Direction, message: &Message) {
    event!(
        target: "MESSAGE",
        Level::DEBUG,
        stack,
        %direction,
        peer = %message.peer,
        kind = %message.kind,
        code = %message.code,
        mid = message.mid,
        token = %message.token,
        len = message.payload.len(),
    );
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum LoggingError {
    #[error("Could not open log file {0}: {1}")]
    File(String, String),
    #[error("Could not install the event subscriber: {0}")]
    Subscriber(String),
}
