//! Error taxonomy for sessions, downloads and tunnels.
//!
//! Each variant's `Display` text is the single diagnostic line shown to the
//! user; the underlying cause (if any) is reachable through `source()` so the
//! binary can print the full chain in `--debug` mode.

use std::io;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::util::describe_seconds;
use crate::wire::DecodeError;

/// Process exit code used when a session is interrupted locally (Ctrl+C).
pub const EXIT_INTERRUPTED: i32 = 130;

/// Failure to establish a WebSocket connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The handshake was answered with 404.
    #[error("Job not found")]
    NotFound,
    /// The handshake was answered with a 5xx that is not a capacity signal.
    #[error("Internal error in gateway API. Please contact support if this persists.")]
    Server { status: u16 },
    /// The server is over capacity or asked us to try again (429 / 503).
    #[error("Gateway API is busy (HTTP {status}), try again later")]
    Busy { status: u16 },
    /// Any other non-101 handshake response.
    #[error("Could not connect to API websocket")]
    Handshake { status: u16 },
    #[error("API websocket connection refused!")]
    Refused,
    #[error("Could not connect to API websocket")]
    TimedOut,
    #[error("Invalid websocket connection parameters: {0}")]
    InvalidDescriptor(String),
    #[error("Could not connect to API websocket")]
    Transport(#[source] Box<tungstenite::Error>),
}

impl ConnectError {
    /// Rejections the server expects us to retry after a short pause.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectError::Busy { .. })
    }

    /// Classify a non-101 handshake response status.
    pub fn from_status(status: u16) -> Self {
        match status {
            404 => ConnectError::NotFound,
            429 | 503 => ConnectError::Busy { status },
            500..=599 => ConnectError::Server { status },
            _ => ConnectError::Handshake { status },
        }
    }

    /// Classify a handshake/transport error returned by tungstenite.
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => Self::from_status(response.status().as_u16()),
            tungstenite::Error::Io(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                ConnectError::Refused
            }
            tungstenite::Error::Io(ref e) if e.kind() == io::ErrorKind::TimedOut => {
                ConnectError::TimedOut
            }
            tungstenite::Error::Url(e) => ConnectError::InvalidDescriptor(e.to_string()),
            other => ConnectError::Transport(Box::new(other)),
        }
    }
}

/// Failure while fetching side-channel content.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Test run content not found")]
    NotFound { url: String },
    #[error("Error retrieving test run content")]
    Status { url: String, status: u16 },
    #[error("Error retrieving test run content")]
    Request(#[from] reqwest::Error),
    #[error("Failed to write test run content")]
    Output(#[source] io::Error),
}

/// Terminal outcome of a job output session other than clean completion.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// No frame arrived within the per-message window.
    #[error("Timed out after no messages received for {}", describe_seconds(*.0))]
    MessageTimeout(Duration),
    /// The whole session exceeded its overall budget.
    #[error("Job status timed out after {}", describe_seconds(*.0))]
    OverallTimeout(Duration),
    /// Closed with a non-normal code, without a close frame, or reset.
    #[error("API websocket closed abnormally")]
    AbnormalClose { code: Option<u16>, reason: String },
    /// Normal closure code but a reason other than `EOF`.
    #[error("API websocket closed unexpectedly")]
    UnexpectedClose { reason: String },
    #[error("API websocket stopped answering heartbeats")]
    PongTimeout(Duration),
    #[error("Received a malformed message from the API websocket")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("API websocket connection failed")]
    Transport(#[source] Box<tungstenite::Error>),
    #[error("Failed to write job output")]
    Output(#[source] io::Error),
    #[error("Interrupted")]
    Interrupted,
}

impl SessionError {
    /// Process exit code the CLI should terminate with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Interrupted => EXIT_INTERRUPTED,
            _ => 1,
        }
    }

    /// Whether this error is one of the two timeout conditions.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SessionError::MessageTimeout(_) | SessionError::OverallTimeout(_)
        )
    }
}

impl From<tungstenite::Error> for SessionError {
    fn from(err: tungstenite::Error) -> Self {
        SessionError::Transport(Box::new(err))
    }
}

/// Failure to start or run the TCP tunnel server.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("{}", permission_message(*.port, .source))]
    PermissionDenied {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("Could not start gdbserver on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("Tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Classify a listener bind failure.
    pub fn from_bind(port: u16, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            TunnelError::PermissionDenied { port, source }
        } else {
            TunnelError::Bind { port, source }
        }
    }
}

fn permission_message(port: u16, source: &io::Error) -> String {
    if port < 1024 {
        format!(
            "Permission denied for port {port}. Using a port number less than 1024 \
             typically requires root privileges."
        )
    } else {
        source.to_string()
    }
}

/// Notice printed for sentinel exit codes relayed from the gateway.
pub fn exit_code_notice(code: i32) -> Option<&'static str> {
    match code {
        crate::matcher::EXIT_CODE_UNKNOWN => Some("Failed to retrieve script exit code."),
        124 => Some("Gateway script terminated due to timeout."),
        137 => Some("Gateway script forcibly killed due to timeout."),
        _ => None,
    }
}
