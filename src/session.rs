//! Job output session.
//!
//! Connects to a job's output socket and renders everything it sends until
//! the gateway closes it. Once connected, five activities share one
//! `tokio::select!` scope and the first one to finish decides the outcome:
//!
//! - **reader**: pulls frames off the socket, hands pongs to the heartbeat
//!   and queues data frames (then the close outcome) for the dispatcher
//! - **heartbeat**: pings on an interval and fails the session when the
//!   matching pong does not come back in time
//! - **dispatcher**: decodes queued frames in arrival order and feeds the
//!   matcher or the downloader; enforces the per-message timeout
//! - **input relay**: forwards local keys in interactive mode
//! - **interrupt**: caller-supplied cancellation (Ctrl+C)
//!
//! The whole connected phase is bounded by the overall timeout.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::descriptor::{self, ConnectionDescriptor, WsStream};
use crate::download::Downloader;
use crate::error::{ConnectError, SessionError};
use crate::input::InputEvent;
use crate::matcher::OutputMatcher;
use crate::wire::{self, Envelope};

type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Frames buffered between the reader and the dispatcher.
const FRAME_QUEUE: usize = 64;

/// Close reason the gateway sends when a job's output is complete.
const EOF_REASON: &str = "EOF";

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Longest gap allowed between two frames. `None` waits forever.
    pub message_timeout: Option<Duration>,
    /// Budget for the whole connected phase. `None` waits forever.
    pub overall_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Total connect attempts when the API reports it is busy.
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            ping_timeout: Duration::from_secs(config.ping_timeout_secs),
            message_timeout: None,
            overall_timeout: None,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            connect_attempts: config.connect_attempts.max(1),
            connect_retry_delay: Duration::from_millis(config.connect_retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionResult {
    pub exit_code: i32,
}

/// What the reader hands to the dispatcher, in socket order.
enum Inbound {
    Frame(Vec<u8>),
    End(StreamEnd),
}

/// How the socket stopped producing frames.
enum StreamEnd {
    Close(Option<CloseFrame>),
    Error(tungstenite::Error),
    Eof,
}

pub struct JobOutputSession<W> {
    descriptor: ConnectionDescriptor,
    options: SessionOptions,
    matcher: Box<dyn OutputMatcher>,
    out: W,
    downloader: Downloader,
    input: Option<mpsc::Receiver<InputEvent>>,
    interrupt: Option<CancellationToken>,
}

impl<W: Write> JobOutputSession<W> {
    pub fn new(
        descriptor: ConnectionDescriptor,
        options: SessionOptions,
        matcher: Box<dyn OutputMatcher>,
        out: W,
    ) -> Result<Self, SessionError> {
        let downloader = Downloader::new(descriptor.tls.as_ref())?;
        Ok(Self {
            descriptor,
            options,
            matcher,
            out,
            downloader,
            input: None,
            interrupt: None,
        })
    }

    /// Relay local keys to the job (interactive mode).
    #[must_use]
    pub fn with_input(mut self, input: mpsc::Receiver<InputEvent>) -> Self {
        self.input = Some(input);
        self
    }

    /// End the session with [`SessionError::Interrupted`] once `token` fires.
    #[must_use]
    pub fn with_interrupt(mut self, token: CancellationToken) -> Self {
        self.interrupt = Some(token);
        self
    }

    /// Run to completion. The matcher is finished exactly once, whatever
    /// the outcome.
    pub async fn run(mut self) -> Result<SessionResult, SessionError> {
        let interrupt = self.interrupt.clone().unwrap_or_default();
        let outcome = tokio::select! {
            biased;
            () = interrupt.cancelled() => Err(SessionError::Interrupted),
            res = self.connect_and_stream() => res,
        };

        let finished = self.matcher.finish(&mut self.out);
        outcome?;
        finished.map_err(SessionError::Output)?;
        Ok(SessionResult {
            exit_code: self.matcher.exit_code(),
        })
    }

    async fn connect_and_stream(&mut self) -> Result<(), SessionError> {
        let ws = self.connect_with_retry().await?;
        info!(uri = %self.descriptor.uri, "Session: connected");

        let (sink, stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        let result = match self.options.overall_timeout {
            Some(limit) => tokio::time::timeout(limit, self.stream(&sink, stream))
                .await
                .unwrap_or(Err(SessionError::OverallTimeout(limit))),
            None => self.stream(&sink, stream).await,
        };

        // Best effort; a dead peer must not hold up the exit.
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            sink.lock().await.close().await
        })
        .await;
        result
    }

    async fn connect_with_retry(&self) -> Result<WsStream, ConnectError> {
        let mut attempt = 1;
        loop {
            match descriptor::connect(&self.descriptor, self.options.connect_timeout).await {
                Err(e) if e.is_transient() && attempt < self.options.connect_attempts => {
                    warn!(
                        attempt,
                        "Session: {e}, retrying in {}ms",
                        self.options.connect_retry_delay.as_millis()
                    );
                    tokio::time::sleep(self.options.connect_retry_delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn stream(
        &mut self,
        sink: &WsSink,
        stream: SplitStream<WsStream>,
    ) -> Result<(), SessionError> {
        let closed = CancellationToken::new();
        let client_closed = AtomicBool::new(false);
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (pong_tx, pong_rx) = mpsc::channel(8);

        let Self {
            options,
            matcher,
            out,
            downloader,
            input,
            ..
        } = self;

        tokio::select! {
            res = dispatch(
                frame_rx,
                options.message_timeout,
                matcher.as_mut(),
                out,
                downloader,
                &client_closed,
            ) => res,
            res = heartbeat(sink, pong_rx, &closed, options.ping_interval, options.ping_timeout) => res,
            res = relay_input(input.take(), sink, &client_closed) => res,
            res = read_frames(stream, frame_tx, pong_tx, &closed) => res,
        }
    }
}

/// Pull frames off the socket until it ends. Never completes on its own:
/// the close outcome is queued behind the frames that preceded it.
async fn read_frames(
    mut stream: SplitStream<WsStream>,
    frames: mpsc::Sender<Inbound>,
    pongs: mpsc::Sender<Vec<u8>>,
    closed: &CancellationToken,
) -> Result<(), SessionError> {
    let end = loop {
        let frame = match stream.next().await {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Pong(payload))) => {
                let _ = pongs.try_send(payload.to_vec());
                continue;
            }
            Some(Ok(Message::Ping(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => break StreamEnd::Close(frame),
            Some(Err(e)) => break StreamEnd::Error(e),
            None => break StreamEnd::Eof,
        };
        if frames.send(Inbound::Frame(frame)).await.is_err() {
            break StreamEnd::Eof;
        }
    };
    closed.cancel();
    let _ = frames.send(Inbound::End(end)).await;
    std::future::pending().await
}

/// Ping every `interval`; fail if the matching pong is not back within
/// `timeout`. Goes quiet once the socket is closing.
async fn heartbeat(
    sink: &WsSink,
    mut pongs: mpsc::Receiver<Vec<u8>>,
    closed: &CancellationToken,
    interval: Duration,
    timeout: Duration,
) -> Result<(), SessionError> {
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        counter += 1;
        let payload = counter.to_be_bytes().to_vec();
        if let Err(e) = sink
            .lock()
            .await
            .send(Message::Ping(payload.clone().into()))
            .await
        {
            debug!("Session: heartbeat stopped: {e}");
            break;
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let answered = loop {
            tokio::select! {
                () = closed.cancelled() => break false,
                () = &mut deadline => return Err(SessionError::PongTimeout(timeout)),
                pong = pongs.recv() => match pong {
                    Some(p) if p == payload => break true,
                    Some(_) => {}
                    None => break false,
                },
            }
        };
        if !answered {
            break;
        }
    }
    std::future::pending().await
}

/// Decode queued frames in order and render them. Returns when the close
/// outcome arrives.
async fn dispatch<W: Write>(
    mut frames: mpsc::Receiver<Inbound>,
    message_timeout: Option<Duration>,
    matcher: &mut dyn OutputMatcher,
    out: &mut W,
    downloader: &Downloader,
    client_closed: &AtomicBool,
) -> Result<(), SessionError> {
    loop {
        let next = match message_timeout {
            Some(limit) => tokio::time::timeout(limit, frames.recv())
                .await
                .map_err(|_| SessionError::MessageTimeout(limit))?,
            None => frames.recv().await,
        };

        match next {
            Some(Inbound::Frame(frame)) => match wire::decode(&frame)? {
                Some(Envelope::Data(entries)) => {
                    for payload in entries.iter().filter_map(|e| e.payload.as_deref()) {
                        matcher.feed(out, payload).map_err(SessionError::Output)?;
                    }
                    out.flush().map_err(SessionError::Output)?;
                }
                Some(Envelope::Urls(urls)) => downloader.fetch(&urls, out).await?,
                None => debug!("Session: ignoring frame without data or urls"),
            },
            Some(Inbound::End(end)) => {
                return classify_end(end, client_closed.load(Ordering::Acquire));
            }
            None => return classify_end(StreamEnd::Eof, client_closed.load(Ordering::Acquire)),
        }
    }
}

/// Forward local keys; on local EOF send a normal close with reason `EOF`.
async fn relay_input(
    input: Option<mpsc::Receiver<InputEvent>>,
    sink: &WsSink,
    client_closed: &AtomicBool,
) -> Result<(), SessionError> {
    if let Some(mut input) = input {
        while let Some(event) = input.recv().await {
            let msg = match event {
                InputEvent::Key(bytes) => Message::Binary(bytes.into()),
                InputEvent::Eof => {
                    client_closed.store(true, Ordering::Release);
                    Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: EOF_REASON.into(),
                    }))
                }
            };
            let is_close = matches!(msg, Message::Close(_));
            match sink.lock().await.send(msg).await {
                Ok(()) => {}
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    break
                }
                Err(e) => return Err(e.into()),
            }
            if is_close {
                debug!("Session: local input closed");
                break;
            }
        }
    }
    std::future::pending().await
}

fn classify_end(end: StreamEnd, client_closed: bool) -> Result<(), SessionError> {
    if client_closed {
        return Ok(());
    }
    match end {
        StreamEnd::Close(Some(frame)) if frame.code == CloseCode::Normal => {
            if frame.reason.as_str() == EOF_REASON {
                Ok(())
            } else {
                Err(SessionError::UnexpectedClose {
                    reason: frame.reason.to_string(),
                })
            }
        }
        StreamEnd::Close(Some(frame)) => Err(SessionError::AbnormalClose {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.to_string(),
        }),
        StreamEnd::Close(None) | StreamEnd::Eof => Err(SessionError::AbnormalClose {
            code: None,
            reason: String::new(),
        }),
        StreamEnd::Error(
            tungstenite::Error::Protocol(
                tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
            )
            | tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed,
        ) => Err(SessionError::AbnormalClose {
            code: None,
            reason: "connection reset".to_string(),
        }),
        StreamEnd::Error(tungstenite::Error::Io(e))
            if e.kind() == std::io::ErrorKind::ConnectionReset =>
        {
            Err(SessionError::AbnormalClose {
                code: None,
                reason: e.to_string(),
            })
        }
        StreamEnd::Error(e) => Err(e.into()),
    }
}
