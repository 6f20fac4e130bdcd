//! The connection driver and its client handle.
//!
//! After the handshake, a connection is split into a [`Client`], which can
//! be cloned and used from anywhere, and a [`Connection`], which owns the
//! transport and has to be driven with [`Connection::run`], usually on its
//! own task.

use std::collections::HashMap;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{
    Error, PgErrorResponse, ProtocolError, Result,
    messages::{
        backend::{self, MessageCode, Notification, PgFrame},
        frontend::Param,
    },
    pipeline::{PendingStatement, Pipeline, Routed},
    startup::StartupResponse,
    statement::Statement,
    stream::{PgStream, ResultFormat},
};

/// Lifecycle of a connection.
///
/// The handshake states are passed through inside the connect functions;
/// a [`Connection`] starts out [`ConnectionState::Idle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    TlsHandshake,
    StartupSent,
    Authenticating,
    AwaitingBackendData,
    Idle,
    Busy,
    Closing,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Connection-level events, delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection is established; emitted once when it starts running.
    Connect(StartupResponse),
    /// No statement is active or queued.
    Ready,
    /// The server reported a changed run-time parameter.
    ParameterStatus { name: String, value: String },
    Notification(Notification),
    /// A fatal error; always followed by [`ConnectionEvent::Close`].
    Error(Error),
    Close { had_error: bool },
}

enum Command {
    Execute(PendingStatement),
    Subscribe(mpsc::UnboundedSender<ConnectionEvent>),
    Close,
}

/// Handle for submitting statements to a running [`Connection`].
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    process_id: u32,
    secret_key: u32,
}

impl Client {
    /// Submits a statement with text results.
    ///
    /// The statement runs after every statement submitted before it. If the
    /// connection is gone, the returned handle yields an error and ends, as
    /// it does for a query containing NUL or more than 65535 parameters
    /// ([`Error::Config`]).
    ///
    /// Events are buffered in an unbounded queue until the handle reads
    /// them. The connection never waits for a slow reader, so a large
    /// result set that is not consumed is held in memory in full.
    pub fn execute(&self, query: impl AsRef<str>, params: Vec<Param>) -> Statement {
        self.execute_with_format(query, params, ResultFormat::Text)
    }

    /// Submits a statement, requesting result columns in `result_format`.
    pub fn execute_with_format(
        &self,
        query: impl AsRef<str>,
        params: Vec<Param>,
        result_format: ResultFormat,
    ) -> Statement {
        let (pending, handle) = PendingStatement::new(query.as_ref(), params, result_format);
        if let Err(err) = pending.validate() {
            debug!(%err, "rejecting statement before dispatch");
            pending.abort(err);
            return handle;
        }
        if let Err(mpsc::error::SendError(Command::Execute(pending))) =
            self.commands.send(Command::Execute(pending))
        {
            pending.abort(Error::ConnectionClosed);
        }
        handle
    }

    /// Asks the connection to finish gracefully. Statements that have not
    /// ended yet are terminated with [`Error::ConnectionClosed`].
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Registers a listener for connection-level events.
    ///
    /// Subscribing before [`Connection::run`] is called guarantees that
    /// [`ConnectionEvent::Connect`] is observed. A closed connection
    /// returns a receiver that is already finished.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Subscribe(tx));
        rx
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the connection reaches `Closed` or `Errored`.
    pub async fn closed(&self) -> ConnectionState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Backend process ID and secret key, as needed for cancel requests.
    pub fn backend_key(&self) -> (u32, u32) {
        (self.process_id, self.secret_key)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("process_id", &self.process_id)
            .finish()
    }
}

/// How the serve loop stopped without a fatal error.
enum Shutdown {
    Requested,
    PeerClosed,
}

/// Owns the transport of an established connection.
pub struct Connection<S> {
    stream: PgStream<S>,
    startup: StartupResponse,
    pipeline: Pipeline,
    commands: mpsc::UnboundedReceiver<Command>,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    state: watch::Sender<ConnectionState>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: PgStream<S>, startup: StartupResponse) -> (Client, Self) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        let client = Client {
            commands: commands_tx,
            state: state_rx,
            process_id: startup.process_id,
            secret_key: startup.secret_key,
        };
        let conn = Self {
            stream,
            startup,
            pipeline: Pipeline::default(),
            commands: commands_rx,
            subscribers: Vec::new(),
            state: state_tx,
        };
        (client, conn)
    }

    /// Server parameters, kept current with ParameterStatus updates.
    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.startup.parameters
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Drives the connection until it is closed.
    ///
    /// Returns `Ok` when closed by a client, by dropping every client, or by
    /// the server hanging up, and `Err` with the fatal error otherwise.
    pub async fn run(mut self) -> Result<()> {
        let open = self.drain_commands();
        self.emit(ConnectionEvent::Connect(self.startup.clone()));

        let outcome = if open {
            self.serve().await
        } else {
            Ok(Shutdown::Requested)
        };
        match outcome {
            Ok(shutdown) => {
                self.finish(shutdown).await;
                Ok(())
            }
            Err(err) => {
                self.fail(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn serve(&mut self) -> Result<Shutdown> {
        self.advance().await?;

        // Set once every client is dropped; outstanding statements still
        // run to completion.
        let mut detached = false;

        loop {
            if detached && !self.pipeline.is_busy() {
                return Ok(Shutdown::Requested);
            }

            tokio::select! {
                command = self.commands.recv(), if !detached => match command {
                    Some(Command::Execute(stmt)) => {
                        self.pipeline.enqueue(stmt);
                        if !self.pipeline.is_busy() {
                            self.advance().await?;
                        }
                    }
                    Some(Command::Subscribe(tx)) => self.subscribers.push(tx),
                    Some(Command::Close) => return Ok(Shutdown::Requested),
                    None => {
                        debug!("all clients dropped");
                        detached = true;
                    }
                },
                frame = self.stream.read_frame() => {
                    let Some(frame) = frame? else {
                        info!("server closed the connection");
                        return Ok(Shutdown::PeerClosed);
                    };
                    self.handle_frame(frame).await?;
                }
            }
        }
    }

    /// Applies commands sent before the connection started running.
    /// Returns `false` if a close was requested among them.
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Execute(stmt) => self.pipeline.enqueue(stmt),
                Command::Subscribe(tx) => self.subscribers.push(tx),
                Command::Close => return false,
            }
        }
        true
    }

    /// Starts the next queued statement, or enters Idle if there is none.
    async fn advance(&mut self) -> Result<()> {
        if self.pipeline.dispatch(&mut self.stream) {
            self.set_state(ConnectionState::Busy);
            self.stream.flush().await?;
        } else if !self.pipeline.is_busy() {
            self.set_state(ConnectionState::Idle);
            self.emit(ConnectionEvent::Ready);
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: PgFrame) -> Result<()> {
        match frame.code {
            MessageCode::PARAMETER_STATUS => {
                let (name, value) = backend::parse_parameter_status(frame.body)?;
                debug!(%name, %value, "parameter status");
                self.startup.parameters.insert(name.clone(), value.clone());
                self.emit(ConnectionEvent::ParameterStatus { name, value });
            }
            MessageCode::NOTIFICATION_RESPONSE => {
                let notification = Notification::parse(frame.body)?;
                self.emit(ConnectionEvent::Notification(notification));
            }
            _ if self.pipeline.is_busy() => match self.pipeline.route(frame)? {
                Routed::Continue => {}
                Routed::CopyIn => {
                    debug!("refusing COPY FROM STDIN");
                    // The server skips the earlier Sync while in copy mode.
                    self.stream
                        .put_copy_fail("COPY FROM STDIN is not supported by this client")
                        .put_sync();
                    self.stream.flush().await?;
                }
                Routed::Ended(status) => {
                    debug!(?status, queued = self.pipeline.queued(), "ready for query");
                    self.advance().await?;
                }
            },
            MessageCode::NOTICE_RESPONSE => {
                let notice = PgErrorResponse::new(frame.body);
                warn!(%notice, "notice outside of a statement");
            }
            // Typically a FATAL sent right before the server disconnects.
            MessageCode::ERROR_RESPONSE => {
                return Err(Error::Server(PgErrorResponse::new(frame.body)));
            }
            code => return Err(ProtocolError::UnexpectedMessage(code).into()),
        }
        Ok(())
    }

    /// Graceful close: statements end with `ConnectionClosed`, Terminate is
    /// sent if we initiated it.
    async fn finish(&mut self, shutdown: Shutdown) {
        self.set_state(ConnectionState::Closing);
        self.abort_outstanding(&Error::ConnectionClosed);

        if let Shutdown::Requested = shutdown {
            self.stream.put_terminate();
            if let Err(e) = self.stream.flush().await {
                debug!("failed to send terminate: {e}");
            }
        }
        let _ = self.stream.shutdown().await;

        self.set_state(ConnectionState::Closed);
        self.emit(ConnectionEvent::Close { had_error: false });
    }

    async fn fail(&mut self, err: Error) {
        warn!(%err, "connection failed");
        self.abort_outstanding(&err);
        let _ = self.stream.shutdown().await;

        self.set_state(ConnectionState::Errored);
        self.emit(ConnectionEvent::Error(err));
        self.emit(ConnectionEvent::Close { had_error: true });
    }

    /// Ends the active statement, the queue, and anything still sitting in
    /// the command channel.
    fn abort_outstanding(&mut self, err: &Error) {
        self.commands.close();
        self.pipeline.abort_all(err);
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Execute(stmt) => stmt.abort(err.clone()),
                Command::Subscribe(tx) => self.subscribers.push(tx),
                Command::Close => {}
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(from = ?prev, to = ?state, "connection state");
        }
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
