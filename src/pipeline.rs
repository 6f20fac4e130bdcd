//! Statement queueing and routing of backend frames to the active statement.
//!
//! Statements run strictly one at a time. Each is sent as an unnamed
//! Parse/Bind/Describe/Execute/Sync sequence, so the server closes the
//! unnamed statement and portal implicitly and every statement is
//! terminated by its own ReadyForQuery, even after an error.

use std::{collections::VecDeque, sync::Arc};

use tokio::{
    io::AsyncWrite,
    sync::mpsc::{self, UnboundedSender},
};
use tracing::{debug, trace, warn};

use crate::{
    Error, PgErrorResponse, ProtocolError,
    messages::{
        backend::{self, CommandComplete, MessageCode, PgFrame, TransactionStatus},
        frontend::{Param, TargetKind},
    },
    statement::{Statement, StatementEvent, Terminal},
    stream::{PgStream, ResultFormat},
};

/// Bind carries its parameter and format counts as u16.
const MAX_COUNT: usize = u16::MAX as usize;

/// What the connection has to do after a frame was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Continue,
    /// The server wants COPY data the pipeline never supplies.
    CopyIn,
    /// ReadyForQuery closed the active statement.
    Ended(TransactionStatus),
}

/// A statement on the connection's side: its inputs and the sending half of
/// its event channel.
pub(crate) struct PendingStatement {
    query: Arc<str>,
    params: Vec<Param>,
    result_format: ResultFormat,
    events: UnboundedSender<StatementEvent>,
    has_fields: bool,
    rows_emitted: u64,
    terminal: Terminal,
}

impl PendingStatement {
    pub(crate) fn new(
        query: impl Into<Arc<str>>,
        params: Vec<Param>,
        result_format: ResultFormat,
    ) -> (Self, Statement) {
        let query = query.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Self {
            query: query.clone(),
            params,
            result_format,
            events: tx,
            has_fields: false,
            rows_emitted: 0,
            terminal: Terminal::Pending,
        };
        (pending, Statement::new(query, rx))
    }

    /// Rejects input the wire format cannot carry: a NUL inside the query
    /// text, or more parameters or result formats than a u16 count holds.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.query.contains('\0') {
            return Err(Error::Config("query text must not contain NUL".into()));
        }
        if self.params.len() > MAX_COUNT {
            return Err(Error::Config(format!(
                "{} parameters exceed the protocol limit of {MAX_COUNT}",
                self.params.len()
            )));
        }
        match &self.result_format {
            ResultFormat::Mixed(codes) if codes.len() > MAX_COUNT => Err(Error::Config(format!(
                "{} result formats exceed the protocol limit of {MAX_COUNT}",
                codes.len()
            ))),
            _ => Ok(()),
        }
    }

    fn emit(&self, event: StatementEvent) {
        // A dropped handle only means nobody is listening.
        let _ = self.events.send(event);
    }

    fn complete(&mut self, complete: CommandComplete) {
        if self.terminal != Terminal::Pending {
            warn!(query = %self.query, "ignoring completion for a finished statement");
            return;
        }
        self.terminal = Terminal::Complete;
        self.emit(StatementEvent::Complete(complete));
    }

    fn error(&mut self, err: Error) {
        if self.terminal != Terminal::Pending {
            warn!(query = %self.query, %err, "ignoring error for a finished statement");
            return;
        }
        self.terminal = Terminal::Error;
        self.emit(StatementEvent::Error(err));
    }

    /// Force-terminates the statement: `err` unless it already finished,
    /// then End.
    pub(crate) fn abort(mut self, err: Error) {
        if self.terminal == Terminal::Pending {
            self.error(err);
        }
        self.emit(StatementEvent::End);
    }

    fn write<S>(&self, stream: &mut PgStream<S>)
    where
        S: AsyncWrite + Unpin,
    {
        stream
            .put_parse("", &*self.query, &[])
            .put_bind("", "", &self.params, &self.result_format)
            .put_describe(&TargetKind::new_portal(""))
            .put_execute("", 0)
            .put_sync();
    }
}

#[derive(Default)]
pub(crate) struct Pipeline {
    queue: VecDeque<PendingStatement>,
    active: Option<PendingStatement>,
}

impl Pipeline {
    pub fn enqueue(&mut self, stmt: PendingStatement) {
        trace!(query = %stmt.query, queued = self.queue.len(), "statement queued");
        self.queue.push_back(stmt);
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Promotes the next queued statement and writes its messages into the
    /// stream's buffer. Returns `false` if a statement is already active or
    /// the queue is empty.
    pub fn dispatch<S>(&mut self, stream: &mut PgStream<S>) -> bool
    where
        S: AsyncWrite + Unpin,
    {
        if self.active.is_some() {
            return false;
        }
        let Some(stmt) = self.queue.pop_front() else {
            return false;
        };

        debug!(query = %stmt.query, params = stmt.params.len(), "dispatching statement");
        stmt.write(stream);
        self.active = Some(stmt);
        true
    }

    /// Routes a frame belonging to the active statement.
    pub fn route(&mut self, frame: PgFrame) -> Result<Routed, ProtocolError> {
        let Some(stmt) = self.active.as_mut() else {
            return Err(ProtocolError::UnexpectedMessage(frame.code));
        };

        match frame.code {
            MessageCode::PARSE_COMPLETE
            | MessageCode::BIND_COMPLETE
            | MessageCode::CLOSE_COMPLETE
            | MessageCode::NO_DATA
            | MessageCode::PARAMETER_DESCRIPTION
            | MessageCode::COPY_DATA
            | MessageCode::COPY_DONE => {}
            MessageCode::ROW_DESCRIPTION => {
                if stmt.has_fields || stmt.rows_emitted > 0 {
                    return Err(ProtocolError::UnexpectedMessage(frame.code));
                }
                let fields = backend::parse_row_description(frame.body)?;
                stmt.has_fields = true;
                stmt.emit(StatementEvent::Fields(fields.into()));
            }
            MessageCode::DATA_ROW => {
                let row = backend::parse_data_row(frame.body)?;
                stmt.rows_emitted += 1;
                stmt.emit(StatementEvent::Row(row));
            }
            MessageCode::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(frame.body)?;
                stmt.complete(complete);
            }
            MessageCode::EMPTY_QUERY_RESPONSE => stmt.complete(CommandComplete::empty()),
            MessageCode::PORTAL_SUSPENDED => {
                // Execute always asks for all rows, so this means the server
                // stopped early; report what was seen.
                let complete = CommandComplete {
                    row_count: stmt.rows_emitted,
                    command: String::new(),
                };
                stmt.complete(complete);
            }
            MessageCode::ERROR_RESPONSE => {
                let err = PgErrorResponse::new(frame.body);
                debug!(error = %err, "statement failed");
                stmt.error(Error::Server(err));
            }
            MessageCode::NOTICE_RESPONSE => {
                stmt.emit(StatementEvent::Notice(PgErrorResponse::new(frame.body)));
            }
            MessageCode::COPY_IN_RESPONSE | MessageCode::COPY_BOTH_RESPONSE => {
                return Ok(Routed::CopyIn);
            }
            MessageCode::COPY_OUT_RESPONSE => {
                debug!(query = %stmt.query, "discarding COPY OUT data");
            }
            MessageCode::READY_FOR_QUERY => {
                let status = TransactionStatus::parse(&frame.body)?;
                if stmt.terminal == Terminal::Pending {
                    return Err(ProtocolError::UnexpectedMessage(frame.code));
                }
                if let Some(stmt) = self.active.take() {
                    trace!(query = %stmt.query, rows = stmt.rows_emitted, "statement ended");
                    stmt.emit(StatementEvent::End);
                }
                return Ok(Routed::Ended(status));
            }
            code => return Err(ProtocolError::UnexpectedMessage(code)),
        }

        Ok(Routed::Continue)
    }

    /// Terminates the active statement and everything queued behind it.
    pub fn abort_all(&mut self, err: &Error) {
        if let Some(stmt) = self.active.take() {
            stmt.abort(err.clone());
        }
        for stmt in self.queue.drain(..) {
            stmt.abort(err.clone());
        }
    }
}
