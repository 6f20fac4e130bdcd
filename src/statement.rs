//! The caller's side of an executing statement.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

pub use crate::messages::backend::{CommandComplete, FieldDescriptor};
use crate::{Error, PgErrorResponse, Result};

/// One row of raw column values. `None` is SQL NULL; values are never
/// decoded.
pub type Row = Vec<Option<Bytes>>;

/// Events of a single statement, in wire order.
///
/// A statement yields at most one [`StatementEvent::Fields`] before any
/// rows, any number of rows and notices, exactly one of
/// [`StatementEvent::Complete`] or [`StatementEvent::Error`], and always
/// [`StatementEvent::End`] last.
#[derive(Debug, Clone)]
pub enum StatementEvent {
    Fields(Arc<[FieldDescriptor]>),
    Row(Row),
    Notice(PgErrorResponse),
    Complete(CommandComplete),
    Error(Error),
    End,
}

/// How a statement finished, if it has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Terminal {
    #[default]
    Pending,
    Complete,
    Error,
}

/// Handle for a submitted statement.
///
/// Events are buffered without bound until read, so a handle can be polled
/// at any pace without stalling the connection, at the cost of holding every
/// unread row in memory. Dropping the handle discards the
/// remaining events; the statement itself still runs to completion.
pub struct Statement {
    query: Arc<str>,
    events: mpsc::UnboundedReceiver<StatementEvent>,
    fields: Option<Arc<[FieldDescriptor]>>,
    rows_emitted: u64,
    terminal: Terminal,
    ended: bool,
}

impl Statement {
    pub(crate) fn new(query: Arc<str>, events: mpsc::UnboundedReceiver<StatementEvent>) -> Self {
        Self {
            query,
            events,
            fields: None,
            rows_emitted: 0,
            terminal: Terminal::Pending,
            ended: false,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Column descriptions, once the server has sent them.
    pub fn fields(&self) -> Option<&[FieldDescriptor]> {
        self.fields.as_deref()
    }

    /// Rows observed through this handle so far.
    pub fn rows_emitted(&self) -> u64 {
        self.rows_emitted
    }

    pub fn terminal(&self) -> Terminal {
        self.terminal
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Waits for the next event. Returns `None` after [`StatementEvent::End`].
    pub async fn next_event(&mut self) -> Option<StatementEvent> {
        if self.ended {
            return None;
        }
        let event = self.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Returns the next event if one is already buffered.
    pub fn try_next_event(&mut self) -> Option<StatementEvent> {
        if self.ended {
            return None;
        }
        let event = self.events.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    /// Drains the statement, collecting its rows.
    ///
    /// Notices are dropped. A server error is returned as `Err`.
    pub async fn collect_rows(mut self) -> Result<(Vec<Row>, CommandComplete)> {
        let mut rows = Vec::new();
        let mut outcome = None;

        while let Some(event) = self.next_event().await {
            match event {
                StatementEvent::Row(row) => rows.push(row),
                StatementEvent::Complete(complete) => outcome = Some(Ok(complete)),
                StatementEvent::Error(err) => outcome = Some(Err(err)),
                StatementEvent::Fields(_) | StatementEvent::Notice(_) | StatementEvent::End => {}
            }
        }

        match outcome {
            Some(Ok(complete)) => Ok((rows, complete)),
            Some(Err(err)) => Err(err),
            None => Err(Error::ConnectionClosed),
        }
    }

    fn observe(&mut self, event: &StatementEvent) {
        match event {
            StatementEvent::Fields(fields) => self.fields = Some(fields.clone()),
            StatementEvent::Row(_) => self.rows_emitted += 1,
            StatementEvent::Complete(_) => self.terminal = Terminal::Complete,
            StatementEvent::Error(_) => self.terminal = Terminal::Error,
            StatementEvent::End => self.ended = true,
            StatementEvent::Notice(_) => {}
        }
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("query", &self.query)
            .field("rows_emitted", &self.rows_emitted)
            .field("terminal", &self.terminal)
            .field("ended", &self.ended)
            .finish()
    }
}

impl Stream for Statement {
    type Item = StatementEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.observe(&event);
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}
