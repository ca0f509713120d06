//! A lazy sequence over the documents of a query result.
//!
//! When the local batch runs out and the server still holds the cursor, a
//! GET_MORE goes out on the same session that produced the cursor. Dropping
//! an iterator that still holds a live cursor id sends KILL_CURSORS on a
//! best-effort drop guard.

use std::{
    collections::VecDeque,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::{future::BoxFuture, Stream};
use futures_util::FutureExt;

use crate::{
    bson::{doc, Document},
    callback::{reply_future, LockType, ValidatingCallback},
    conn::{SendError, SocketSession},
    error::{Error, ErrorKind, Result},
    wire::{GetMore, KillCursors, Message, Namespace, Reply},
};

/// A handle to a server-side cursor, iterated asynchronously.
pub struct Cursor {
    session: SocketSession,
    namespace: Namespace,
    batch_size: i32,
    /// Documents still owed to the caller; `None` means unlimited.
    remaining_limit: Option<i64>,
    cursor_id: i64,
    exhausted: bool,
    buffer: VecDeque<Document>,
    in_flight: Option<BoxFuture<'static, Result<Reply>>>,
}

impl Cursor {
    /// Builds a cursor from the reply to the initiating QUERY.
    pub(crate) fn new(
        session: SocketSession,
        namespace: Namespace,
        batch_size: i32,
        limit: Option<i64>,
        reply: Reply,
    ) -> Self {
        Self {
            session,
            namespace,
            batch_size,
            remaining_limit: limit,
            cursor_id: reply.cursor_id,
            exhausted: reply.cursor_id == 0,
            buffer: reply.documents.into(),
            in_flight: None,
        }
    }

    /// The server-assigned cursor id; zero once exhausted.
    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    /// The canonical name of the server the cursor lives on.
    pub fn server_name(&self) -> String {
        self.session.server_name()
    }

    /// The next document, or `None` once the cursor is exhausted.
    pub async fn next(&mut self) -> Option<Result<Document>> {
        futures_util::StreamExt::next(self).await
    }

    /// Drains the remainder of the cursor into memory.
    pub async fn collect_remaining(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(next) = self.next().await {
            documents.push(next?);
        }
        Ok(documents)
    }

    /// Closes the cursor, releasing the server-side resources eagerly when
    /// the server still holds them.
    pub async fn close(&mut self) {
        let cursor_id = std::mem::take(&mut self.cursor_id);
        self.exhausted = true;
        self.buffer.clear();
        self.in_flight = None;
        if cursor_id != 0 {
            send_kill(&self.session, cursor_id).await;
        }
    }

    /// The portable state of this cursor. A caller may persist it and
    /// resume later with [`Cursor::resume`]; identity is preserved exactly
    /// when the server still has the cursor alive.
    pub fn state_document(&self) -> Document {
        doc! {
            "cursorId": (self.cursor_id),
            "address": (self.session.server_name()),
            "namespace": (self.namespace.full_name()),
            "batchSize": (self.batch_size),
            "limit": (self.remaining_limit.unwrap_or(0) as i32),
        }
    }

    /// Rebuilds a cursor from a persisted state document and a session to
    /// the server named in it.
    pub(crate) fn resume(state: &Document, session: SocketSession) -> Result<Self> {
        let cursor_id = state
            .get_i64("cursorId")
            .ok_or_else(|| Error::invalid_argument("cursor state lacks cursorId".to_string()))?;
        let address = state
            .get_str("address")
            .ok_or_else(|| Error::invalid_argument("cursor state lacks address".to_string()))?;
        let namespace = state
            .get_str("namespace")
            .ok_or_else(|| Error::invalid_argument("cursor state lacks namespace".to_string()))
            .and_then(Namespace::parse)?;

        if session.server_name() != address {
            return Err(Error::invalid_argument(format!(
                "cursor belongs to {}, not {}",
                address,
                session.server_name()
            )));
        }

        let limit = state.get_numeric("limit").unwrap_or(0);
        Ok(Self {
            session,
            namespace,
            batch_size: state.get_i32("batchSize").unwrap_or(0),
            remaining_limit: (limit != 0).then_some(limit),
            cursor_id,
            exhausted: cursor_id == 0,
            buffer: VecDeque::new(),
            in_flight: None,
        })
    }

    fn start_get_more(&mut self) {
        let session = self.session.clone();
        let message = Message::GetMore(GetMore {
            namespace: self.namespace.clone(),
            number_to_return: self.batch_size,
            cursor_id: self.cursor_id,
        });
        let cursor_id = self.cursor_id;

        self.in_flight = Some(
            async move {
                if !session.is_open() {
                    // The session that produced the cursor is gone, and with
                    // it any way to reach the cursor.
                    return Err(ErrorKind::CursorNotFound { cursor_id }.into());
                }
                let (callback, future) = reply_future(LockType::Mutex);
                let callback = ValidatingCallback::for_cursor(callback, cursor_id).boxed();
                session
                    .send(&message, callback, None)
                    .await
                    .map_err(SendError::fail)?;
                future.await_reply().await
            }
            .boxed(),
        );
    }

    fn apply_reply(&mut self, reply: Reply) {
        self.cursor_id = reply.cursor_id;
        self.exhausted = reply.cursor_id == 0;
        self.buffer.extend(reply.documents);
    }

    /// Accounts for one yielded document against the limit; closing the
    /// server-side cursor once the limit is reached.
    fn after_yield(&mut self) {
        if let Some(ref mut remaining) = self.remaining_limit {
            *remaining -= 1;
            if *remaining <= 0 {
                let cursor_id = std::mem::take(&mut self.cursor_id);
                self.exhausted = true;
                self.buffer.clear();
                if cursor_id != 0 {
                    spawn_kill(&self.session, cursor_id);
                }
            }
        }
    }
}

impl Stream for Cursor {
    type Item = Result<Document>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(document) = self.buffer.pop_front() {
                self.after_yield();
                return Poll::Ready(Some(Ok(document)));
            }

            if let Some(in_flight) = self.in_flight.as_mut() {
                let poll = in_flight.poll_unpin(cx);
                match poll {
                    Poll::Ready(Ok(reply)) => {
                        self.in_flight = None;
                        self.apply_reply(reply);
                        continue;
                    }
                    Poll::Ready(Err(error)) => {
                        self.in_flight = None;
                        self.exhausted = true;
                        self.cursor_id = 0;
                        return Poll::Ready(Some(Err(error)));
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }

            if self.exhausted {
                return Poll::Ready(None);
            }

            self.start_get_more();
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("namespace", &self.namespace)
            .field("cursor_id", &self.cursor_id)
            .field("buffered", &self.buffer.len())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if self.cursor_id != 0 {
            spawn_kill(&self.session, self.cursor_id);
        }
    }
}

/// Fire-and-forget KILL_CURSORS on the cursor's own session.
async fn send_kill(session: &SocketSession, cursor_id: i64) {
    let message = Message::KillCursors(KillCursors {
        cursor_ids: vec![cursor_id],
    });
    let (callback, _future) = reply_future(LockType::Mutex);
    if let Err(send_error) = session.send(&message, callback, None).await {
        send_error.fail();
    }
}

/// Schedules the kill without blocking; used from `Drop`, where there is no
/// async context to await in.
fn spawn_kill(session: &SocketSession, cursor_id: i64) {
    let session = session.clone();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            send_kill(&session, cursor_id).await;
        });
    }
}
