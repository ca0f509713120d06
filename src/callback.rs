//! Completion sinks: how replies and failures reach the code that sent a
//! request.
//!
//! A sink is consumed by delivery, so exactly one of `deliver` or `fail`
//! runs exactly once; the type system enforces the invariant rather than a
//! runtime flag.

use std::time::Duration;

use tokio::sync::oneshot;

use crate::{
    bson::Document,
    error::{Error, ErrorKind, Result},
    wire::{Reply, ReplyFlags},
};

/// The wait discipline used when a caller blocks a thread on a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    /// Park the thread until the reply arrives.
    Mutex,
    /// Spin, trading CPU for wakeup latency.
    LowLatencySpin,
}

/// A completion sink for one request.
pub(crate) trait ReplyCallback: Send + 'static {
    fn deliver(self: Box<Self>, reply: Reply);
    fn fail(self: Box<Self>, error: Error);
}

pub(crate) type BoxedCallback = Box<dyn ReplyCallback>;

/// Creates a callback/future pair: the callback side is registered in a
/// pending table, the future side is returned to the caller.
pub(crate) fn reply_future(lock_type: LockType) -> (BoxedCallback, ReplyFuture) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(FutureCallback { tx }),
        ReplyFuture { rx, lock_type },
    )
}

struct FutureCallback {
    tx: oneshot::Sender<Result<Reply>>,
}

impl ReplyCallback for FutureCallback {
    fn deliver(self: Box<Self>, reply: Reply) {
        // The receiver may have been dropped by a caller that gave up.
        let _ = self.tx.send(Ok(reply));
    }

    fn fail(self: Box<Self>, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

/// The caller-facing half of a pending request.
pub struct ReplyFuture {
    rx: oneshot::Receiver<Result<Reply>>,
    lock_type: LockType,
}

impl std::fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyFuture")
            .field("lock_type", &self.lock_type)
            .finish()
    }
}

impl ReplyFuture {
    /// Awaits the reply.
    pub async fn await_reply(self) -> Result<Reply> {
        match self.rx.await {
            Ok(result) => result,
            // The sink was dropped without completing; treat as cancelled.
            Err(_) => Err(ErrorKind::Cancelled.into()),
        }
    }

    /// Blocks the current thread until the reply arrives, using the
    /// configured wait discipline. Must not be called from an async context.
    pub fn wait(mut self) -> Result<Reply> {
        match self.lock_type {
            LockType::Mutex => match self.rx.blocking_recv() {
                Ok(result) => result,
                Err(_) => Err(ErrorKind::Cancelled.into()),
            },
            LockType::LowLatencySpin => loop {
                match self.rx.try_recv() {
                    Ok(result) => return result,
                    Err(oneshot::error::TryRecvError::Closed) => {
                        return Err(ErrorKind::Cancelled.into());
                    }
                    Err(oneshot::error::TryRecvError::Empty) => std::hint::spin_loop(),
                }
            },
        }
    }

    /// Blocks with a deadline, failing with `OperationTimedOut` on expiry.
    pub fn wait_for(self, timeout: Duration) -> Result<Reply> {
        let deadline = std::time::Instant::now() + timeout;
        let mut rx = self.rx;
        loop {
            match rx.try_recv() {
                Ok(result) => return result,
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(ErrorKind::Cancelled.into());
                }
                Err(oneshot::error::TryRecvError::Empty) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(ErrorKind::OperationTimedOut.into());
                    }
                    match self.lock_type {
                        LockType::Mutex => std::thread::sleep(Duration::from_millis(1)),
                        LockType::LowLatencySpin => std::hint::spin_loop(),
                    }
                }
            }
        }
    }
}

/// Wraps another callback and converts server-reported failures carried in
/// the reply into typed errors before delegating.
pub(crate) struct ValidatingCallback {
    inner: BoxedCallback,
    /// The cursor a GET_MORE referenced, reported when the server has
    /// forgotten it.
    cursor_id: i64,
}

impl ValidatingCallback {
    pub(crate) fn new(inner: BoxedCallback) -> Self {
        Self {
            inner,
            cursor_id: 0,
        }
    }

    pub(crate) fn for_cursor(inner: BoxedCallback, cursor_id: i64) -> Self {
        Self { inner, cursor_id }
    }

    pub(crate) fn boxed(self) -> BoxedCallback {
        Box::new(self)
    }

    fn check(&self, reply: &Reply) -> Result<()> {
        if reply.flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
            return Err(ErrorKind::CursorNotFound {
                cursor_id: self.cursor_id,
            }
            .into());
        }

        if reply.flags.contains(ReplyFlags::SHARD_CONFIG_STALE) {
            return Err(ErrorKind::ShardConfigStale {
                document: reply.documents.first().cloned().unwrap_or_default(),
            }
            .into());
        }

        if reply.flags.contains(ReplyFlags::QUERY_FAILURE) {
            let document = reply.documents.first().cloned().unwrap_or_default();
            let message = document
                .get_str("$err")
                .unwrap_or("the server reported a query failure")
                .to_string();
            return Err(ErrorKind::QueryFailure { message, document }.into());
        }

        if let Some(document) = reply.documents.first() {
            Self::check_document(document)?;
        }

        Ok(())
    }

    /// Inspects an embedded error in a command or `getLastError` reply.
    fn check_document(document: &Document) -> Result<()> {
        let message = document
            .get_str("$err")
            .or_else(|| document.get_str("err"))
            .or_else(|| {
                // `errmsg` only signals failure when `ok` is falsy.
                match document.get_numeric("ok") {
                    Some(0) => document.get_str("errmsg"),
                    _ => None,
                }
            });

        let message = match message {
            Some(m) if !m.is_empty() => m.to_string(),
            _ => return Ok(()),
        };

        let code = document.get_numeric("code").unwrap_or(0) as i32;
        if is_duplicate_key_code(code) || message.contains("duplicate key") {
            return Err(ErrorKind::DuplicateKey { code, message }.into());
        }

        Err(ErrorKind::QueryFailure {
            message,
            document: document.clone(),
        }
        .into())
    }
}

fn is_duplicate_key_code(code: i32) -> bool {
    matches!(code, 11000 | 11001)
}

impl ReplyCallback for ValidatingCallback {
    fn deliver(self: Box<Self>, reply: Reply) {
        match self.check(&reply) {
            Ok(()) => self.inner.deliver(reply),
            Err(error) => self.inner.fail(error),
        }
    }

    fn fail(self: Box<Self>, error: Error) {
        self.inner.fail(error);
    }
}

/// Maps a reply into a user-facing value before completing a typed channel.
pub(crate) struct ConvertingCallback<T, F> {
    convert: F,
    tx: oneshot::Sender<Result<T>>,
}

impl<T, F> ConvertingCallback<T, F>
where
    T: Send + 'static,
    F: FnOnce(Reply) -> Result<T> + Send + 'static,
{
    pub(crate) fn channel(convert: F) -> (BoxedCallback, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        (Box::new(Self { convert, tx }), rx)
    }
}

impl<T, F> ReplyCallback for ConvertingCallback<T, F>
where
    T: Send + 'static,
    F: FnOnce(Reply) -> Result<T> + Send + 'static,
{
    fn deliver(self: Box<Self>, reply: Reply) {
        let _ = self.tx.send((self.convert)(reply));
    }

    fn fail(self: Box<Self>, error: Error) {
        let _ = self.tx.send(Err(error));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bson::doc;

    fn deliver_through_validator(reply: Reply) -> Result<Reply> {
        let (inner, future) = reply_future(LockType::Mutex);
        ValidatingCallback::new(inner).boxed().deliver(reply);
        futures_util::future::FutureExt::now_or_never(future.await_reply())
            .expect("validated reply resolves immediately")
    }

    #[test]
    fn clean_replies_pass_through() {
        let reply = Reply {
            documents: vec![doc! { "ok": 1.0 }],
            ..Default::default()
        };
        assert!(deliver_through_validator(reply).is_ok());
    }

    #[test]
    fn query_failure_flag_becomes_typed_error() {
        let reply = Reply {
            flags: ReplyFlags::QUERY_FAILURE,
            documents: vec![doc! { "$err": "exhausted memory" }],
            ..Default::default()
        };
        let err = deliver_through_validator(reply).unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::QueryFailure { .. }));
    }

    #[test]
    fn cursor_not_found_flag_carries_the_cursor_id() {
        let (inner, future) = reply_future(LockType::Mutex);
        ValidatingCallback::for_cursor(inner, 42).boxed().deliver(Reply {
            flags: ReplyFlags::CURSOR_NOT_FOUND,
            ..Default::default()
        });
        let err = futures_util::future::FutureExt::now_or_never(future.await_reply())
            .unwrap()
            .unwrap_err();
        assert!(matches!(*err.kind, ErrorKind::CursorNotFound { cursor_id: 42 }));
    }

    #[test]
    fn duplicate_key_detected_by_code() {
        let reply = Reply {
            documents: vec![doc! { "ok": 1.0, "err": "E11000 duplicate key", "code": 11000 }],
            ..Default::default()
        };
        let err = deliver_through_validator(reply).unwrap_err();
        assert!(matches!(
            *err.kind,
            ErrorKind::DuplicateKey { code: 11000, .. }
        ));
    }

    #[test]
    fn errmsg_only_fails_with_falsy_ok() {
        let healthy = Reply {
            documents: vec![doc! { "ok": 1.0, "errmsg": "" }],
            ..Default::default()
        };
        assert!(deliver_through_validator(healthy).is_ok());

        let failed = Reply {
            documents: vec![doc! { "ok": 0, "errmsg": "unknown command" }],
            ..Default::default()
        };
        assert!(deliver_through_validator(failed).is_err());
    }

    #[test]
    fn converting_callback_maps_the_reply() {
        let (callback, rx) = ConvertingCallback::channel(|reply: Reply| {
            Ok(reply.documents.len())
        });
        callback.deliver(Reply {
            documents: vec![doc! {}, doc! {}],
            ..Default::default()
        });
        let count = futures_util::future::FutureExt::now_or_never(rx)
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(count, 2);
    }
}
