//! The table of requests awaiting replies on one session.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::{
    callback::BoxedCallback,
    error::{Error, ErrorKind},
};

struct PendingEntry {
    callback: BoxedCallback,
    deadline: Option<Instant>,
}

/// A concurrent map from request id to completion sink. The session owns
/// entries exclusively until they are completed; every registered entry is
/// completed exactly once, with a reply or an error.
#[derive(Default)]
pub(crate) struct PendingTable {
    entries: Mutex<HashMap<i32, PendingEntry>>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `request_id`.
    pub(crate) fn register(
        &self,
        request_id: i32,
        callback: BoxedCallback,
        timeout: Option<Duration>,
    ) {
        let entry = PendingEntry {
            callback,
            deadline: timeout.map(|t| Instant::now() + t),
        };
        let previous = self
            .entries
            .lock()
            .unwrap()
            .insert(request_id, entry);
        // Request ids are process-unique, so a collision means a correlation
        // bug upstream.
        debug_assert!(previous.is_none(), "request id {} registered twice", request_id);
    }

    /// Removes and returns the entry for `request_id`, if present. Replies
    /// to unknown ids (e.g. cancelled requests) yield `None` and are
    /// discarded by the caller.
    pub(crate) fn complete(&self, request_id: i32) -> Option<BoxedCallback> {
        self.entries
            .lock()
            .unwrap()
            .remove(&request_id)
            .map(|entry| entry.callback)
    }

    /// Fails the entry for `request_id` with `CANCELLED`. The reply, if one
    /// ever arrives, will be discarded.
    pub(crate) fn cancel(&self, request_id: i32) {
        if let Some(callback) = self.complete(request_id) {
            callback.fail(ErrorKind::Cancelled.into());
        }
    }

    /// Fails every entry with the error produced by `error`.
    pub(crate) fn fail_all(&self, error: impl Fn() -> Error) {
        let entries: Vec<_> = {
            let mut guard = self.entries.lock().unwrap();
            guard.drain().collect()
        };
        for (_, entry) in entries {
            entry.callback.fail(error());
        }
    }

    /// Fails entries whose deadline has passed with `OPERATION_TIMED_OUT`.
    pub(crate) fn expire_overdue(&self, now: Instant) {
        let overdue: Vec<_> = {
            let mut guard = self.entries.lock().unwrap();
            let ids: Vec<i32> = guard
                .iter()
                .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| guard.remove(&id))
                .collect()
        };
        for entry in overdue {
            entry.callback.fail(ErrorKind::OperationTimedOut.into());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
