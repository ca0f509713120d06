//! The dispatcher for a single-server deployment.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{reconnect, send_on_session, Dispatched, Dispatcher, Request, TopologyType};
use crate::{
    callback::BoxedCallback,
    conn::{SendError, SocketSession},
    error::{ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
};

/// Forwards every request to one underlying session, reconnecting to the
/// single configured endpoint with backoff when it drops.
pub(crate) struct StandaloneDispatcher {
    address: ServerAddress,
    options: ClientOptions,
    session: tokio::sync::Mutex<Option<SocketSession>>,
    open: AtomicBool,
}

impl StandaloneDispatcher {
    pub(crate) fn new(address: ServerAddress, options: ClientOptions) -> Self {
        Self {
            address,
            options,
            session: tokio::sync::Mutex::new(None),
            open: AtomicBool::new(true),
        }
    }

    /// The cached session, or a fresh one. `reconnecting` selects between a
    /// single connect attempt and the backoff procedure.
    async fn ensure_session(&self, reconnecting: bool) -> Result<SocketSession> {
        let mut guard = self.session.lock().await;
        if let Some(ref session) = *guard {
            if session.is_open() {
                return Ok(session.clone());
            }
            *guard = None;
        }

        let session = if reconnecting {
            reconnect::standalone(&self.address, &self.options)
                .await
                .ok_or_else(|| {
                    crate::error::Error::no_suitable_server(format!(
                        "could not reconnect to {}",
                        self.address
                    ))
                })?
        } else {
            SocketSession::connect(self.address.clone(), &self.options).await?
        };

        *guard = Some(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl Dispatcher for StandaloneDispatcher {
    async fn send(&self, request: Request, callback: BoxedCallback) -> Result<Dispatched> {
        if !self.is_open() {
            callback.fail(ErrorKind::ShutdownInProgress.into());
            return Err(ErrorKind::ShutdownInProgress.into());
        }

        let mut callback = callback;
        for attempt in 0..2 {
            let session = match self.ensure_session(attempt > 0).await {
                Ok(session) => session,
                Err(error) => {
                    callback.fail(error.clone());
                    return Err(error);
                }
            };

            match send_on_session(&session, &request, callback).await {
                Ok(request_id) => {
                    return Ok(Dispatched {
                        request_id,
                        session,
                    });
                }
                Err(SendError::Rejected {
                    error,
                    callback: returned,
                }) if attempt == 0 && error.is_retryable() => {
                    callback = returned;
                }
                Err(send_error) => {
                    let error = send_error.error().clone();
                    send_error.fail();
                    return Err(error);
                }
            }
        }

        unreachable!("the second attempt either sends or returns")
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown(false).await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn topology(&self) -> TopologyType {
        TopologyType::Standalone
    }
}
