//! Contains the types for write concerns.

use std::time::Duration;

use crate::{
    bson::{doc, Document},
    error::{Error, Result},
};

/// How much acknowledgement a write operation demands from the deployment
/// before its paired `getLastError` resolves.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Durability {
    /// Fire and forget; no `getLastError` is paired with the write.
    None,
    /// The receiving server applied the write to memory.
    Ack,
    /// The receiving server flushed the write to disk.
    Fsync,
    /// The receiving server committed the write to its journal.
    Journal,
    /// At least `n` replica-set members applied the write.
    Replicas(i32),
    /// A majority of replica-set members applied the write.
    Majority,
}

/// A durability level plus the time the server may spend waiting for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteConcern {
    pub durability: Durability,
    pub w_timeout: Option<Duration>,
}

impl Default for WriteConcern {
    fn default() -> Self {
        Self {
            durability: Durability::Ack,
            w_timeout: None,
        }
    }
}

impl WriteConcern {
    pub fn new(durability: Durability) -> Self {
        Self {
            durability,
            w_timeout: None,
        }
    }

    pub fn with_timeout(mut self, w_timeout: Duration) -> Self {
        self.w_timeout = Some(w_timeout);
        self
    }

    /// Whether a write under this concern is paired with a `getLastError`.
    pub fn is_acknowledged(&self) -> bool {
        self.durability != Durability::None
    }

    pub fn validate(&self) -> Result<()> {
        if let Durability::Replicas(n) = self.durability {
            if n < 0 {
                return Err(Error::invalid_argument(format!(
                    "write concern cannot require {} replicas",
                    n
                )));
            }
        }
        if self.w_timeout.is_some() && !self.is_acknowledged() {
            return Err(Error::invalid_argument(
                "wtimeoutMS requires an acknowledged write concern".to_string(),
            ));
        }
        Ok(())
    }

    /// The `getLastError` command paired with a write, or `None` for
    /// unacknowledged writes.
    pub fn gle_command(&self) -> Option<Document> {
        let mut command = doc! { "getlasterror": 1 };
        match self.durability {
            Durability::None => return None,
            Durability::Ack => {}
            Durability::Fsync => {
                command.insert("fsync", true);
            }
            Durability::Journal => {
                command.insert("j", true);
            }
            Durability::Replicas(n) => {
                command.insert("w", n);
            }
            Durability::Majority => {
                command.insert("w", "majority");
            }
        }
        if let Some(timeout) = self.w_timeout {
            command.insert("wtimeout", timeout.as_millis() as i64);
        }
        Some(command)
    }
}
