//! Integration tests driving the engine against scripted in-process
//! servers.

mod scenarios;
mod session;

use std::time::Duration;

use crate::options::{ClientOptions, ServerAddress};

/// Options tuned for tests: short deadlines, and a heartbeat long enough
/// that the periodic sweep never interleaves with scripted scenarios.
pub(crate) fn test_options(hosts: Vec<ServerAddress>) -> ClientOptions {
    ClientOptions::builder()
        .hosts(hosts)
        .connect_timeout(Some(Duration::from_secs(1)))
        .server_selection_timeout(Some(Duration::from_secs(3)))
        .heartbeat_freq(Some(Duration::from_secs(3600)))
        .build()
}

/// Polls `predicate` until it holds or the deadline passes.
pub(crate) async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
