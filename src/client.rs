//! The thin owner tying the engine together: bootstrap, request entry
//! points, and teardown.

use std::sync::Arc;

use tracing::debug;

use crate::{
    bson::Document,
    callback::{reply_future, ReplyFuture, ValidatingCallback},
    cluster::{Cluster, Pinger},
    cursor::Cursor,
    dispatch::{build_dispatcher, detect_topology, Dispatcher, Request, TopologyType},
    error::Result,
    options::ClientOptions,
    selection_criteria::ReadPreference,
    wire::{Message, Query, QueryFlags, Reply},
};

const TOPOLOGY_TRACING_EVENT_TARGET: &str = "mongowire::topology";

/// An asynchronous client for one deployment. Cheap to clone; clones share
/// the cluster model, the pinger, and the dispatcher's session caches.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cluster: Arc<Cluster>,
    pinger: Arc<Pinger>,
    dispatcher: Arc<dyn Dispatcher>,
    options: ClientOptions,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("topology", &self.inner.dispatcher.topology())
            .field("servers", &self.inner.cluster.len())
            .finish()
    }
}

impl Client {
    /// Connects to the deployment described by a `mongodb://` connection
    /// string.
    pub async fn with_uri_str(uri: &str) -> Result<Self> {
        Self::connect(ClientOptions::parse(uri)?).await
    }

    /// Bootstraps a client: seeds the cluster model from the configured
    /// hosts, sweeps it once so the first selection sees fresh roles, and
    /// picks the dispatcher variant the topology calls for.
    pub async fn connect(options: ClientOptions) -> Result<Self> {
        if let Some(ref concern) = options.write_concern {
            concern.validate()?;
        }

        let cluster = Arc::new(Cluster::new());
        for host in &options.hosts {
            cluster.add(host.clone());
        }

        let pinger = Pinger::new(Arc::clone(&cluster), options.clone());
        pinger.initial_sweep().await;

        let topology = detect_topology(&cluster, &options)?;
        debug!(
            target: TOPOLOGY_TRACING_EVENT_TARGET,
            topology = ?topology,
            servers = cluster.len(),
            "bootstrap complete"
        );

        let dispatcher = build_dispatcher(topology, Arc::clone(&cluster), options.clone())?;
        pinger.start();

        Ok(Self {
            inner: Arc::new(ClientInner {
                cluster,
                pinger,
                dispatcher,
                options,
            }),
        })
    }

    /// The deployment shape detected at bootstrap.
    pub fn topology(&self) -> TopologyType {
        self.inner.dispatcher.topology()
    }

    /// The live cluster model.
    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Dispatches a request and returns the future of its reply. Routing
    /// failures resolve the future; server-reported failures embedded in
    /// the reply are converted to typed errors.
    pub async fn execute(&self, request: Request) -> ReplyFuture {
        let (callback, future) = reply_future(self.inner.options.lock_type);
        let callback = ValidatingCallback::new(callback).boxed();
        let _ = self.inner.dispatcher.send(request, callback).await;
        future
    }

    /// Runs a command against `db`, returning its reply document.
    pub async fn run_command(
        &self,
        db: impl Into<String>,
        command: Document,
        read_preference: Option<ReadPreference>,
    ) -> Result<Document> {
        let mut request = Request::new(Message::Query(Query::command(db, command)));
        if let Some(read_preference) = read_preference {
            request = request.with_read_preference(read_preference);
        }
        let reply = self.execute(request).await.await_reply().await?;
        reply.command_document().cloned()
    }

    /// Issues a query and returns a cursor over its results, pinned to the
    /// session that answered.
    pub async fn query(&self, mut query: Query) -> Result<Cursor> {
        let read_preference = self
            .inner
            .options
            .read_preference
            .clone()
            .unwrap_or_default();
        if !read_preference.requires_primary() {
            query.flags |= QueryFlags::SLAVE_OK;
        }

        let namespace = query.namespace.clone();
        let batch_size = query.limit.max(0);

        let (callback, future) = reply_future(self.inner.options.lock_type);
        let callback = ValidatingCallback::new(callback).boxed();
        let request = Request::new(Message::Query(query))
            .with_read_preference(read_preference);
        let dispatched = self.inner.dispatcher.send(request, callback).await?;
        let reply: Reply = future.await_reply().await?;

        Ok(Cursor::new(
            dispatched.session,
            namespace,
            batch_size,
            None,
            reply,
        ))
    }

    /// Rebuilds a cursor from a persisted state document, opening a session
    /// to the server that owns the cursor.
    pub async fn resume_cursor(&self, state: &Document) -> Result<Cursor> {
        let address = state
            .get_str("address")
            .ok_or_else(|| {
                crate::error::Error::invalid_argument(
                    "cursor state lacks address".to_string(),
                )
            })
            .and_then(crate::options::ServerAddress::parse)?;

        let request_preference = ReadPreference::Server { address };
        let (callback, future) = reply_future(self.inner.options.lock_type);
        // An empty probe command verifies the pinned server is reachable
        // and yields the session the resumed cursor will live on.
        let request = Request::new(Message::Query(Query::command(
            "admin",
            crate::bson::doc! { "ping": 1 },
        )))
        .with_read_preference(request_preference);
        let dispatched = self
            .inner
            .dispatcher
            .send(request, ValidatingCallback::new(callback).boxed())
            .await?;
        future.await_reply().await?;

        Cursor::resume(state, dispatched.session)
    }

    /// Closes the dispatcher (and every session it owns) and stops the
    /// pinger.
    pub async fn shutdown(&self) {
        self.inner.dispatcher.close().await;
        self.inner.pinger.shutdown().await;
    }
}
