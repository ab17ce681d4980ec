//! Campus Client
//!
//! Data-sync layer for the Campus marketplace: a REST client over reqwest,
//! typed domain services with retry and local-cache fallback, a
//! stale-while-revalidate query cache and websocket change subscriptions.
//!
//! [`CampusClient`] wires all of it from one [`ClientConfig`]:
//!
//! ```no_run
//! # async fn demo() -> campus_client::ClientResult<()> {
//! use campus_client::{CampusClient, ClientConfig};
//! use campus_core::NoteFilters;
//!
//! let config = ClientConfig::load()?;
//! campus_client::init_tracing(&config.logging)?;
//! let client = CampusClient::from_config(&config)?;
//!
//! let services = client.services();
//! let notes = client.list(&services.notes, &NoteFilters::default()).await?;
//! # let _ = notes;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod realtime;
pub mod services;
pub mod telemetry;

pub use config::{
    AuthConfig, ClientConfig, ConfigError, LocalCacheConfig, LoggingConfig, QuerySettings,
    RealtimeSettings, ReconnectConfig, RetrySettings, CONFIG_ENV_VAR,
};
pub use error::{ClientError, ClientResult};
pub use http::RestClient;
pub use realtime::{ChangeCallback, RealtimeManager, WsTransport};
pub use services::{
    DataServices, Events, EventsService, Notes, NotesService, Notifications, NotificationsService,
    Projects, ProjectsService, Resource, ResourceService, Vendors, VendorsService,
};
pub use telemetry::init_tracing;

use std::future::Future;
use std::sync::Arc;

use campus_core::{
    ChangeEvent, ChangeTransport, ChannelSpec, EntityId, Notification, RequestResult,
};
use campus_storage::{FileBackend, KvBackend, LocalCacheStore, MemoryBackend, QueryCache};
use tokio::task::JoinHandle;
use tracing::info;

/// Everything a session needs, built from one config.
pub struct CampusClient<T: ChangeTransport = WsTransport> {
    rest: RestClient,
    store: LocalCacheStore,
    services: DataServices,
    query: QueryCache,
    realtime: RealtimeManager<T>,
    gc_task: Option<JoinHandle<()>>,
}

impl CampusClient<WsTransport> {
    /// Build the client. Inside a tokio runtime this also starts the query
    /// cache GC task.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        Self::with_transport(config, WsTransport::new(config))
    }
}

impl<T: ChangeTransport> CampusClient<T> {
    pub fn with_transport(config: &ClientConfig, transport: T) -> ClientResult<Self> {
        config.validate()?;

        let rest = RestClient::new(config)?;
        let backend: Arc<dyn KvBackend> = match (&config.local_cache.path, config.local_cache.max_bytes) {
            (Some(path), _) => Arc::new(FileBackend::open(path)?),
            (None, Some(max_bytes)) => Arc::new(MemoryBackend::with_quota(max_bytes)),
            (None, None) => Arc::new(MemoryBackend::new()),
        };
        let store = LocalCacheStore::new(backend);
        let services = DataServices::new(
            Arc::new(rest.clone()),
            store.clone(),
            config.retry.to_policy(),
        );

        let query = QueryCache::new(config.query.to_cache_config());
        let gc_task = tokio::runtime::Handle::try_current()
            .ok()
            .map(|_| query.spawn_gc(config.query.gc_interval()));

        let realtime = RealtimeManager::new(transport, &config.realtime, config.reconnect.clone());

        info!(
            base_url = %rest.base_url(),
            persistent_cache = config.local_cache.path.is_some(),
            "Campus client ready"
        );
        Ok(Self {
            rest,
            store,
            services,
            query,
            realtime,
            gc_task,
        })
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn store(&self) -> &LocalCacheStore {
        &self.store
    }

    pub fn services(&self) -> &DataServices {
        &self.services
    }

    pub fn query(&self) -> &QueryCache {
        &self.query
    }

    pub fn realtime(&self) -> &RealtimeManager<T> {
        &self.realtime
    }

    /// Filtered list through the query cache.
    pub async fn list<R: Resource>(
        &self,
        service: &ResourceService<R>,
        filters: &R::Filters,
    ) -> RequestResult<Vec<R::Entity>> {
        let key = service.list_key(filters)?;
        let service = service.clone();
        let filters = filters.clone();
        self.query
            .query(&key, move || async move { service.list(&filters).await })
            .await
    }

    /// One entity through the query cache.
    pub async fn get_by_id<R: Resource>(
        &self,
        service: &ResourceService<R>,
        id: EntityId,
    ) -> RequestResult<R::Entity> {
        let key = service.entity_key(id);
        let service = service.clone();
        self.query
            .query(&key, move || async move { service.get_by_id(id).await })
            .await
    }

    pub async fn create<R: Resource>(
        &self,
        service: &ResourceService<R>,
        payload: &R::Create,
    ) -> RequestResult<R::Entity> {
        self.query
            .mutate(service.create(payload), |key| key.is_for(R::NAME))
            .await
    }

    pub async fn update<R: Resource>(
        &self,
        service: &ResourceService<R>,
        id: EntityId,
        payload: &R::Update,
    ) -> RequestResult<R::Entity> {
        self.query
            .mutate(service.update(id, payload), |key| key.is_for(R::NAME))
            .await
    }

    pub async fn delete<R: Resource>(
        &self,
        service: &ResourceService<R>,
        id: EntityId,
    ) -> RequestResult<()> {
        self.query
            .mutate(service.delete(id), |key| key.is_for(R::NAME))
            .await
    }

    /// Run any other write against `resource` and invalidate its query
    /// records on success.
    pub async fn mutate<V, Fut>(&self, resource: &str, write: Fut) -> RequestResult<V>
    where
        Fut: Future<Output = RequestResult<V>>,
    {
        self.query.mutate(write, |key| key.is_for(resource)).await
    }

    pub async fn mark_notification_read(&self, id: EntityId) -> RequestResult<Notification> {
        let notifications = &self.services.notifications;
        self.mutate(Notifications::NAME, notifications.mark_read(id))
            .await
    }

    pub async fn mark_all_notifications_read(&self) -> RequestResult<()> {
        let notifications = &self.services.notifications;
        self.mutate(Notifications::NAME, notifications.mark_all_read())
            .await
    }

    /// Subscribe to `spec` and invalidate the query records of
    /// `spec.table` on every matching change. Returns the channel id.
    pub fn invalidate_on_change(&self, spec: ChannelSpec) -> String {
        let query = self.query.clone();
        let table = spec.table.clone();
        self.realtime.subscribe(
            spec,
            Arc::new(move |_: ChangeEvent| {
                query.invalidate_resource(&table);
            }),
        )
    }

    /// Close all channels and drop every cached read. Returns the number of
    /// channels closed.
    pub fn logout(&self) -> usize {
        let closed = self.realtime.unsubscribe_all();
        let cleared = self.services.clear_caches();
        self.query.clear();
        info!(channels = closed, local_entries = cleared, "Session cleared");
        closed
    }
}

impl<T: ChangeTransport> Drop for CampusClient<T> {
    fn drop(&mut self) {
        if let Some(task) = self.gc_task.take() {
            task.abort();
        }
    }
}

impl<T: ChangeTransport> std::fmt::Debug for CampusClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CampusClient")
            .field("rest", &self.rest)
            .field("query", &self.query)
            .field("realtime", &self.realtime)
            .finish()
    }
}
