//! Domain data services.
//!
//! One generic [`ResourceService`] implements the read/write pattern for
//! every marketplace resource:
//!
//! - reads go through [`retry_request`], cache the JSON result in the
//!   [`LocalCacheStore`] under `"{resource}:..."` with the resource TTL, and
//!   fall back to an unexpired cached copy when the server is unreachable or
//!   failing (network error or 5xx);
//! - writes go through the same retry loop and, on success, flush the whole
//!   resource namespace of the local cache.
//!
//! Resource-specific operations live in impl blocks on the concrete
//! service types (`VendorsService::nearby`, `NotificationsService::mark_read`).

mod events;
mod notes;
mod notifications;
mod projects;
mod vendors;

pub use events::{Events, EventsService};
pub use notes::{Notes, NotesService};
pub use notifications::{Notifications, NotificationsService};
pub use projects::{Projects, ProjectsService};
pub use vendors::{Vendors, VendorsService};

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use campus_core::{
    retry_request, ApiRequest, EntityId, QueryKey, RequestError, RequestExecutor, RequestResult,
    ResourceFilters, RetryPolicy,
};
use campus_storage::LocalCacheStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Static description of one REST resource.
pub trait Resource: Send + Sync + 'static {
    /// Cache namespace and query-key base, e.g. `"notes"`.
    const NAME: &'static str;
    /// Collection path, e.g. `"/api/notes"`.
    const PATH: &'static str;
    /// How long cached reads stay usable as a fallback.
    const TTL: Duration;

    type Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
    type Filters: ResourceFilters;
    type Create: Serialize + Send + Sync;
    type Update: Serialize + Send + Sync;
}

/// Read/write access to one resource.
pub struct ResourceService<R: Resource> {
    executor: Arc<dyn RequestExecutor>,
    store: LocalCacheStore,
    retry: RetryPolicy,
    _resource: PhantomData<fn() -> R>,
}

impl<R: Resource> Clone for ResourceService<R> {
    fn clone(&self) -> Self {
        Self {
            executor: Arc::clone(&self.executor),
            store: self.store.clone(),
            retry: self.retry.clone(),
            _resource: PhantomData,
        }
    }
}

impl<R: Resource> fmt::Debug for ResourceService<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceService")
            .field("resource", &R::NAME)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<R: Resource> ResourceService<R> {
    pub fn new(executor: Arc<dyn RequestExecutor>, store: LocalCacheStore, retry: RetryPolicy) -> Self {
        Self {
            executor,
            store,
            retry,
            _resource: PhantomData,
        }
    }

    pub fn resource(&self) -> &'static str {
        R::NAME
    }

    /// Query key for a filtered list. Equal filters give equal keys
    /// regardless of how they were built.
    pub fn list_key(&self, filters: &R::Filters) -> RequestResult<QueryKey> {
        QueryKey::with_params(R::NAME, filters).map_err(|e| RequestError::Serialize {
            message: e.to_string(),
        })
    }

    /// Query key for one entity.
    pub fn entity_key(&self, id: EntityId) -> QueryKey {
        QueryKey::new(format!("{}/{}", R::NAME, id))
    }

    pub async fn list(&self, filters: &R::Filters) -> RequestResult<Vec<R::Entity>> {
        let key = self.list_key(filters)?;
        let request = ApiRequest::get(R::PATH).with_query(filters.to_query_pairs());
        self.cached_read(&list_cache_key::<R>(&key), request).await
    }

    pub async fn get_by_id(&self, id: EntityId) -> RequestResult<R::Entity> {
        let request = ApiRequest::get(entity_path::<R>(id));
        self.cached_read(&format!("{}:id:{}", R::NAME, id), request)
            .await
    }

    pub async fn create(&self, payload: &R::Create) -> RequestResult<R::Entity> {
        let request = ApiRequest::post(R::PATH).with_json(payload)?;
        let body = self.write(request).await?;
        decode(body)
    }

    pub async fn update(&self, id: EntityId, payload: &R::Update) -> RequestResult<R::Entity> {
        let request = ApiRequest::put(entity_path::<R>(id)).with_json(payload)?;
        let body = self.write(request).await?;
        decode(body)
    }

    pub async fn delete(&self, id: EntityId) -> RequestResult<()> {
        self.write(ApiRequest::delete(entity_path::<R>(id))).await?;
        Ok(())
    }

    /// Drop every locally cached read of this resource.
    pub fn clear_cache(&self) -> usize {
        self.store.clear(&namespace::<R>())
    }

    /// GET with local-cache write-through and fallback.
    pub(crate) async fn cached_read<T>(&self, cache_key: &str, request: ApiRequest) -> RequestResult<T>
    where
        T: Serialize + DeserializeOwned,
    {
        match self.send(&request).await {
            Ok(body) => {
                let value: T = decode(body)?;
                self.store.set(cache_key, &value, R::TTL);
                Ok(value)
            }
            Err(err) if err.is_transient() => match self.store.get::<T>(cache_key, R::TTL) {
                Some(cached) => {
                    warn!(
                        resource = R::NAME,
                        key = %cache_key,
                        error = %err,
                        "Request failed, serving cached data"
                    );
                    Ok(cached)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Mutation: no caching, namespace flush on success.
    pub(crate) async fn write(&self, request: ApiRequest) -> RequestResult<Value> {
        let body = self.send(&request).await?;
        let cleared = self.clear_cache();
        debug!(resource = R::NAME, %request, cleared, "Mutation applied");
        Ok(body)
    }

    async fn send(&self, request: &ApiRequest) -> RequestResult<Value> {
        retry_request(&self.retry, || self.executor.execute(request.clone())).await
    }
}

fn namespace<R: Resource>() -> String {
    format!("{}:", R::NAME)
}

fn entity_path<R: Resource>(id: EntityId) -> String {
    format!("{}/{}", R::PATH, id)
}

fn list_cache_key<R: Resource>(key: &QueryKey) -> String {
    match key.params() {
        Some(params) => format!("{}:list:{}", R::NAME, params),
        None => format!("{}:list", R::NAME),
    }
}

fn decode<T: DeserializeOwned>(body: Value) -> RequestResult<T> {
    serde_json::from_value(body).map_err(|e| RequestError::Decode {
        message: e.to_string(),
    })
}

/// The five marketplace services over one executor and local cache.
#[derive(Debug, Clone)]
pub struct DataServices {
    pub notes: NotesService,
    pub vendors: VendorsService,
    pub events: EventsService,
    pub notifications: NotificationsService,
    pub projects: ProjectsService,
}

impl DataServices {
    pub fn new(executor: Arc<dyn RequestExecutor>, store: LocalCacheStore, retry: RetryPolicy) -> Self {
        Self {
            notes: ResourceService::new(executor.clone(), store.clone(), retry.clone()),
            vendors: ResourceService::new(executor.clone(), store.clone(), retry.clone()),
            events: ResourceService::new(executor.clone(), store.clone(), retry.clone()),
            notifications: ResourceService::new(executor.clone(), store.clone(), retry.clone()),
            projects: ResourceService::new(executor, store, retry),
        }
    }

    /// Flush every resource namespace.
    pub fn clear_caches(&self) -> usize {
        self.notes.clear_cache()
            + self.vendors.clear_cache()
            + self.events.clear_cache()
            + self.notifications.clear_cache()
            + self.projects.clear_cache()
    }
}
