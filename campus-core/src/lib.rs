//! Campus Core - shared types for the client data-sync layer
//!
//! Error taxonomy, geo math, the HTTP retry policy, canonical query keys,
//! typed resource filters, marketplace entities and the two seams the
//! higher crates plug into: [`RequestExecutor`] for HTTP and
//! [`ChangeTransport`] for realtime change feeds.

pub mod clock;
pub mod entities;
pub mod error;
pub mod filter;
pub mod geo;
pub mod query_key;
pub mod realtime;
pub mod request;
pub mod retry;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Row identifier assigned by the data platform.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{Clock, SystemClock};
pub use entities::{
    CampusEvent, CampusEventUpdate, NewCampusEvent, NewNote, NewNotification, NewProject,
    NewVendor, Note, NoteUpdate, Notification, NotificationUpdate, Project, ProjectUpdate,
    UnreadCount, Vendor, VendorUpdate,
};
pub use error::{RealtimeError, RequestError, RequestResult, StoreError, ValidationError};
pub use filter::{
    EventCategory, EventFilters, NoteFilters, NoteSort, NotificationFilters, NotificationKind,
    ProjectFilters, ProjectStatus, ResourceFilters, Subject, VendorCategory, VendorFilters,
};
pub use geo::{
    bounds, centroid, distance, filter_by_radius, format_distance, sort_by_distance, Bounds,
    Coordinates, Located, WithDistance, EARTH_RADIUS_M,
};
pub use query_key::{canonical_params, QueryKey};
pub use realtime::{
    ChangeEvent, ChangeKind, ChangeStream, ChangeTransport, ChannelSpec, FilterOp, RowFilter,
};
pub use request::{ApiRequest, Method, RequestExecutor};
pub use retry::{retry_request, RetryPolicy};
