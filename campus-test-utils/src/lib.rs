//! Campus Test Utilities
//!
//! Shared test infrastructure for the Campus workspace:
//! - Controllable doubles for the clock, HTTP and realtime seams
//! - Proptest generators for filters, coordinates and errors
//! - Fixtures for marketplace rows
//! - Assertions on structured request errors

pub use campus_core::{
    ApiRequest, CampusEvent, ChangeEvent, ChangeKind, ChangeStream, ChangeTransport, ChannelSpec,
    Clock, Coordinates, EventCategory, Method, Note, NoteFilters, NoteSort, Notification,
    NotificationKind, Project, ProjectStatus, RealtimeError, RequestError, RequestExecutor,
    RequestResult, Subject, Timestamp, Vendor, VendorCategory, VendorFilters,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MANUAL CLOCK
// ============================================================================

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Starts at 2024-09-01T00:00:00Z.
    pub fn new() -> Self {
        Self::at(fixtures::term_start())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = guard(&self.now);
        *now = now.checked_add_signed(by).unwrap_or(*now);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *guard(&self.now) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *guard(&self.now)
    }
}

// ============================================================================
// SCRIPTED EXECUTOR
// ============================================================================

/// Request executor that replays queued responses and records every call.
///
/// When the queue is empty the fallback response (if any) is repeated;
/// otherwise the call fails with a network error.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    responses: Mutex<VecDeque<RequestResult<Value>>>,
    fallback: Mutex<Option<RequestResult<Value>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `response`.
    pub fn always(response: RequestResult<Value>) -> Self {
        let executor = Self::new();
        *guard(&executor.fallback) = Some(response);
        executor
    }

    pub fn push_ok(&self, body: Value) -> &Self {
        guard(&self.responses).push_back(Ok(body));
        self
    }

    pub fn push_err(&self, err: RequestError) -> &Self {
        guard(&self.responses).push_back(Err(err));
        self
    }

    /// Number of requests executed so far.
    pub fn calls(&self) -> usize {
        guard(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        guard(&self.requests).clone()
    }

    pub fn last_request(&self) -> Option<ApiRequest> {
        guard(&self.requests).last().cloned()
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    async fn execute(&self, request: ApiRequest) -> RequestResult<Value> {
        guard(&self.requests).push(request);
        if let Some(response) = guard(&self.responses).pop_front() {
            return response;
        }
        guard(&self.fallback)
            .clone()
            .unwrap_or_else(|| Err(RequestError::network("no scripted response")))
    }
}

// ============================================================================
// IN-MEMORY CHANGE TRANSPORT
// ============================================================================

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, RealtimeError>>;

#[derive(Debug, Default)]
struct TransportState {
    channels: Vec<(ChannelSpec, EventSender)>,
    connects: usize,
    failures_pending: usize,
}

/// Change transport backed by in-process channels.
///
/// `emit` fans an event out to every open connection on the event's table;
/// row and event-kind filtering is left to the subscriber.
#[derive(Debug, Clone, Default)]
pub struct ChannelTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event`. Returns how many connections received it.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let mut state = guard(&self.state);
        state.channels.retain(|(_, tx)| !tx.is_closed());
        state
            .channels
            .iter()
            .filter(|(spec, _)| spec.table == event.table)
            .filter(|(_, tx)| tx.send(Ok(event.clone())).is_ok())
            .count()
    }

    /// Push a transport error into every open connection.
    pub fn emit_error(&self, err: RealtimeError) {
        for (_, tx) in &guard(&self.state).channels {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// End every open stream, as a dropped socket would.
    pub fn drop_connections(&self) {
        guard(&self.state).channels.clear();
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        guard(&self.state).failures_pending = count;
    }

    pub fn connect_count(&self) -> usize {
        guard(&self.state).connects
    }

    /// Connections whose subscriber is still listening.
    pub fn open_channels(&self) -> usize {
        let mut state = guard(&self.state);
        state.channels.retain(|(_, tx)| !tx.is_closed());
        state.channels.len()
    }
}

#[async_trait]
impl ChangeTransport for ChannelTransport {
    async fn connect(&self, spec: &ChannelSpec) -> Result<ChangeStream, RealtimeError> {
        let mut state = guard(&self.state);
        state.connects += 1;
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(RealtimeError::Connect {
                reason: "scripted connect failure".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.channels.push((spec.clone(), tx));
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Campus types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_subject() -> impl Strategy<Value = Subject> {
        prop_oneof![
            Just(Subject::Math),
            Just(Subject::Physics),
            Just(Subject::Chemistry),
            Just(Subject::Biology),
            Just(Subject::ComputerScience),
            Just(Subject::Engineering),
            Just(Subject::Economics),
            Just(Subject::Law),
            Just(Subject::Humanities),
            Just(Subject::Other),
        ]
    }

    pub fn arb_note_sort() -> impl Strategy<Value = NoteSort> {
        prop_oneof![
            Just(NoteSort::Newest),
            Just(NoteSort::Popular),
            Just(NoteSort::Rating),
            Just(NoteSort::PriceAsc),
            Just(NoteSort::PriceDesc),
        ]
    }

    pub fn arb_vendor_category() -> impl Strategy<Value = VendorCategory> {
        prop_oneof![
            Just(VendorCategory::Food),
            Just(VendorCategory::Stationery),
            Just(VendorCategory::Printing),
            Just(VendorCategory::Laundry),
            Just(VendorCategory::Electronics),
            Just(VendorCategory::Groceries),
            Just(VendorCategory::Services),
            Just(VendorCategory::Other),
        ]
    }

    pub fn arb_note_filters() -> impl Strategy<Value = NoteFilters> {
        (
            prop::option::of(arb_subject()),
            prop::option::of("[A-Z]{2,5}"),
            prop::option::of("[1-5]"),
            prop::option::of("[a-z ]{1,12}"),
            prop::option::of(arb_note_sort()),
            prop::option::of(1u32..100),
            prop::option::of(0u32..500),
        )
            .prop_map(
                |(subject, university, year, search, sort_by, limit, offset)| NoteFilters {
                    subject,
                    university,
                    year,
                    search,
                    sort_by,
                    limit,
                    offset,
                },
            )
    }

    pub fn arb_vendor_filters() -> impl Strategy<Value = VendorFilters> {
        (
            prop::option::of(arb_vendor_category()),
            prop::option::of("[A-Z]{2,5}"),
            prop::option::of(any::<bool>()),
            prop::option::of(any::<bool>()),
            prop::option::of(1u32..100),
        )
            .prop_map(|(category, university, open_now, verified, limit)| VendorFilters {
                category,
                university,
                open_now,
                verified,
                limit,
                ..Default::default()
            })
    }

    /// Coordinates away from the poles and the antimeridian.
    pub fn arb_coordinates() -> impl Strategy<Value = Coordinates> {
        (-80.0f64..80.0, -170.0f64..170.0).prop_map(|(lat, lon)| Coordinates::new(lat, lon))
    }

    pub fn arb_request_error() -> impl Strategy<Value = RequestError> {
        prop_oneof![
            "[a-z ]{1,20}".prop_map(RequestError::network),
            (400u16..600, "[a-z ]{1,20}").prop_map(|(status, msg)| RequestError::http(status, msg)),
            "[a-z ]{1,20}".prop_map(|message| RequestError::Decode { message }),
        ]
    }

    pub fn arb_change_kind() -> impl Strategy<Value = ChangeKind> {
        prop_oneof![
            Just(ChangeKind::Insert),
            Just(ChangeKind::Update),
            Just(ChangeKind::Delete),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built marketplace rows.

    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    pub fn term_start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_725_148_800, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn note(title: &str, subject: Subject) -> Note {
        Note {
            id: Uuid::now_v7(),
            title: title.to_string(),
            description: None,
            subject,
            university: Some("UNI".to_string()),
            year: Some("2".to_string()),
            price_cents: Some(300),
            file_url: None,
            author_id: Uuid::now_v7(),
            downloads: 0,
            rating: None,
            created_at: term_start(),
        }
    }

    pub fn vendor(name: &str, latitude: f64, longitude: f64) -> Vendor {
        Vendor {
            id: Uuid::now_v7(),
            name: name.to_string(),
            category: VendorCategory::Food,
            description: None,
            university: Some("UNI".to_string()),
            latitude: Some(latitude),
            longitude: Some(longitude),
            verified: true,
            rating: None,
            owner_id: Uuid::now_v7(),
            created_at: term_start(),
        }
    }

    pub fn event(title: &str, starts_at: DateTime<Utc>) -> CampusEvent {
        CampusEvent {
            id: Uuid::now_v7(),
            title: title.to_string(),
            category: EventCategory::Social,
            description: None,
            university: None,
            venue: Some("Main Hall".to_string()),
            latitude: None,
            longitude: None,
            starts_at,
            ends_at: None,
            organizer_id: Uuid::now_v7(),
        }
    }

    pub fn notification(title: &str, read: bool) -> Notification {
        Notification {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            kind: NotificationKind::Message,
            title: title.to_string(),
            body: None,
            read,
            created_at: term_start(),
        }
    }

    pub fn project(title: &str) -> Project {
        Project {
            id: Uuid::now_v7(),
            title: title.to_string(),
            description: None,
            status: ProjectStatus::Open,
            skills: vec!["rust".to_string()],
            university: None,
            owner_id: Uuid::now_v7(),
            created_at: term_start(),
        }
    }

    /// A change payload for `table` with `record` as the new row.
    pub fn change(table: &str, kind: ChangeKind, record: Value) -> ChangeEvent {
        ChangeEvent {
            event_type: kind,
            table: table.to_string(),
            record: Some(record),
            old_record: None,
        }
    }

    pub fn booking_insert(vendor_id: &str) -> ChangeEvent {
        change(
            "bookings",
            ChangeKind::Insert,
            json!({"id": Uuid::now_v7(), "vendor_id": vendor_id, "status": "pending"}),
        )
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on structured request errors.

    use super::*;

    /// Assert that a request failed with the given HTTP status.
    #[track_caller]
    pub fn assert_status<T: std::fmt::Debug>(result: &RequestResult<T>, status: u16) {
        match result {
            Err(err) if err.status() == Some(status) => {}
            other => panic!("Expected HTTP {status} error, got: {other:?}"),
        }
    }

    /// Assert that a request failed without reaching the server.
    #[track_caller]
    pub fn assert_network_error<T: std::fmt::Debug>(result: &RequestResult<T>) {
        match result {
            Err(RequestError::Network { .. }) => {}
            other => panic!("Expected network error, got: {other:?}"),
        }
    }
}
