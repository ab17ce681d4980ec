use campus_client::{http::error_from_body, CampusClient, ClientConfig, RestClient};
use campus_core::{
    ApiRequest, ChangeKind, ChannelSpec, NewNote, Note, NoteFilters, NotificationFilters,
    RequestError, ResourceFilters, Subject,
};
use campus_test_utils::{assertions, fixtures, ChannelTransport};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_toml(base_url: &str, extra: &str) -> String {
    format!(
        r#"
        api_base_url = "{base_url}"
        realtime_endpoint = "ws://127.0.0.1:1/realtime"
        request_timeout_ms = 2000

        [auth]
        api_key = "anon"
        access_token = "jwt"

        [retry]
        max_retries = 2
        base_delay_ms = 10
        max_delay_ms = 50
        jitter_ms = 0
        {extra}
        "#
    )
}

fn config_for(base_url: &str) -> ClientConfig {
    ClientConfig::from_toml_str(&config_toml(base_url, "")).unwrap()
}

fn client_for(server: &MockServer) -> CampusClient<ChannelTransport> {
    CampusClient::with_transport(&config_for(&server.uri()), ChannelTransport::new()).unwrap()
}

fn math_year_two() -> NoteFilters {
    NoteFilters {
        subject: Some(Subject::Math),
        year: Some("2".to_string()),
        ..Default::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ============================================================================
// REST CLIENT
// ============================================================================

#[tokio::test]
async fn rest_client_sends_auth_headers_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/notes"))
        .and(header("apikey", "anon"))
        .and(header("authorization", "Bearer jwt"))
        .and(query_param("subject", "math"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"title": "Calculus I"}])))
        .expect(1)
        .mount(&server)
        .await;

    let client = RestClient::new(&config_for(&server.uri())).unwrap();
    let body = client
        .request(
            ApiRequest::get("/api/notes")
                .with_query(vec![("subject".to_string(), "math".to_string())]),
        )
        .await
        .unwrap();
    assert_eq!(body[0]["title"], "Calculus I");
}

#[tokio::test]
async fn rest_client_maps_error_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/notes"))
        .respond_with(
            ResponseTemplate::new(422)
                .set_body_json(json!({"message": "title is required", "details": {"field": "title"}})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/vendors"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let client = RestClient::new(&config_for(&server.uri())).unwrap();
    let created = client
        .request(ApiRequest::post("/api/notes").with_json(&json!({})).unwrap())
        .await;
    assert_eq!(
        created,
        Err(RequestError::Http {
            status: 422,
            message: "title is required".to_string(),
            details: Some(json!({"field": "title"})),
        })
    );

    let vendors = client.request(ApiRequest::get("/api/vendors")).await;
    assertions::assert_status(&vendors, 502);
    assert!(vendors.unwrap_err().is_transient());
}

#[tokio::test]
async fn rest_client_treats_no_content_as_null() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = RestClient::new(&config_for(&server.uri())).unwrap();
    let body = client.request(ApiRequest::delete("/api/notes/1")).await;
    assert_eq!(body, Ok(Value::Null));
}

#[tokio::test]
async fn rest_client_unreachable_is_network_error() {
    let client = RestClient::new(&config_for("http://127.0.0.1:1")).unwrap();
    let result = client.request(ApiRequest::get("/api/notes")).await;
    assertions::assert_network_error(&result);
}

// ============================================================================
// END TO END
// ============================================================================

#[tokio::test]
async fn equivalent_filters_share_one_fetch() {
    let server = MockServer::start().await;
    let note = fixtures::note("Linear Algebra", Subject::Math);
    Mock::given(method("GET"))
        .and(path("/api/notes"))
        .and(query_param("subject", "math"))
        .and(query_param("year", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([note])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let notes = &client.services().notes;

    let first = client.list(notes, &math_year_two()).await.unwrap();
    let reordered = NoteFilters::from_json(json!({"year": "2", "subject": "math"})).unwrap();
    let second = client.list(notes, &reordered).await.unwrap();

    assert_eq!(first, vec![note]);
    assert_eq!(first, second);
    assert_eq!(client.query().stats().fetches, 1);
}

#[tokio::test]
async fn mutation_invalidates_list() {
    let server = MockServer::start().await;
    let created = fixtures::note("Organic Chemistry", Subject::Chemistry);
    Mock::given(method("GET"))
        .and(path("/api/notes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/notes"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!(created)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let notes = &client.services().notes;
    let filters = NoteFilters::default();

    assert!(client.list(notes, &filters).await.unwrap().is_empty());
    let payload = NewNote {
        title: created.title.clone(),
        description: None,
        subject: Subject::Chemistry,
        university: None,
        year: None,
        price_cents: None,
        file_url: None,
    };
    let note: Note = client.create(notes, &payload).await.unwrap();
    assert_eq!(note.id, created.id);
    // invalidated, so this refetches
    client.list(notes, &filters).await.unwrap();
}

#[tokio::test]
async fn marking_notifications_read_refetches_the_list() {
    let server = MockServer::start().await;
    let unread = fixtures::notification("Your listing sold", false);
    let read = fixtures::notification("Your listing sold", true);
    Mock::given(method("GET"))
        .and(path("/api/notifications"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([unread])))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/notifications"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([read])))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/notifications/read-all"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/api/notifications/{}/read", read.id)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(read)))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let notifications = &client.services().notifications;
    let filters = NotificationFilters::default();

    let listed = client.list(notifications, &filters).await.unwrap();
    assert!(!listed[0].read);

    client.mark_all_notifications_read().await.unwrap();
    let listed = client.list(notifications, &filters).await.unwrap();
    assert!(listed[0].read);

    let marked = client.mark_notification_read(read.id).await.unwrap();
    assert!(marked.read);
    // invalidated again, so this refetches
    client.list(notifications, &filters).await.unwrap();
}

#[tokio::test]
async fn server_errors_fall_back_to_local_cache() {
    let server = MockServer::start().await;
    let note = fixtures::note("Statics", Subject::Engineering);
    Mock::given(method("GET"))
        .and(path("/api/notes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([note])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/notes"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let notes = &client.services().notes;
    let fresh = notes.list(&math_year_two()).await.unwrap();
    let fallback = notes.list(&math_year_two()).await.unwrap();
    assert_eq!(fresh, fallback);
}

#[tokio::test]
async fn unreachable_server_without_cache_fails() {
    let client =
        CampusClient::with_transport(&config_for("http://127.0.0.1:1"), ChannelTransport::new())
            .unwrap();
    let result = client.services().vendors.list(&Default::default()).await;
    assertions::assert_network_error(&result);
}

#[tokio::test]
async fn realtime_change_triggers_refetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/notes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let transport = client.realtime().transport().clone();
    client.invalidate_on_change(ChannelSpec::new("notes").with_event(ChangeKind::Insert));
    wait_until(|| transport.open_channels() == 1).await;

    let notes = &client.services().notes;
    client.list(notes, &NoteFilters::default()).await.unwrap();

    // the update is filtered out by the channel scope
    transport.emit(fixtures::change("notes", ChangeKind::Update, json!({"id": 1})));
    transport.emit(fixtures::change("notes", ChangeKind::Insert, json!({"id": 2})));
    for _ in 0..100 {
        client.list(notes, &NoteFilters::default()).await.unwrap();
        if client.query().stats().fetches == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.query().stats().fetches, 2);
}

#[tokio::test]
async fn logout_clears_everything() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/projects"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([fixtures::project("Rover")])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.invalidate_on_change(ChannelSpec::new("projects"));
    client.invalidate_on_change(ChannelSpec::new("bookings"));
    client
        .list(&client.services().projects, &Default::default())
        .await
        .unwrap();
    assert!(!client.query().is_empty());
    assert!(!client.store().backend().keys().unwrap().is_empty());

    assert_eq!(client.logout(), 2);
    assert_eq!(client.realtime().active_count(), 0);
    assert!(client.query().is_empty());
    assert!(client.store().backend().keys().unwrap().is_empty());
}

#[test]
fn file_cache_config_persists_reads() {
    let dir = tempfile::tempdir().unwrap();
    let extra = format!("\n[local_cache]\npath = {:?}\n", dir.path().join("cache"));
    let config = ClientConfig::from_toml_str(&config_toml("http://127.0.0.1:1", &extra)).unwrap();
    let client = CampusClient::with_transport(&config, ChannelTransport::new()).unwrap();
    client
        .store()
        .set("notes:list", &json!([]), Duration::from_secs(60));
    assert!(dir.path().join("cache").exists());
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn json_message_field_wins(status in 400u16..600, message in "[a-z][a-z ]{0,30}") {
        let body = json!({"message": message, "code": "X1"}).to_string();
        match error_from_body(status, None, &body) {
            RequestError::Http { status: s, message: m, details } => {
                prop_assert_eq!(s, status);
                prop_assert_eq!(m, message);
                prop_assert!(details.is_some());
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    #[test]
    fn retry_section_validation(
        max_retries in 0u32..6,
        base in 0u64..2_000,
        max in 0u64..4_000,
        jitter in 0u64..2_000,
    ) {
        let contents = format!(
            r#"
            api_base_url = "https://api.campus.test"
            realtime_endpoint = "wss://api.campus.test/realtime"
            request_timeout_ms = 1000
            [auth]
            api_key = "anon"
            [retry]
            max_retries = {max_retries}
            base_delay_ms = {base}
            max_delay_ms = {max}
            jitter_ms = {jitter}
            "#
        );
        let valid = max_retries >= 1 && base > 0 && max >= base && jitter <= base;
        let parsed = ClientConfig::from_toml_str(&contents);
        prop_assert_eq!(parsed.is_ok(), valid);
        if let Ok(config) = parsed {
            let policy = config.retry.to_policy();
            prop_assert_eq!(policy.max_retries, max_retries);
            prop_assert!(policy.backoff_delay(10, 0) <= Duration::from_millis(max));
        }
    }
}
