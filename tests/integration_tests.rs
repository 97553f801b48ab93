//! Integration tests using wiremock to simulate the Engine API.

use anxcloud::credential::{body_digest, SignatureCredential, BODYLESS_HEADERS, BODY_HEADERS};
use anxcloud::metadata::RequestMetadata;
use anxcloud::{
    as_stream, loop_until, Client, Error, Execute, LabelName, ListPageable, MetricName,
    MetricReceiver, QueryParam,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Vlan {
    identifier: String,
    name: String,
}

fn vlan(identifier: &str, name: &str) -> Vlan {
    Vlan {
        identifier: identifier.to_string(),
        name: name.to_string(),
    }
}

fn token_client(server: &MockServer) -> Client {
    Client::builder()
        .base_url(server.uri())
        .unwrap()
        .token("T")
        .build()
        .unwrap()
}

fn signature_key(key: &str) -> SignatureCredential {
    SignatureCredential::new("key-1", key)
}

/// Rebuilds a request as the server received it.
fn as_reqwest(received: &wiremock::Request) -> reqwest::Request {
    let mut request = reqwest::Request::new(received.method.clone(), received.url.clone());
    *request.headers_mut() = received.headers.clone();
    if !received.body.is_empty() {
        *request.body_mut() = Some(received.body.clone().into());
    }
    request
}

#[tokio::test]
async fn test_token_authorization_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json/abc"))
        .and(header("authorization", "Token T"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vlan("abc", "prod")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = token_client(&mock_server);
    let response = client
        .get::<Vlan>("/api/vlan/v1/vlan.json/abc")
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.data, vlan("abc", "prod"));
    assert!(!response.raw_body.is_empty());
}

#[tokio::test]
async fn test_signed_post_carries_digest() {
    let mock_server = MockServer::start().await;
    let payload = json!({"name": "backend", "location": "ANX04"});

    Mock::given(method("POST"))
        .and(path("/api/vlan/v1/vlan.json"))
        .and(body_json(&payload))
        .respond_with(ResponseTemplate::new(201).set_body_json(vlan("new", "backend")))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .signature("key-1", "s3cr3t")
        .build()
        .unwrap();

    let created = client
        .post::<_, Vlan>("/api/vlan/v1/vlan.json", &payload)
        .await
        .unwrap();
    assert_eq!(created.status, 201);

    let received = mock_server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let request = &received[0];

    assert_eq!(request.headers["digest"], body_digest(&request.body).as_str());
    assert_eq!(request.headers["content-type"], "application/json");
    assert_eq!(
        request.headers["content-length"],
        request.body.len().to_string().as_str()
    );
    assert!(request.headers.contains_key("date"));

    let authorization = request.headers["authorization"].to_str().unwrap();
    assert!(authorization.starts_with("Signature keyId=\"key-1\",algorithm=\"hmac-sha512\""));
    assert!(authorization.contains(&format!("headers=\"{}\"", BODY_HEADERS)));

    let rebuilt = as_reqwest(request);
    assert!(signature_key("s3cr3t").verify(&rebuilt).unwrap());
    assert!(!signature_key("other").verify(&rebuilt).unwrap());
}

#[tokio::test]
async fn test_signed_get_without_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vlan("abc", "prod")))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .signature("key-1", "s3cr3t")
        .build()
        .unwrap();

    client
        .get::<Vlan>("/api/vlan/v1/vlan.json/abc")
        .await
        .unwrap();

    let received = mock_server.received_requests().await.unwrap();
    let request = &received[0];

    assert!(!request.headers.contains_key("digest"));
    let authorization = request.headers["authorization"].to_str().unwrap();
    assert!(authorization.contains(&format!("headers=\"{}\"", BODYLESS_HEADERS)));
    assert!(signature_key("s3cr3t").verify(&as_reqwest(request)).unwrap());
}

#[tokio::test]
async fn test_engine_error_is_parsed() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/vlan/v1/vlan.json"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": {
                "code": 401,
                "message": "bad",
                "validation": {"name": "required"}
            },
            "debug": {"source": "auth"}
        })))
        .mount(&mock_server)
        .await;

    let client = token_client(&mock_server);
    let result = client
        .post::<_, Vlan>("/api/vlan/v1/vlan.json", &json!({}))
        .await;

    match result {
        Err(Error::Response(api)) => {
            assert_eq!(api.code, 401);
            assert_eq!(api.message, "bad");
            assert_eq!(api.validation["name"], "required");
            assert_eq!(api.debug_source, "auth");
            assert_eq!(api.status, 401);
            assert_eq!(api.method, "POST");
            assert_eq!(api.url.path(), "/api/vlan/v1/vlan.json");

            let message = api.to_string();
            assert!(message.contains("401"), "{message}");
            assert!(message.contains("bad"), "{message}");
        }
        other => panic!("Expected Response error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unparseable_error_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&mock_server)
        .await;

    let client = token_client(&mock_server);
    let err = client
        .get::<Vlan>("/api/vlan/v1/vlan.json")
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(http::StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(err.raw_response(), Some("upstream exploded"));
    assert!(err.as_response_error().is_none());
    assert!(matches!(err, Error::ErrorBody { .. }));
}

#[tokio::test]
async fn test_error_parsing_disabled_returns_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .respond_with(ResponseTemplate::new(500).set_body_string("raw failure"))
        .mount(&mock_server)
        .await;

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token("T")
        .parse_engine_errors(false)
        .build()
        .unwrap();

    let request = client
        .request::<()>(
            &RequestMetadata::new(http::Method::GET, "/api/vlan/v1/vlan.json"),
            None,
        )
        .unwrap();
    let response = client.execute(request).await.unwrap();
    assert_eq!(response.status(), 500);
    assert_eq!(response.text().await.unwrap(), "raw failure");

    let typed = client.get::<Vlan>("/api/vlan/v1/vlan.json").await;
    match typed {
        Err(Error::HttpError {
            status,
            raw_response,
            ..
        }) => {
            assert_eq!(status, 500);
            assert_eq!(raw_response, "raw failure");
        }
        other => panic!("Expected HttpError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deserialization_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"unexpected": true})))
        .mount(&mock_server)
        .await;

    let client = token_client(&mock_server);
    let result = client.get::<Vlan>("/api/vlan/v1/vlan.json/abc").await;

    match result {
        Err(Error::DeserializationFailed {
            raw_response,
            status,
            ..
        }) => {
            assert_eq!(status, 200);
            assert!(raw_response.contains("unexpected"));
        }
        other => panic!("Expected DeserializationFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_body_decodes_as_unit() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/vlan/v1/vlan.json/abc"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let client = token_client(&mock_server);
    let response = client
        .delete::<()>("/api/vlan/v1/vlan.json/abc")
        .await
        .unwrap();

    assert_eq!(response.status, 204);
    assert!(response.raw_body.is_empty());
}

#[tokio::test]
async fn test_network_failure() {
    let client = Client::builder()
        .base_url("http://127.0.0.1:1")
        .unwrap()
        .token("T")
        .build()
        .unwrap();

    let result = client.get::<Vlan>("/api/vlan/v1/vlan.json").await;

    match result {
        Err(e @ Error::Network(_)) => assert_eq!(e.status(), None),
        other => panic!("Expected Network error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_metrics_for_successful_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json/abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vlan("abc", "prod")))
        .mount(&mock_server)
        .await;

    type Events = Vec<(HashMap<MetricName, f64>, HashMap<LabelName, String>)>;
    let events: Arc<Mutex<Events>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let receiver: MetricReceiver = Arc::new(
        move |metrics: HashMap<MetricName, f64>, labels: HashMap<LabelName, String>| {
            sink.lock().unwrap().push((metrics, labels));
        },
    );

    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token("T")
        .metric_receiver(receiver)
        .build()
        .unwrap();

    client
        .get::<Vlan>("/api/vlan/v1/vlan.json/abc")
        .await
        .unwrap();

    let events: Events = events.lock().unwrap().drain(..).collect();
    assert_eq!(events.len(), 2);

    let (before, before_labels) = &events[0];
    assert_eq!(before, &HashMap::from([(MetricName::Inflight, 1.0)]));
    assert_eq!(
        before_labels[&LabelName::Resource],
        "/api/vlan/v1/vlan.json/abc"
    );
    assert_eq!(before_labels[&LabelName::Method], "GET");

    let (after, after_labels) = &events[1];
    assert_eq!(after[&MetricName::Inflight], -1.0);
    assert_eq!(after[&MetricName::Count], 1.0);
    assert!(after.contains_key(&MetricName::Duration));
    assert_eq!(after_labels[&LabelName::Status], "200");
}

#[tokio::test]
async fn test_default_and_custom_user_agent() {
    let mock_server = MockServer::start().await;

    let default_agent = format!(
        "anxcloud/{} ({})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    );
    Mock::given(method("GET"))
        .and(path("/default"))
        .and(header("user-agent", default_agent.as_str()))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/custom"))
        .and(header("user-agent", "terraform-provider/2.0"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&mock_server)
        .await;

    token_client(&mock_server)
        .get::<()>("/default")
        .await
        .unwrap();

    let custom = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token("T")
        .user_agent("terraform-provider/2.0")
        .build()
        .unwrap();
    custom.get::<()>("/custom").await.unwrap();
}

/// Counts dispatches before handing them to a real client.
struct CountingExecutor {
    inner: reqwest::Client,
    calls: AtomicUsize,
}

#[async_trait]
impl Execute for CountingExecutor {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(request).await
    }
}

#[tokio::test]
async fn test_custom_executor_is_used() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let executor = Arc::new(CountingExecutor {
        inner: reqwest::Client::new(),
        calls: AtomicUsize::new(0),
    });
    let client = Client::builder()
        .base_url(mock_server.uri())
        .unwrap()
        .token("T")
        .executor(executor.clone())
        .build()
        .unwrap();

    client.get::<()>("/one").await.unwrap();
    client.get::<()>("/two").await.unwrap();

    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

async fn mount_vlan_pages(mock_server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .and(query_param("page", "1"))
        .and(query_param("limit", "2"))
        .and(query_param("search", "prod"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "page": 1,
            "limit": 2,
            "total_pages": 2,
            "total_items": 3,
            "data": [vlan("a", "prod-a"), vlan("b", "prod-b")]
        })))
        .mount(mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .and(query_param("page", "2"))
        .and(query_param("limit", "2"))
        .and(query_param("search", "prod"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "page": 2,
            "limit": 2,
            "total_pages": 2,
            "total_items": 3,
            "data": [vlan("c", "prod-c")]
        })))
        .mount(mock_server)
        .await;
}

#[tokio::test]
async fn test_list_pages_with_loop_until() {
    let mock_server = MockServer::start().await;
    mount_vlan_pages(&mock_server).await;

    let vlans = ListPageable::<Vlan>::new(token_client(&mock_server), "/api/vlan/v1/vlan.json");
    let options = [QueryParam::pair("search", "prod")];

    let mut seen = Vec::new();
    anxcloud::loop_until_with(&vlans, 2, &options, |vlan| {
        seen.push(vlan.identifier.clone());
        Ok::<_, Error>(vlan.identifier == "c")
    })
    .await
    .unwrap();

    assert_eq!(seen, vec!["a", "b", "c"]);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_list_exhausted_without_match() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "page": 1,
            "limit": 10,
            "total_pages": 1,
            "total_items": 1,
            "data": [vlan("a", "prod-a")]
        })))
        .mount(&mock_server)
        .await;

    let vlans = ListPageable::<Vlan>::new(token_client(&mock_server), "/api/vlan/v1/vlan.json");
    let result = loop_until(&vlans, |_| Ok::<_, Error>(false)).await;

    assert!(result.unwrap_err().is_condition_never_met());
}

#[tokio::test]
async fn test_list_pages_as_stream() {
    let mock_server = MockServer::start().await;
    mount_vlan_pages(&mock_server).await;

    let vlans = Arc::new(ListPageable::<Vlan>::new(
        token_client(&mock_server),
        "/api/vlan/v1/vlan.json",
    ));
    let (mut stream, _cancel) = as_stream(vlans, 2, vec![QueryParam::pair("search", "prod")]);

    let mut names = Vec::new();
    while let Some(item) = stream.next().await {
        names.push(item.unwrap().name);
    }

    assert_eq!(names, vec!["prod-a", "prod-b", "prod-c"]);
}

#[tokio::test]
async fn test_list_without_total_pages_continues_while_full() {
    let mock_server = MockServer::start().await;

    for (page, data) in [
        ("1", json!([vlan("a", "prod-a"), vlan("b", "prod-b")])),
        ("2", json!([vlan("c", "prod-c"), vlan("d", "prod-d")])),
        ("3", json!([])),
    ] {
        Mock::given(method("GET"))
            .and(path("/api/vlan/v1/vlan.json"))
            .and(query_param("page", page))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "page": page.parse::<u32>().unwrap(),
                "limit": 2,
                "data": data
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let vlans = Arc::new(ListPageable::<Vlan>::new(
        token_client(&mock_server),
        "/api/vlan/v1/vlan.json",
    ));
    let (mut stream, _cancel) = as_stream(vlans, 2, vec![]);

    let mut ids = Vec::new();
    while let Some(item) = stream.next().await {
        ids.push(item.unwrap().identifier);
    }

    assert_eq!(ids, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_list_without_total_pages_stops_on_short_page() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [vlan("a", "prod-a"), vlan("b", "prod-b")]
        })))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [vlan("c", "prod-c")]
        })))
        .mount(&mock_server)
        .await;

    let vlans = ListPageable::<Vlan>::new(token_client(&mock_server), "/api/vlan/v1/vlan.json");
    let mut seen = 0;
    let result = anxcloud::loop_until_with(&vlans, 2, &[], |_| {
        seen += 1;
        Ok::<_, Error>(false)
    })
    .await;

    assert!(result.unwrap_err().is_condition_never_met());
    assert_eq!(seen, 3);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_list_advances_by_requested_page_number() {
    let mock_server = MockServer::start().await;

    // answers page 1 whatever was asked
    Mock::given(method("GET"))
        .and(path("/api/vlan/v1/vlan.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "page": 1,
            "limit": 1,
            "total_pages": 3,
            "data": [vlan("a", "prod-a")]
        })))
        .mount(&mock_server)
        .await;

    let vlans = ListPageable::<Vlan>::new(token_client(&mock_server), "/api/vlan/v1/vlan.json");
    let result = anxcloud::loop_until_with(&vlans, 1, &[], |_| Ok::<_, Error>(false)).await;

    assert!(result.unwrap_err().is_condition_never_met());
    let pages: Vec<String> = mock_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|request| {
            request
                .url
                .query_pairs()
                .find(|(key, _)| key == "page")
                .map(|(_, value)| value.into_owned())
        })
        .collect();
    assert_eq!(pages, vec!["1", "2", "3"]);
}
