//! Per-request metric events.
//!
//! When a [`MetricReceiver`] is configured, the client wraps its executor in
//! [`Instrumented`], which reports two events per request: one before dispatch
//! and one after it, whether or not a response arrived.

use crate::execute::Execute;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Label value used for `status` when no response was obtained.
pub const NO_STATUS: &str = "-1";

/// Metric names reported to a [`MetricReceiver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    /// Wall-clock duration of the exchange in seconds.
    Duration,
    /// Always `1.0`; one per finished request.
    Count,
    /// Signed delta of outstanding requests, `+1.0` or `-1.0`.
    Inflight,
}

impl MetricName {
    /// Returns the conventional lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::Duration => "duration",
            MetricName::Count => "count",
            MetricName::Inflight => "inflight",
        }
    }
}

/// Label names attached to metric events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelName {
    /// Request URL path, without query string.
    Resource,
    /// HTTP method.
    Method,
    /// Numeric response status, or [`NO_STATUS`].
    Status,
}

impl LabelName {
    /// Returns the conventional lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelName::Resource => "resource",
            LabelName::Method => "method",
            LabelName::Status => "status",
        }
    }
}

/// Callback receiving metric events.
///
/// It runs inline on the task issuing the request, so it must return quickly;
/// buffer on the receiving side if the sink is slow.
pub type MetricReceiver =
    Arc<dyn Fn(HashMap<MetricName, f64>, HashMap<LabelName, String>) + Send + Sync>;

/// An [`Execute`] decorator that reports metric events around each dispatch.
pub struct Instrumented<E> {
    inner: E,
    receiver: MetricReceiver,
}

impl<E> Instrumented<E> {
    /// Wraps `inner`, reporting to `receiver`.
    pub fn new(inner: E, receiver: MetricReceiver) -> Self {
        Self { inner, receiver }
    }
}

impl<E> fmt::Debug for Instrumented<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrumented").finish_non_exhaustive()
    }
}

#[async_trait]
impl<E> Execute for Instrumented<E>
where
    E: Execute,
{
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        let labels = HashMap::from([
            (LabelName::Resource, request.url().path().to_string()),
            (LabelName::Method, request.method().as_str().to_string()),
        ]);

        (self.receiver)(
            HashMap::from([(MetricName::Inflight, 1.0)]),
            labels.clone(),
        );

        let mut completion = Completion {
            receiver: self.receiver.clone(),
            labels,
            start: Instant::now(),
            status: None,
        };
        let result = self.inner.execute(request).await;
        if let Ok(response) = &result {
            completion.status = Some(response.status().as_u16().to_string());
        }

        result
    }
}

/// Reports the closing event when dropped, so a request abandoned by its
/// caller (e.g. through `tokio::time::timeout`) is still counted.
struct Completion {
    receiver: MetricReceiver,
    labels: HashMap<LabelName, String>,
    start: Instant,
    status: Option<String>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let mut labels = std::mem::take(&mut self.labels);
        labels.insert(
            LabelName::Status,
            self.status.take().unwrap_or_else(|| NO_STATUS.to_string()),
        );

        (self.receiver)(
            HashMap::from([
                (MetricName::Duration, self.start.elapsed().as_secs_f64()),
                (MetricName::Inflight, -1.0),
                (MetricName::Count, 1.0),
            ]),
            labels,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<(HashMap<MetricName, f64>, HashMap<LabelName, String>)>>>;

    fn recorder() -> (MetricReceiver, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let receiver: MetricReceiver = Arc::new(
            move |metrics: HashMap<MetricName, f64>, labels: HashMap<LabelName, String>| {
                sink.lock().unwrap().push((metrics, labels));
            },
        );
        (receiver, events)
    }

    #[tokio::test]
    async fn transport_failure_reports_missing_status() {
        let (receiver, events) = recorder();
        let executor = Instrumented::new(reqwest::Client::new(), receiver);

        let request = reqwest::Client::new()
            .get("http://127.0.0.1:1/api/vlan/v1/vlan.json?page=2")
            .build()
            .unwrap();
        assert!(executor.execute(request).await.is_err());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);

        let (before, before_labels) = &events[0];
        assert_eq!(before, &HashMap::from([(MetricName::Inflight, 1.0)]));
        assert_eq!(before_labels[&LabelName::Resource], "/api/vlan/v1/vlan.json");
        assert_eq!(before_labels[&LabelName::Method], "GET");
        assert!(!before_labels.contains_key(&LabelName::Status));

        let (after, after_labels) = &events[1];
        assert_eq!(after[&MetricName::Inflight], -1.0);
        assert_eq!(after[&MetricName::Count], 1.0);
        assert!(after[&MetricName::Duration] >= 0.0);
        assert_eq!(after_labels[&LabelName::Status], NO_STATUS);
    }

    struct Stalled;

    #[async_trait]
    impl Execute for Stalled {
        async fn execute(
            &self,
            request: reqwest::Request,
        ) -> Result<reqwest::Response, reqwest::Error> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            reqwest::Client::new().execute(request).await
        }
    }

    #[tokio::test]
    async fn abandoned_request_still_closes_inflight() {
        let (receiver, events) = recorder();
        let executor = Instrumented::new(Stalled, receiver);

        let request = reqwest::Client::new()
            .delete("https://engine.example.com/api/vlan/v1/vlan.json/abc")
            .build()
            .unwrap();
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), executor.execute(request)).await;
        assert!(outcome.is_err());

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, HashMap::from([(MetricName::Inflight, 1.0)]));

        let (after, after_labels) = &events[1];
        assert_eq!(after[&MetricName::Inflight], -1.0);
        assert_eq!(after[&MetricName::Count], 1.0);
        assert!(after[&MetricName::Duration] > 0.01);
        assert_eq!(after_labels[&LabelName::Status], NO_STATUS);
        assert_eq!(after_labels[&LabelName::Method], "DELETE");
    }

    #[test]
    fn names_render_lowercase() {
        assert_eq!(MetricName::Inflight.as_str(), "inflight");
        assert_eq!(LabelName::Resource.as_str(), "resource");
    }
}
