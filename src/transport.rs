//! Transports that move buffered records to the collector

use crate::buffer::BoundedQueue;
use crate::command::{Command, CommandService, ProfileTask};
use crate::config::{Config, Protocol};
use crate::errors::{ReporterError, Result};
use crate::identity::SharedIdentity;
use crate::telemetry::{LogEntry, MeterData, ProfileSnapshot, RecordKind, Segment};
use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Everything the reporter needs from a wire protocol. Each operation is
/// retried by its own duty loop; implementations only report failure.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Announce liveness. The first call and every `factor`-th call after it
    /// also send instance properties.
    async fn heartbeat(&self) -> Result<()>;

    async fn report_segments(&self, queue: &BoundedQueue<Segment>, block: bool) -> Result<()>;

    async fn report_logs(&self, queue: &BoundedQueue<LogEntry>, block: bool) -> Result<()>;

    async fn report_meters(&self, queue: &BoundedQueue<MeterData>, block: bool) -> Result<()>;

    async fn report_snapshots(&self, queue: &BoundedQueue<ProfileSnapshot>, block: bool) -> Result<()>;

    /// Poll for outstanding commands and hand them to the command service.
    async fn query_profile_commands(&self) -> Result<()>;

    async fn notify_profile_task_finish(&self, task: &ProfileTask) -> Result<()>;

    fn metrics(&self) -> Option<TransportMetricsSnapshot> {
        None
    }
}

/// Routes a queue of records to the matching transport operation.
pub trait Reportable: Send + Sync + Sized + 'static {
    const KIND: RecordKind;

    fn report<'a>(transport: &'a dyn Transport, queue: &'a BoundedQueue<Self>, block: bool) -> BoxFuture<'a, Result<()>>;
}

impl Reportable for Segment {
    const KIND: RecordKind = RecordKind::Segment;

    fn report<'a>(transport: &'a dyn Transport, queue: &'a BoundedQueue<Self>, block: bool) -> BoxFuture<'a, Result<()>> {
        transport.report_segments(queue, block)
    }
}

impl Reportable for LogEntry {
    const KIND: RecordKind = RecordKind::Log;

    fn report<'a>(transport: &'a dyn Transport, queue: &'a BoundedQueue<Self>, block: bool) -> BoxFuture<'a, Result<()>> {
        transport.report_logs(queue, block)
    }
}

impl Reportable for MeterData {
    const KIND: RecordKind = RecordKind::Meter;

    fn report<'a>(transport: &'a dyn Transport, queue: &'a BoundedQueue<Self>, block: bool) -> BoxFuture<'a, Result<()>> {
        transport.report_meters(queue, block)
    }
}

impl Reportable for ProfileSnapshot {
    const KIND: RecordKind = RecordKind::Snapshot;

    fn report<'a>(transport: &'a dyn Transport, queue: &'a BoundedQueue<Self>, block: bool) -> BoxFuture<'a, Result<()>> {
        transport.report_snapshots(queue, block)
    }
}

/// Build the transport selected by `config.protocol`.
pub fn build_transport(
    config: &Config,
    identity: SharedIdentity,
    commands: Arc<CommandService>,
) -> Result<Arc<dyn Transport>> {
    match config.protocol {
        Protocol::Http => {
            let http = HttpTransport::new(config, identity, commands)?;
            Ok(Arc::new(MeteredTransport::new(http)))
        }
        other => Err(ReporterError::Config(format!(
            "{} transport is not available in this build, use http",
            other
        ))),
    }
}

/// Serialize each record on its own so one bad record does not sink the batch.
fn encode_records<T: Serialize>(records: &[T], kind: &str) -> Vec<Value> {
    records
        .iter()
        .filter_map(|record| match serde_json::to_value(record) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("dropping {} record that failed to serialize: {}", kind, ReporterError::from(e));
                None
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CommandsResponse {
    #[serde(default)]
    commands: Vec<Command>,
}

/// JSON-over-HTTP transport
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    authentication: Option<String>,
    identity: SharedIdentity,
    commands: Arc<CommandService>,
    last_command_time: Arc<AtomicI64>,
}

impl HttpTransport {
    pub fn new(config: &Config, identity: SharedIdentity, commands: Arc<CommandService>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(format!("apm_reporter/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ReporterError::Http)?;

        Ok(Self {
            client,
            base_url: config.collector_url(),
            authentication: config.authentication.clone().filter(|token| !token.is_empty()),
            identity,
            commands,
            last_command_time: Arc::new(AtomicI64::new(-1)),
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.authentication {
            request = request.header("Authentication", token);
        }

        let response = request.send().await?;
        Self::check_response(response, path).await
    }

    async fn check_response(response: Response, path: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let error_body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        Err(classify_status(status, path, &error_body))
    }

    async fn send_records<T: Serialize>(&self, path: &str, kind: &str, records: &[T]) -> Result<()> {
        let payload = encode_records(records, kind);
        if payload.is_empty() {
            return Ok(());
        }

        debug!("sending {} {} records to {}", payload.len(), kind, path);
        self.post(path, &payload).await?;
        Ok(())
    }

    async fn send_instance_props(&self) -> Result<()> {
        let identity = self.identity.snapshot();
        self.post(
            "/v3/management/reportProperties",
            &json!({
                "service": identity.service,
                "serviceInstance": identity.service_instance,
                "properties": identity.properties,
            }),
        )
        .await?;
        debug!("sent instance properties for {}", identity.service_instance);
        Ok(())
    }

    async fn send_keep_alive(&self) -> Result<()> {
        let identity = self.identity.snapshot();
        self.post(
            "/v3/management/keepAlive",
            &json!({
                "service": identity.service,
                "serviceInstance": identity.service_instance,
            }),
        )
        .await?;
        Ok(())
    }
}

fn classify_status(status: StatusCode, path: &str, body: &str) -> ReporterError {
    match status.as_u16() {
        400 | 413 | 422 => ReporterError::Rejected(format!("{} refused payload ({}): {}", path, status, body)),
        401 | 403 => ReporterError::Rejected(format!("{} unauthorized ({}): {}", path, status, body)),
        429 => ReporterError::TransportUnavailable(format!("{} rate limited: {}", path, body)),
        500..=599 => ReporterError::TransportUnavailable(format!("{} server error ({}): {}", path, status, body)),
        _ => ReporterError::Rejected(format!("{} unexpected response {}: {}", path, status, body)),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn heartbeat(&self) -> Result<()> {
        let props = if self.identity.refresh().tick() {
            let sent = self.send_instance_props().await;
            if sent.is_err() {
                self.identity.refresh().prime();
            }
            sent
        } else {
            Ok(())
        };

        self.send_keep_alive().await?;
        props
    }

    async fn report_segments(&self, queue: &BoundedQueue<Segment>, block: bool) -> Result<()> {
        let batch = queue.drain(block).await;
        if batch.is_empty() {
            return Ok(());
        }
        self.send_records("/v3/segments", "segment", batch.items()).await
    }

    async fn report_logs(&self, queue: &BoundedQueue<LogEntry>, block: bool) -> Result<()> {
        let batch = queue.drain(block).await;
        if batch.is_empty() {
            return Ok(());
        }
        self.send_records("/v3/logs", "log", batch.items()).await
    }

    async fn report_meters(&self, queue: &BoundedQueue<MeterData>, block: bool) -> Result<()> {
        let batch = queue.drain(block).await;
        if batch.is_empty() {
            return Ok(());
        }
        self.send_records("/v3/meters", "meter", batch.items()).await
    }

    async fn report_snapshots(&self, queue: &BoundedQueue<ProfileSnapshot>, block: bool) -> Result<()> {
        let batch = queue.drain(block).await;
        if batch.is_empty() {
            return Ok(());
        }
        self.send_records("/v3/profile/snapshots", "snapshot", batch.items()).await
    }

    async fn query_profile_commands(&self) -> Result<()> {
        let identity = self.identity.snapshot();
        let response = self
            .post(
                "/v3/profile/getProfileTaskCommands",
                &json!({
                    "service": identity.service,
                    "serviceInstance": identity.service_instance,
                    "lastCommandTime": self.last_command_time.load(Ordering::Relaxed),
                }),
            )
            .await?;

        let body: CommandsResponse = response.json().await?;
        if body.commands.is_empty() {
            return Ok(());
        }

        let newest = body
            .commands
            .iter()
            .filter_map(|c| c.args.get("CreateTime").and_then(|t| t.parse::<i64>().ok()))
            .max();
        if let Some(newest) = newest {
            self.last_command_time.fetch_max(newest, Ordering::Relaxed);
        }

        debug!("received {} commands from collector", body.commands.len());
        self.commands.receive(body.commands);
        Ok(())
    }

    async fn notify_profile_task_finish(&self, task: &ProfileTask) -> Result<()> {
        let identity = self.identity.snapshot();
        self.post(
            "/v3/profile/finishTask",
            &json!({
                "service": identity.service,
                "serviceInstance": identity.service_instance,
                "taskId": task.task_id,
            }),
        )
        .await?;
        Ok(())
    }
}

/// Wraps a transport and counts outcomes of every call
pub struct MeteredTransport<T> {
    inner: T,
    metrics: TransportMetrics,
}

impl<T: Transport> MeteredTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            metrics: TransportMetrics::default(),
        }
    }

    async fn track<F>(&self, call: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let start_time = Instant::now();
        let outcome = call.await;
        self.metrics.record(outcome.is_ok(), start_time.elapsed());
        outcome
    }
}

#[async_trait]
impl<T: Transport> Transport for MeteredTransport<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn heartbeat(&self) -> Result<()> {
        self.track(self.inner.heartbeat()).await
    }

    async fn report_segments(&self, queue: &BoundedQueue<Segment>, block: bool) -> Result<()> {
        self.track(self.inner.report_segments(queue, block)).await
    }

    async fn report_logs(&self, queue: &BoundedQueue<LogEntry>, block: bool) -> Result<()> {
        self.track(self.inner.report_logs(queue, block)).await
    }

    async fn report_meters(&self, queue: &BoundedQueue<MeterData>, block: bool) -> Result<()> {
        self.track(self.inner.report_meters(queue, block)).await
    }

    async fn report_snapshots(&self, queue: &BoundedQueue<ProfileSnapshot>, block: bool) -> Result<()> {
        self.track(self.inner.report_snapshots(queue, block)).await
    }

    async fn query_profile_commands(&self) -> Result<()> {
        self.track(self.inner.query_profile_commands()).await
    }

    async fn notify_profile_task_finish(&self, task: &ProfileTask) -> Result<()> {
        self.track(self.inner.notify_profile_task_finish(task)).await
    }

    fn metrics(&self) -> Option<TransportMetricsSnapshot> {
        Some(self.metrics.snapshot())
    }
}

#[derive(Debug, Default)]
struct TransportMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_duration_us: AtomicU64,
}

impl TransportMetrics {
    fn record(&self, success: bool, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_duration_us.fetch_add(micros, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportMetricsSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let total_us = self.total_duration_us.load(Ordering::Relaxed);

        let success_rate = if attempts > 0 {
            (successes as f64 / attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration_ms = if attempts > 0 { total_us / attempts / 1000 } else { 0 };

        TransportMetricsSnapshot {
            attempts,
            successes,
            failures,
            success_rate,
            avg_duration_ms,
        }
    }
}

/// Snapshot of transport metrics
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandDispatcher, ProfileTaskExecutor, PROFILE_TASK_COMMAND};
    use crate::identity::InstanceIdentity;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport_for(server: &MockServer, factor: u64) -> (HttpTransport, Arc<CommandService>) {
        let config = Config {
            service_name: "checkout".to_string(),
            service_instance: "checkout-1".to_string(),
            collector_address: server.uri(),
            authentication: Some("s3cret".to_string()),
            instance_property_report_factor: factor,
            http_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let identity = SharedIdentity::new(InstanceIdentity::from_config(&config), factor);
        let commands = Arc::new(CommandService::new());
        let transport = HttpTransport::new(&config, identity, Arc::clone(&commands)).unwrap();
        (transport, commands)
    }

    fn segment_queue(capacity: usize) -> BoundedQueue<Segment> {
        BoundedQueue::new("segment", capacity, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn test_report_segments_posts_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/segments"))
            .and(header("Authentication", "s3cret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 10);
        let queue = segment_queue(8);
        for _ in 0..3 {
            queue.push(Segment::new("checkout".to_string(), "checkout-1".to_string())).unwrap();
        }

        transport.report_segments(&queue, true).await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.unfinished(), 0);

        let requests = server.received_requests().await.unwrap();
        let body: Vec<Value> = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body.len(), 3);
        assert_eq!(body[0]["service"], "checkout");
    }

    #[tokio::test]
    async fn test_empty_queue_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 10);
        transport.report_segments(&segment_queue(4), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_send_still_releases_queue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/logs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 10);
        let queue = BoundedQueue::new("log", 4, Duration::from_millis(10));
        queue
            .push(LogEntry::new("checkout".to_string(), "checkout-1".to_string(), "boom".to_string()))
            .unwrap();

        let err = transport.report_logs(&queue, false).await.unwrap_err();
        assert!(matches!(err, ReporterError::TransportUnavailable(_)));
        assert!(queue.wait_until_drained(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_unauthorized_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 1);
        let err = transport.heartbeat().await.unwrap_err();
        assert!(matches!(err, ReporterError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let config = Config {
            collector_address: "127.0.0.1:1".to_string(),
            http_timeout: Duration::from_secs(2),
            ..Config::default()
        };
        let identity = SharedIdentity::new(InstanceIdentity::from_config(&config), 10);
        let transport = HttpTransport::new(&config, identity, Arc::new(CommandService::new())).unwrap();

        let err = transport.heartbeat().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_props_once_per_factor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/management/reportProperties"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/management/keepAlive"))
            .respond_with(ResponseTemplate::new(200))
            .expect(10)
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 10);
        for _ in 0..10 {
            transport.heartbeat().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_first_heartbeat_registers_props() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 10);
        transport.heartbeat().await.unwrap();

        let paths: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(paths, vec!["/v3/management/reportProperties", "/v3/management/keepAlive"]);
    }

    #[tokio::test]
    async fn test_failed_props_retried_on_next_heartbeat() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/management/reportProperties"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 10);

        let err = transport.heartbeat().await.unwrap_err();
        assert!(err.is_retryable());
        transport.heartbeat().await.unwrap();

        let paths: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect();
        assert_eq!(
            paths,
            vec![
                "/v3/management/reportProperties",
                "/v3/management/keepAlive",
                "/v3/management/reportProperties",
                "/v3/management/keepAlive",
            ]
        );
    }

    #[tokio::test]
    async fn test_query_hands_commands_to_dispatcher() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/profile/getProfileTaskCommands"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "commands": [{
                    "command": PROFILE_TASK_COMMAND,
                    "serialNumber": "serial-1",
                    "args": {
                        "TaskId": "task-7",
                        "EndpointName": "/pay",
                        "Duration": "5",
                        "MinDurationThreshold": "0",
                        "DumpPeriod": "10",
                        "MaxSamplingCount": "5",
                        "StartTime": "1700000000000",
                        "CreateTime": "1700000000500"
                    }
                }]
            })))
            .mount(&server)
            .await;

        let (transport, commands) = transport_for(&server, 10);
        let executor = Arc::new(ProfileTaskExecutor::new(5));
        commands.register(PROFILE_TASK_COMMAND, executor.clone());

        transport.query_profile_commands().await.unwrap();
        commands.dispatch().await.unwrap();

        let tasks = executor.take_pending();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_id, "task-7");
        assert_eq!(transport.last_command_time.load(Ordering::Relaxed), 1_700_000_000_500);
    }

    #[tokio::test]
    async fn test_metered_transport_counts_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/management/keepAlive"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/management/reportProperties"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v3/profile/finishTask"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (transport, _) = transport_for(&server, 1_000);
        let metered = MeteredTransport::new(transport);

        let task = ProfileTask {
            task_id: "task-1".to_string(),
            first_span_op_name: "/pay".to_string(),
            duration_minutes: 1,
            min_duration_threshold: 0,
            thread_dump_period: 10,
            max_sampling_count: 5,
            start_time: 0,
            create_time: 0,
        };

        metered.heartbeat().await.unwrap();
        assert!(metered.notify_profile_task_finish(&task).await.is_err());

        let metrics = metered.metrics().unwrap();
        assert_eq!(metrics.attempts, 2);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.failures, 1);
        assert_eq!(metrics.success_rate, 50.0);
    }

    #[test]
    fn test_unsupported_protocols_are_config_errors() {
        let config = Config {
            protocol: Protocol::Kafka,
            ..Config::default()
        };
        let identity = SharedIdentity::new(InstanceIdentity::from_config(&config), 10);
        let result = build_transport(&config, identity, Arc::new(CommandService::new()));
        assert!(matches!(result, Err(ReporterError::Config(_))));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "/v3/logs", ""),
            ReporterError::TransportUnavailable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::PAYLOAD_TOO_LARGE, "/v3/logs", ""),
            ReporterError::Rejected(_)
        ));
    }
}
