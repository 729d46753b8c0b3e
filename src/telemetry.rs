//! Telemetry records handed to the reporter by instrumentation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which queue a record belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Segment,
    Log,
    Meter,
    Snapshot,
}

impl RecordKind {
    pub fn queue_name(&self) -> &'static str {
        match self {
            RecordKind::Segment => "segment",
            RecordKind::Log => "log",
            RecordKind::Meter => "meter",
            RecordKind::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.queue_name())
    }
}

/// A finished trace segment
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub trace_id: String,
    pub trace_segment_id: String,
    pub service: String,
    pub service_instance: String,
    pub spans: Vec<Span>,
    pub is_size_limited: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub span_id: i32,
    pub parent_span_id: i32,
    pub operation_name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub is_error: bool,
    pub tags: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: i64,
    pub service: String,
    pub service_instance: String,
    pub endpoint: Option<String>,
    pub body: String,
    pub trace_id: Option<String>,
    pub trace_segment_id: Option<String>,
    pub span_id: Option<i32>,
    pub tags: HashMap<String, String>,
}

/// One meter sample
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeterData {
    pub timestamp: i64,
    pub service: String,
    pub service_instance: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub value: MeterValue,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum MeterValue {
    SingleValue(f64),
    Histogram(Vec<Bucket>),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub bucket: f64,
    pub count: u64,
}

/// Thread dump taken by the profiler while a traced segment was running
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub task_id: String,
    pub trace_segment_id: String,
    pub time: i64,
    pub sequence: u32,
    pub stack: Vec<String>,
}

/// Any record the reporter can buffer
#[derive(Clone, Debug, PartialEq)]
pub enum TelemetryRecord {
    Segment(Segment),
    Log(LogEntry),
    Meter(MeterData),
    Snapshot(ProfileSnapshot),
}

impl TelemetryRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            TelemetryRecord::Segment(_) => RecordKind::Segment,
            TelemetryRecord::Log(_) => RecordKind::Log,
            TelemetryRecord::Meter(_) => RecordKind::Meter,
            TelemetryRecord::Snapshot(_) => RecordKind::Snapshot,
        }
    }
}

impl From<Segment> for TelemetryRecord {
    fn from(segment: Segment) -> Self {
        TelemetryRecord::Segment(segment)
    }
}

impl From<LogEntry> for TelemetryRecord {
    fn from(log: LogEntry) -> Self {
        TelemetryRecord::Log(log)
    }
}

impl From<MeterData> for TelemetryRecord {
    fn from(meter: MeterData) -> Self {
        TelemetryRecord::Meter(meter)
    }
}

impl From<ProfileSnapshot> for TelemetryRecord {
    fn from(snapshot: ProfileSnapshot) -> Self {
        TelemetryRecord::Snapshot(snapshot)
    }
}

impl Segment {
    pub fn new(service: String, service_instance: String) -> Self {
        Self {
            trace_id: generate_trace_id(),
            trace_segment_id: generate_segment_id(),
            service,
            service_instance,
            spans: Vec::new(),
            is_size_limited: false,
        }
    }

    pub fn with_trace_id(mut self, trace_id: String) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.spans.push(span);
        self
    }
}

impl Span {
    pub fn new(span_id: i32, operation_name: String) -> Self {
        let now = current_timestamp_millis();
        Self {
            span_id,
            parent_span_id: -1,
            operation_name,
            start_time: now,
            end_time: now,
            is_error: false,
            tags: HashMap::new(),
        }
    }

    pub fn with_parent(mut self, parent_span_id: i32) -> Self {
        self.parent_span_id = parent_span_id;
        self
    }

    pub fn with_tag(mut self, key: String, value: String) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn finish(mut self) -> Self {
        self.end_time = current_timestamp_millis();
        self
    }
}

impl LogEntry {
    pub fn new(service: String, service_instance: String, body: String) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            service,
            service_instance,
            endpoint: None,
            body,
            trace_id: None,
            trace_segment_id: None,
            span_id: None,
            tags: HashMap::new(),
        }
    }

    pub fn with_trace_context(mut self, trace_id: String, trace_segment_id: String, span_id: i32) -> Self {
        self.trace_id = Some(trace_id);
        self.trace_segment_id = Some(trace_segment_id);
        self.span_id = Some(span_id);
        self
    }

    pub fn with_tag(mut self, key: String, value: String) -> Self {
        self.tags.insert(key, value);
        self
    }
}

impl MeterData {
    pub fn single(service: String, service_instance: String, name: String, value: f64) -> Self {
        Self {
            timestamp: current_timestamp_millis(),
            service,
            service_instance,
            name,
            labels: HashMap::new(),
            value: MeterValue::SingleValue(value),
        }
    }

    pub fn with_label(mut self, key: String, value: String) -> Self {
        self.labels.insert(key, value);
        self
    }
}

/// Generate a new trace ID
pub fn generate_trace_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Generate a new segment ID
pub fn generate_segment_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Milliseconds since the Unix epoch
pub fn current_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
