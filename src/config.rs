//! Configuration for the reporting core

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Wire protocol used to reach the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Grpc,
    Http,
    Kafka,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Grpc => write!(f, "grpc"),
            Protocol::Http => write!(f, "http"),
            Protocol::Kafka => write!(f, "kafka"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "grpc" => Ok(Protocol::Grpc),
            "http" => Ok(Protocol::Http),
            "kafka" => Ok(Protocol::Kafka),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of the instrumented service
    pub service_name: String,

    /// Name of this service instance
    pub service_instance: String,

    /// Optional namespace reported with instance properties
    pub namespace: String,

    /// Collector address, `host:port` or a full URL
    pub collector_address: String,

    /// Wire protocol
    pub protocol: Protocol,

    /// Token sent to the collector to authenticate the agent
    pub authentication: Option<String>,

    /// Use TLS when the collector address carries no scheme
    pub force_tls: bool,

    /// Interval between heartbeats
    pub heartbeat_period: Duration,

    /// Instance properties are re-sent every `factor` heartbeats
    pub instance_property_report_factor: u64,

    /// How long a blocking drain waits for the first record
    pub queue_timeout: Duration,

    /// Segment queue capacity
    pub max_buffer_size: usize,

    pub log_reporter_active: bool,
    pub log_reporter_max_buffer_size: usize,

    pub meter_reporter_active: bool,
    pub meter_reporter_max_buffer_size: usize,
    pub meter_reporter_period: Duration,

    pub profiler_active: bool,
    pub get_profile_task_interval: Duration,
    /// Upper bound on profile tasks held for the profiler at once
    pub profile_max_parallel: usize,
    pub profile_snapshot_transport_buffer_size: usize,

    /// Rename the instance after a fork so parent and child report separately
    pub experimental_fork_support: bool,

    /// Upper bound of the retry interval for every reporting duty
    pub backoff_ceiling: Duration,

    /// Upper bound on each queue drain and on task joins during shutdown
    pub drain_timeout: Duration,

    /// HTTP timeout for collector requests
    pub http_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "Rust Service Name".to_string(),
            service_instance: uuid::Uuid::new_v4().simple().to_string(),
            namespace: String::new(),
            collector_address: "127.0.0.1:12800".to_string(),
            protocol: Protocol::Http,
            authentication: None,
            force_tls: false,
            heartbeat_period: Duration::from_secs(30),
            instance_property_report_factor: 10,
            queue_timeout: Duration::from_secs(1),
            max_buffer_size: 10000,
            log_reporter_active: true,
            log_reporter_max_buffer_size: 10000,
            meter_reporter_active: true,
            meter_reporter_max_buffer_size: 10000,
            meter_reporter_period: Duration::from_secs(20),
            profiler_active: true,
            get_profile_task_interval: Duration::from_secs(20),
            profile_max_parallel: 5,
            profile_snapshot_transport_buffer_size: 50,
            experimental_fork_support: false,
            backoff_ceiling: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.service_name.is_empty() {
            return Err("service_name cannot be empty".to_string());
        }

        if self.service_instance.is_empty() {
            return Err("service_instance cannot be empty".to_string());
        }

        if self.collector_address.is_empty() {
            return Err("collector_address cannot be empty".to_string());
        }

        if self.instance_property_report_factor == 0 {
            return Err("instance_property_report_factor must be greater than 0".to_string());
        }

        if self.max_buffer_size == 0 {
            return Err("max_buffer_size must be greater than 0".to_string());
        }

        if self.log_reporter_active && self.log_reporter_max_buffer_size == 0 {
            return Err("log_reporter_max_buffer_size must be greater than 0".to_string());
        }

        if self.meter_reporter_active && self.meter_reporter_max_buffer_size == 0 {
            return Err("meter_reporter_max_buffer_size must be greater than 0".to_string());
        }

        if self.profiler_active && self.profile_snapshot_transport_buffer_size == 0 {
            return Err("profile_snapshot_transport_buffer_size must be greater than 0".to_string());
        }

        if self.heartbeat_period.is_zero() {
            return Err("heartbeat_period must be greater than 0".to_string());
        }

        if self.profiler_active && self.get_profile_task_interval.is_zero() {
            return Err("get_profile_task_interval must be greater than 0".to_string());
        }

        if self.backoff_ceiling.is_zero() {
            return Err("backoff_ceiling must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Base URL of the collector's HTTP endpoint
    pub fn collector_url(&self) -> String {
        let address = self.collector_address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else if self.force_tls {
            format!("https://{}", address)
        } else {
            format!("http://{}", address)
        }
    }
}
