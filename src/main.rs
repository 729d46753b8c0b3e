//! APM Telemetry Reporter Binary
//!
//! Runs a reporter against the configured collector until interrupted, then
//! drains the queues and exits.

use apm_reporter::{Config, Protocol, ReporterSupervisor, Result};
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "apm-reporter", version, about = "Ships buffered APM telemetry to a collector")]
struct Args {
    #[arg(long, env = "SW_AGENT_SERVICE_NAME", default_value = "Rust Service Name")]
    service_name: String,

    #[arg(long, env = "SW_AGENT_SERVICE_INSTANCE")]
    service_instance: Option<String>,

    #[arg(long, env = "SW_AGENT_NAMESPACE", default_value = "")]
    namespace: String,

    #[arg(long, env = "SW_AGENT_COLLECTOR_ADDRESS", default_value = "127.0.0.1:12800")]
    collector_address: String,

    #[arg(long, env = "SW_AGENT_PROTOCOL", default_value = "http")]
    protocol: Protocol,

    #[arg(long, env = "SW_AGENT_AUTHENTICATION")]
    authentication: Option<String>,

    #[arg(long, env = "SW_AGENT_FORCE_TLS")]
    force_tls: bool,

    #[arg(long, env = "SW_AGENT_HEARTBEAT_PERIOD", default_value_t = 30)]
    heartbeat_period_seconds: u64,

    #[arg(long, env = "SW_AGENT_SERVICE_INSTANCE_PROPERTY_REPORT_FACTOR", default_value_t = 10)]
    instance_property_report_factor: u64,

    #[arg(long, env = "SW_AGENT_QUEUE_TIMEOUT", default_value_t = 1)]
    queue_timeout_seconds: u64,

    #[arg(long, env = "SW_AGENT_MAX_BUFFER_SIZE", default_value_t = 10000)]
    max_buffer_size: usize,

    #[arg(long, env = "SW_AGENT_LOG_REPORTER_ACTIVE", default_value_t = true, action = clap::ArgAction::Set)]
    log_reporter_active: bool,

    #[arg(long, env = "SW_AGENT_LOG_REPORTER_MAX_BUFFER_SIZE", default_value_t = 10000)]
    log_reporter_max_buffer_size: usize,

    #[arg(long, env = "SW_AGENT_METER_REPORTER_ACTIVE", default_value_t = true, action = clap::ArgAction::Set)]
    meter_reporter_active: bool,

    #[arg(long, env = "SW_AGENT_METER_REPORTER_MAX_BUFFER_SIZE", default_value_t = 10000)]
    meter_reporter_max_buffer_size: usize,

    #[arg(long, env = "SW_AGENT_METER_REPORTER_PERIOD", default_value_t = 20)]
    meter_reporter_period_seconds: u64,

    #[arg(long, env = "SW_AGENT_PROFILER_ACTIVE", default_value_t = true, action = clap::ArgAction::Set)]
    profiler_active: bool,

    #[arg(long, env = "SW_AGENT_GET_PROFILE_TASK_INTERVAL", default_value_t = 20)]
    get_profile_task_interval_seconds: u64,

    #[arg(long, env = "SW_AGENT_PROFILE_MAX_PARALLEL", default_value_t = 5)]
    profile_max_parallel: usize,

    #[arg(long, env = "SW_AGENT_PROFILE_SNAPSHOT_TRANSPORT_BUFFER_SIZE", default_value_t = 50)]
    profile_snapshot_transport_buffer_size: usize,

    #[arg(long, env = "SW_AGENT_EXPERIMENTAL_FORK_SUPPORT")]
    experimental_fork_support: bool,

    #[arg(long, env = "SW_AGENT_DRAIN_TIMEOUT", default_value_t = 10)]
    drain_timeout_seconds: u64,
}

impl Args {
    fn into_config(self) -> Config {
        let defaults = Config::default();

        Config {
            service_name: self.service_name,
            service_instance: self.service_instance.unwrap_or(defaults.service_instance),
            namespace: self.namespace,
            collector_address: self.collector_address,
            protocol: self.protocol,
            authentication: self.authentication,
            force_tls: self.force_tls,
            heartbeat_period: Duration::from_secs(self.heartbeat_period_seconds),
            instance_property_report_factor: self.instance_property_report_factor,
            queue_timeout: Duration::from_secs(self.queue_timeout_seconds),
            max_buffer_size: self.max_buffer_size,
            log_reporter_active: self.log_reporter_active,
            log_reporter_max_buffer_size: self.log_reporter_max_buffer_size,
            meter_reporter_active: self.meter_reporter_active,
            meter_reporter_max_buffer_size: self.meter_reporter_max_buffer_size,
            meter_reporter_period: Duration::from_secs(self.meter_reporter_period_seconds),
            profiler_active: self.profiler_active,
            get_profile_task_interval: Duration::from_secs(self.get_profile_task_interval_seconds),
            profile_max_parallel: self.profile_max_parallel,
            profile_snapshot_transport_buffer_size: self.profile_snapshot_transport_buffer_size,
            experimental_fork_support: self.experimental_fork_support,
            drain_timeout: Duration::from_secs(self.drain_timeout_seconds),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    info!("Starting APM telemetry reporter v{}", env!("CARGO_PKG_VERSION"));

    let config = Args::parse().into_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Reporter configuration - Service: {}, Instance: {}, Collector: {}, Protocol: {}",
        config.service_name, config.service_instance, config.collector_address, config.protocol
    );

    let reporter = ReporterSupervisor::from_config(config)?;
    reporter.start()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }

    info!("Shutting down reporter");
    reporter.stop().await;
    Ok(())
}

/// Initialize structured logging
fn initialize_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
