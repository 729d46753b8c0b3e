//! Operator commands received from the collector

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Command name the collector uses to hand out profiling tasks
pub const PROFILE_TASK_COMMAND: &str = "ProfileTaskQuery";

const COMMAND_QUEUE_SIZE: usize = 64;
const SERIAL_CACHE_SIZE: usize = 64;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub command: String,
    pub serial_number: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTask {
    pub task_id: String,
    pub first_span_op_name: String,
    pub duration_minutes: u32,
    pub min_duration_threshold: u32,
    pub thread_dump_period: u32,
    pub max_sampling_count: u32,
    pub start_time: i64,
    pub create_time: i64,
}

impl TryFrom<&Command> for ProfileTask {
    type Error = String;

    fn try_from(command: &Command) -> std::result::Result<Self, Self::Error> {
        fn arg<T: std::str::FromStr>(command: &Command, key: &str) -> std::result::Result<T, String> {
            let raw = command
                .args
                .get(key)
                .ok_or_else(|| format!("missing argument '{}'", key))?;
            raw.parse()
                .map_err(|_| format!("invalid argument '{}': {}", key, raw))
        }

        Ok(Self {
            task_id: arg(command, "TaskId")?,
            first_span_op_name: arg(command, "EndpointName")?,
            duration_minutes: arg(command, "Duration")?,
            min_duration_threshold: arg(command, "MinDurationThreshold")?,
            thread_dump_period: arg(command, "DumpPeriod")?,
            max_sampling_count: arg(command, "MaxSamplingCount")?,
            start_time: arg(command, "StartTime")?,
            create_time: arg(command, "CreateTime")?,
        })
    }
}

/// Applies one kind of command
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, command: &Command) -> std::result::Result<(), String>;
}

/// Blocking consumer of received commands
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Return once a command has been received and applied.
    async fn dispatch(&self) -> Result<()>;
}

/// Buffers commands handed over by the transport and applies them in order
pub struct CommandService {
    tx: mpsc::Sender<Command>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Command>>,
    executors: RwLock<HashMap<String, Arc<dyn CommandExecutor>>>,
    seen_serials: Mutex<VecDeque<String>>,
}

impl Default for CommandService {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandService {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            executors: RwLock::new(HashMap::new()),
            seen_serials: Mutex::new(VecDeque::with_capacity(SERIAL_CACHE_SIZE)),
        }
    }

    pub fn register(&self, command: &str, executor: Arc<dyn CommandExecutor>) {
        self.executors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.to_string(), executor);
    }

    /// Hand over commands fetched from the collector. Never blocks.
    pub fn receive(&self, commands: Vec<Command>) {
        for command in commands {
            if let Err(e) = self.tx.try_send(command) {
                warn!("command queue is full, dropping command: {}", e);
            }
        }
    }

    /// Remember `serial`; false if it was already seen.
    fn first_sighting(&self, serial: &str) -> bool {
        let mut seen = self.seen_serials.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.iter().any(|s| s == serial) {
            return false;
        }
        if seen.len() >= SERIAL_CACHE_SIZE {
            seen.pop_front();
        }
        seen.push_back(serial.to_string());
        true
    }

    fn apply(&self, command: &Command) {
        if !self.first_sighting(&command.serial_number) {
            debug!(serial = %command.serial_number, "command already executed, skipping");
            return;
        }

        let executor = self
            .executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&command.command)
            .cloned();

        match executor {
            Some(executor) => match executor.execute(command) {
                Ok(()) => info!(command = %command.command, serial = %command.serial_number, "command executed"),
                Err(e) => warn!(command = %command.command, "command execution failed: {}", e),
            },
            None => warn!(command = %command.command, "no executor registered for command, ignoring"),
        }
    }
}

#[async_trait]
impl CommandDispatcher for CommandService {
    async fn dispatch(&self) -> Result<()> {
        let command = self.rx.lock().await.recv().await;
        if let Some(command) = command {
            self.apply(&command);
        }
        Ok(())
    }
}

/// Accepts profiling tasks for the profiler to pick up
#[derive(Debug)]
pub struct ProfileTaskExecutor {
    pending: Mutex<Vec<ProfileTask>>,
    max_parallel: usize,
}

impl ProfileTaskExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            max_parallel,
        }
    }

    /// Hand all accepted tasks to the caller.
    pub fn take_pending(&self) -> Vec<ProfileTask> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl CommandExecutor for ProfileTaskExecutor {
    fn execute(&self, command: &Command) -> std::result::Result<(), String> {
        let task = ProfileTask::try_from(command)?;
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);

        if pending.iter().any(|t| t.task_id == task.task_id) {
            return Ok(());
        }
        if pending.len() >= self.max_parallel {
            return Err(format!(
                "profile task {} rejected, {} tasks already pending",
                task.task_id,
                pending.len()
            ));
        }

        pending.push(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_command(serial: &str, task_id: &str) -> Command {
        let args = [
            ("TaskId", task_id),
            ("EndpointName", "/checkout"),
            ("Duration", "5"),
            ("MinDurationThreshold", "100"),
            ("DumpPeriod", "10"),
            ("MaxSamplingCount", "5"),
            ("StartTime", "1700000000000"),
            ("CreateTime", "1699999999000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Command {
            command: PROFILE_TASK_COMMAND.to_string(),
            serial_number: serial.to_string(),
            args,
        }
    }

    #[test]
    fn test_profile_task_from_command() {
        let task = ProfileTask::try_from(&profile_command("s-1", "task-1")).unwrap();
        assert_eq!(task.task_id, "task-1");
        assert_eq!(task.first_span_op_name, "/checkout");
        assert_eq!(task.thread_dump_period, 10);
        assert_eq!(task.start_time, 1_700_000_000_000);

        let mut broken = profile_command("s-2", "task-2");
        broken.args.insert("Duration".to_string(), "soon".to_string());
        assert!(ProfileTask::try_from(&broken).unwrap_err().contains("Duration"));
    }

    #[tokio::test]
    async fn test_dispatch_applies_each_serial_once() {
        let service = CommandService::new();
        let executor = Arc::new(ProfileTaskExecutor::new(5));
        service.register(PROFILE_TASK_COMMAND, executor.clone());

        service.receive(vec![
            profile_command("s-1", "task-1"),
            profile_command("s-1", "task-1"),
            profile_command("s-2", "task-2"),
        ]);

        for _ in 0..3 {
            service.dispatch().await.unwrap();
        }

        let tasks = executor.take_pending();
        let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["task-1", "task-2"]);
        assert!(executor.take_pending().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_is_ignored() {
        let service = CommandService::new();
        service.receive(vec![Command {
            command: "ConfigurationDiscoveryCommand".to_string(),
            serial_number: "s-9".to_string(),
            args: HashMap::new(),
        }]);

        tokio_test::assert_ok!(service.dispatch().await);
    }

    #[test]
    fn test_profile_executor_caps_parallel_tasks() {
        let executor = ProfileTaskExecutor::new(1);

        assert!(executor.execute(&profile_command("s-1", "task-1")).is_ok());
        assert!(executor.execute(&profile_command("s-2", "task-2")).is_err());
        assert_eq!(executor.take_pending().len(), 1);
    }
}
