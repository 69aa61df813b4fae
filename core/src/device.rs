//! Device control: outgoing commands, scheduled tasks and automation rules.
//!
//! Commands go out through a [`CommandSink`], normally the writer half of the
//! attached serial connection. Scheduled tasks and automation rules both end
//! in a `send_command`; a failed send leaves the task due so the next tick
//! retries it.

use crate::event::{EventBus, EventPayload};
use crate::log::PersistedLog;
use crate::storage::{load_or_default, save_or_log, KeyValueStore};
use crate::util::gen_id;
use crate::{Result, SosError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const COMMAND_HISTORY_KEY: &str = "sos.commands";
pub const TASKS_KEY: &str = "sos.tasks";
pub const RULES_KEY: &str = "sos.rules";
pub const MAX_HISTORY: usize = 100;
pub const DEFAULT_COOLDOWN_MS: i64 = 60_000;

/// Byte sink for outgoing device commands.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn write_all(&self, bytes: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Sent,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Builders for the command vocabulary understood by the stock firmware.
pub mod presets {
    pub fn relay_on(pin: u8) -> String {
        format!("RELAY_ON:{}", pin)
    }
    pub fn relay_off(pin: u8) -> String {
        format!("RELAY_OFF:{}", pin)
    }
    pub fn relay_toggle(pin: u8) -> String {
        format!("RELAY_TOGGLE:{}", pin)
    }

    pub fn led_on() -> String {
        "LED_ON".into()
    }
    pub fn led_off() -> String {
        "LED_OFF".into()
    }
    pub fn led_blink(interval_ms: u32) -> String {
        format!("LED_BLINK:{}", interval_ms)
    }

    pub fn servo_angle(angle: u16) -> String {
        format!("SERVO:{}", angle)
    }
    pub fn servo_sweep() -> String {
        "SERVO_SWEEP".into()
    }

    pub fn sensor_read(kind: &str) -> String {
        format!("READ:{}", kind)
    }
    pub fn sensor_calibrate(kind: &str) -> String {
        format!("CALIBRATE:{}", kind)
    }

    pub fn pump_on() -> String {
        "PUMP_ON".into()
    }
    pub fn pump_off() -> String {
        "PUMP_OFF".into()
    }
    pub fn pump_duration(seconds: u32) -> String {
        format!("PUMP_DURATION:{}", seconds)
    }

    pub fn system_reset() -> String {
        "RESET".into()
    }
    pub fn system_status() -> String {
        "STATUS".into()
    }
    pub fn system_info() -> String {
        "INFO".into()
    }
    pub fn system_sleep() -> String {
        "SLEEP".into()
    }
    pub fn system_wake() -> String {
        "WAKE".into()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    Once { at: DateTime<Utc> },
    Interval { interval_ms: i64 },
    /// Local wall-clock time, `HH:MM`.
    Daily { time: String },
    Hourly { minute: u32 },
}

impl Schedule {
    fn validate(&self) -> Result<()> {
        match self {
            Schedule::Once { .. } => Ok(()),
            Schedule::Interval { interval_ms } if *interval_ms > 0 => Ok(()),
            Schedule::Interval { interval_ms } => Err(SosError::InvalidInput(format!(
                "interval must be positive, got {} ms",
                interval_ms
            ))),
            Schedule::Daily { time } => parse_hh_mm(time).map(|_| ()),
            Schedule::Hourly { minute } if *minute < 60 => Ok(()),
            Schedule::Hourly { minute } => Err(SosError::InvalidInput(format!(
                "minute out of range: {}",
                minute
            ))),
        }
    }
}

fn parse_hh_mm(time: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(time.trim(), "%H:%M")
        .map_err(|_| SosError::InvalidInput(format!("expected HH:MM, got {:?}", time)))
}

/// Next run of `schedule` strictly after `now`, evaluated in `now`'s time zone.
pub fn next_run<Tz: TimeZone>(schedule: &Schedule, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
    let now_utc = now.with_timezone(&Utc);
    match schedule {
        Schedule::Once { at } => Some(*at),
        Schedule::Interval { interval_ms } => Some(now_utc + Duration::milliseconds(*interval_ms)),
        Schedule::Daily { time } => {
            let t = parse_hh_mm(time).ok()?;
            let tz = now.timezone();
            let today = tz
                .from_local_datetime(&now.date_naive().and_time(t))
                .earliest()?;
            let next = if today <= *now {
                tz.from_local_datetime(&(now.date_naive() + Duration::days(1)).and_time(t))
                    .earliest()?
            } else {
                today
            };
            Some(next.with_timezone(&Utc))
        }
        Schedule::Hourly { minute } => {
            let this_hour = now
                .with_minute(*minute)?
                .with_second(0)?
                .with_nanosecond(0)?;
            let next = if this_hour <= *now {
                this_hour + Duration::hours(1)
            } else {
                this_hour
            };
            Some(next.with_timezone(&Utc))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub command: String,
    pub schedule: Schedule,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Lt => "<",
            Comparison::Ge => ">=",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
        }
    }

    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => value > threshold,
            Comparison::Lt => value < threshold,
            Comparison::Ge => value >= threshold,
            Comparison::Le => value <= threshold,
            Comparison::Eq => value == threshold,
            Comparison::Ne => value != threshold,
        }
    }
}

impl FromStr for Comparison {
    type Err = SosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            ">" => Ok(Comparison::Gt),
            "<" => Ok(Comparison::Lt),
            ">=" => Ok(Comparison::Ge),
            "<=" => Ok(Comparison::Le),
            "==" => Ok(Comparison::Eq),
            "!=" => Ok(Comparison::Ne),
            other => Err(SosError::InvalidInput(format!("unknown operator {:?}", other))),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub sensor: String,
    pub operator: Comparison,
    pub value: f64,
}

impl Condition {
    /// `None` when the sensor is absent from `readings`.
    pub fn holds(&self, readings: &HashMap<String, f64>) -> Option<bool> {
        readings
            .get(&self.sensor)
            .map(|v| self.operator.evaluate(*v, self.value))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    pub condition: Condition,
    /// Command sent when the condition holds.
    pub action: String,
    pub cooldown_ms: i64,
    pub enabled: bool,
    pub last_triggered: Option<DateTime<Utc>>,
    pub trigger_count: u64,
    pub created_at: DateTime<Utc>,
}

impl AutomationRule {
    fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.last_triggered
            .map_or(false, |t| (now - t).num_milliseconds() < self.cooldown_ms)
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: std::env::var("SOS_SCHEDULER_TICK_MS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(60_000),
        }
    }
}

pub struct DeviceControl {
    sink: Option<Arc<dyn CommandSink>>,
    history: PersistedLog<CommandRecord>,
    tasks: Vec<ScheduledTask>,
    rules: Vec<AutomationRule>,
    store: Arc<dyn KeyValueStore>,
    bus: Option<Arc<EventBus>>,
}

impl DeviceControl {
    pub fn load(store: Arc<dyn KeyValueStore>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            sink: None,
            history: PersistedLog::load(Arc::clone(&store), COMMAND_HISTORY_KEY, MAX_HISTORY),
            tasks: load_or_default(store.as_ref(), TASKS_KEY, "device"),
            rules: load_or_default(store.as_ref(), RULES_KEY, "device"),
            store,
            bus,
        }
    }

    pub fn set_sink(&mut self, sink: Arc<dyn CommandSink>) {
        self.sink = Some(sink);
    }

    pub fn clear_sink(&mut self) {
        self.sink = None;
    }

    pub fn is_connected(&self) -> bool {
        self.sink.is_some()
    }

    /// Write one command, optionally newline-terminated. Every attempt lands
    /// in the command history.
    pub async fn send_command(&mut self, command: &str, newline: bool) -> Result<()> {
        let result = match &self.sink {
            Some(sink) => {
                let mut line = command.to_string();
                if newline {
                    line.push('\n');
                }
                sink.write_all(line.as_bytes()).await
            }
            None => Err(SosError::DeviceError("Serial port not connected".into())),
        };

        match &result {
            Ok(()) => {
                debug!(target: "device", command, "Command sent");
                self.history.push(CommandRecord {
                    command: command.to_string(),
                    timestamp: Utc::now(),
                    status: CommandStatus::Sent,
                    error: None,
                });
                if let Some(bus) = &self.bus {
                    bus.emit(
                        "device",
                        EventPayload::CommandSent {
                            command: command.to_string(),
                        },
                    )
                    .await;
                }
            }
            Err(e) => {
                error!(target: "device", command, error = %e, "Send error");
                self.history.push(CommandRecord {
                    command: command.to_string(),
                    timestamp: Utc::now(),
                    status: CommandStatus::Error,
                    error: Some(e.to_string()),
                });
            }
        }
        result
    }

    /// Send each command with `delay` between them. Stops at the first failure.
    pub async fn send_commands(&mut self, commands: &[String], delay: std::time::Duration) -> Result<()> {
        for command in commands {
            self.send_command(command, true).await?;
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Newest first.
    pub fn history(&self) -> Vec<CommandRecord> {
        self.history.log().recent(MAX_HISTORY).into_iter().cloned().collect()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn tasks(&self) -> &[ScheduledTask] {
        &self.tasks
    }

    pub fn schedule_task(
        &mut self,
        name: &str,
        command: &str,
        schedule: Schedule,
        enabled: bool,
    ) -> Result<ScheduledTask> {
        schedule.validate()?;
        let task = ScheduledTask {
            id: gen_id("task"),
            name: name.to_string(),
            command: command.to_string(),
            next_run: next_run(&schedule, &Local::now()),
            schedule,
            enabled,
            last_run: None,
            created_at: Utc::now(),
        };
        info!(target: "device", name, next_run = ?task.next_run, "Scheduled task");
        self.tasks.push(task.clone());
        self.save_tasks();
        Ok(task)
    }

    /// Run every enabled task whose `next_run` is at or before `now`.
    ///
    /// Returns the tasks that ran, after their run bookkeeping.
    pub async fn check_scheduled_tasks<Tz>(&mut self, now: DateTime<Tz>) -> Vec<ScheduledTask>
    where
        Tz: TimeZone + Send + Sync,
        Tz::Offset: Send + Sync,
    {
        let now_utc = now.with_timezone(&Utc);
        let due: Vec<usize> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.enabled && t.next_run.map_or(false, |n| n <= now_utc))
            .map(|(i, _)| i)
            .collect();

        let mut executed = Vec::new();
        for i in due {
            let command = self.tasks[i].command.clone();
            if let Err(e) = self.send_command(&command, true).await {
                warn!(target: "device", task = %self.tasks[i].name, error = %e, "Scheduled task error");
                continue;
            }

            let task = &mut self.tasks[i];
            task.last_run = Some(now_utc);
            if matches!(task.schedule, Schedule::Once { .. }) {
                task.enabled = false;
            } else {
                task.next_run = next_run(&task.schedule, &now);
            }
            executed.push(task.clone());
        }

        if !executed.is_empty() {
            self.save_tasks();
            if let Some(bus) = &self.bus {
                for task in &executed {
                    bus.emit("device", EventPayload::TaskExecuted(task.clone()))
                        .await;
                }
            }
        }
        executed
    }

    /// Flip `enabled`; re-enabling recomputes `next_run` from the current time.
    pub fn toggle_task(&mut self, id: &str) -> Option<bool> {
        let task = self.tasks.iter_mut().find(|t| t.id == id)?;
        task.enabled = !task.enabled;
        if task.enabled {
            task.next_run = next_run(&task.schedule, &Local::now());
        }
        let enabled = task.enabled;
        self.save_tasks();
        Some(enabled)
    }

    pub fn remove_task(&mut self, id: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        let removed = self.tasks.len() != before;
        if removed {
            self.save_tasks();
        }
        removed
    }

    pub fn rules(&self) -> &[AutomationRule] {
        &self.rules
    }

    pub fn add_rule(
        &mut self,
        name: &str,
        condition: Condition,
        action: &str,
        cooldown_ms: Option<i64>,
    ) -> AutomationRule {
        let rule = AutomationRule {
            id: gen_id("rule"),
            name: name.to_string(),
            condition,
            action: action.to_string(),
            cooldown_ms: cooldown_ms.unwrap_or(DEFAULT_COOLDOWN_MS),
            enabled: true,
            last_triggered: None,
            trigger_count: 0,
            created_at: Utc::now(),
        };
        self.rules.push(rule.clone());
        self.save_rules();
        rule
    }

    /// Fire every enabled rule whose condition holds for `readings` and whose
    /// cooldown has elapsed. Returns the fired rules.
    pub async fn check_automation_rules(
        &mut self,
        readings: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<AutomationRule> {
        let ready: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.enabled && !r.cooling_down(now))
            .filter(|(_, r)| r.condition.holds(readings) == Some(true))
            .map(|(i, _)| i)
            .collect();

        let mut fired = Vec::new();
        for i in ready {
            let action = self.rules[i].action.clone();
            if let Err(e) = self.send_command(&action, true).await {
                warn!(target: "device", rule = %self.rules[i].name, error = %e, "Automation error");
                continue;
            }
            let rule = &mut self.rules[i];
            rule.last_triggered = Some(now);
            rule.trigger_count += 1;
            info!(target: "device", rule = %rule.name, count = rule.trigger_count, "Automation triggered");
            fired.push(rule.clone());
        }

        if !fired.is_empty() {
            self.save_rules();
            if let Some(bus) = &self.bus {
                for rule in &fired {
                    bus.emit(
                        "device",
                        EventPayload::AutomationTriggered {
                            rule: rule.clone(),
                            readings: readings.clone(),
                        },
                    )
                    .await;
                }
            }
        }
        fired
    }

    pub fn toggle_rule(&mut self, id: &str) -> Option<bool> {
        let rule = self.rules.iter_mut().find(|r| r.id == id)?;
        rule.enabled = !rule.enabled;
        let enabled = rule.enabled;
        self.save_rules();
        Some(enabled)
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        let removed = self.rules.len() != before;
        if removed {
            self.save_rules();
        }
        removed
    }

    fn save_tasks(&self) {
        save_or_log(self.store.as_ref(), TASKS_KEY, &self.tasks, "device");
    }

    fn save_rules(&self) {
        save_or_log(self.store.as_ref(), RULES_KEY, &self.rules, "device");
    }
}

/// Check scheduled tasks once immediately and then every tick, until the
/// returned handle is aborted.
pub fn spawn_scheduler(device: Arc<Mutex<DeviceControl>>, cfg: SchedulerConfig) -> JoinHandle<()> {
    info!(target: "device", tick_ms = cfg.tick_ms, "Starting scheduler");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(cfg.tick_ms));
        loop {
            interval.tick().await;
            let ran = device.lock().await.check_scheduled_tasks(Local::now()).await;
            if !ran.is_empty() {
                debug!(target: "device", count = ran.len(), "Scheduled tasks ran");
            }
        }
    })
}
