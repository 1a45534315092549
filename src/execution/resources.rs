//! Cluster Resource Requests
//!
//! Typed description of what a batch job asks the scheduler for, rendered
//! as `sbatch` command-line flags.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Memory amount in megabytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Megabytes(pub u64);

impl Megabytes {
    pub fn from_gb(gb: u64) -> Self {
        Self(gb * 1024)
    }
}

impl fmt::Display for Megabytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}M", self.0)
    }
}

/// Memory request scope.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "scope", content = "amount", rename_all = "snake_case")]
pub enum Memory {
    /// `--mem`
    PerNode(Megabytes),
    /// `--mem-per-cpu`
    PerCpu(Megabytes),
}

impl Memory {
    fn flag(&self) -> &'static str {
        match self {
            Self::PerNode(_) => "mem",
            Self::PerCpu(_) => "mem-per-cpu",
        }
    }

    fn amount(&self) -> Megabytes {
        match self {
            Self::PerNode(amount) | Self::PerCpu(amount) => *amount,
        }
    }
}

/// Wall-clock limit, rendered as `D-HH:MM:SS`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WallTime {
    days: u16,
    hours: u8,
    minutes: u8,
    seconds: u8,
}

impl WallTime {
    /// Returns `None` when hours, minutes or seconds are out of range.
    pub fn new(days: u16, hours: u8, minutes: u8, seconds: u8) -> Option<Self> {
        if hours < 24 && minutes < 60 && seconds < 60 {
            Some(Self {
                days,
                hours,
                minutes,
                seconds,
            })
        } else {
            None
        }
    }

    pub fn from_hours(hours: u32) -> Self {
        Self {
            days: (hours / 24).min(u16::MAX as u32) as u16,
            hours: (hours % 24) as u8,
            minutes: 0,
            seconds: 0,
        }
    }

    pub fn from_days(days: u16) -> Self {
        Self {
            days,
            ..Self::default()
        }
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}:{:02}:{:02}",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// Events the scheduler sends mail for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MailType {
    None,
    All,
    Begin,
    End,
    Fail,
    Requeue,
    TimeLimit,
}

impl fmt::Display for MailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = match self {
            Self::None => "NONE",
            Self::All => "ALL",
            Self::Begin => "BEGIN",
            Self::End => "END",
            Self::Fail => "FAIL",
            Self::Requeue => "REQUEUE",
            Self::TimeLimit => "TIME_LIMIT",
        };
        write!(f, "{}", flag)
    }
}

/// Resources requested for one batch job. Unset fields are left to the
/// scheduler's defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ResourceRequest {
    pub cpus: Option<u64>,
    pub memory: Option<Memory>,
    pub gpus: Option<u64>,
    pub tasks: Option<u64>,
    pub nodes: Option<u64>,
    pub partition: Option<String>,
    pub time: Option<WallTime>,
    pub account: Option<String>,
    pub mail_user: Option<String>,
    pub mail_types: Vec<MailType>,
    /// Extra `--flag=value` pairs passed through verbatim
    pub extra: Vec<(String, String)>,
}

impl ResourceRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cpus(mut self, cpus: u64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_gpus(mut self, gpus: u64) -> Self {
        self.gpus = Some(gpus);
        self
    }

    pub fn with_tasks(mut self, tasks: u64) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn with_nodes(mut self, nodes: u64) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_time(mut self, time: WallTime) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_mail(mut self, user: impl Into<String>, types: &[MailType]) -> Self {
        self.mail_user = Some(user.into());
        self.mail_types = types.to_vec();
        self
    }

    pub fn with_option(mut self, flag: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((flag.into(), value.into()));
        self
    }

    /// Renders the request as `--flag=value` arguments, in a stable order.
    pub fn to_sbatch_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut push = |flag: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(format!("--{}={}", flag, value));
            }
        };

        push("cpus-per-task", self.cpus.map(|v| v.to_string()));
        push("gpus", self.gpus.map(|v| v.to_string()));
        if let Some(memory) = self.memory {
            push(memory.flag(), Some(memory.amount().to_string()));
        }
        push("ntasks", self.tasks.map(|v| v.to_string()));
        push("nodes", self.nodes.map(|v| v.to_string()));
        push("partition", self.partition.clone());
        push("time", self.time.map(|t| t.to_string()));
        push("account", self.account.clone());
        push("mail-user", self.mail_user.clone());
        if !self.mail_types.is_empty() {
            let types: Vec<String> = self.mail_types.iter().map(|t| t.to_string()).collect();
            push("mail-type", Some(types.join(",")));
        }
        for (flag, value) in &self.extra {
            push(flag.trim_start_matches('-'), Some(value.clone()));
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_time_display() {
        assert_eq!(WallTime::new(1, 2, 3, 4).unwrap().to_string(), "1-02:03:04");
        assert_eq!(WallTime::from_hours(30).to_string(), "1-06:00:00");
        assert_eq!(WallTime::from_days(2).to_string(), "2-00:00:00");
    }

    #[test]
    fn test_wall_time_rejects_out_of_range() {
        assert!(WallTime::new(0, 24, 0, 0).is_none());
        assert!(WallTime::new(0, 0, 60, 0).is_none());
        assert!(WallTime::new(0, 0, 0, 60).is_none());
    }

    #[test]
    fn test_empty_request_has_no_args() {
        assert!(ResourceRequest::new().to_sbatch_args().is_empty());
    }

    #[test]
    fn test_sbatch_args() {
        let request = ResourceRequest::new()
            .with_cpus(8)
            .with_memory(Memory::PerCpu(Megabytes::from_gb(2)))
            .with_partition("short")
            .with_time(WallTime::from_hours(4))
            .with_mail("me@example.org", &[MailType::End, MailType::Fail])
            .with_option("--qos", "high");

        assert_eq!(
            request.to_sbatch_args(),
            vec![
                "--cpus-per-task=8",
                "--mem-per-cpu=2048M",
                "--partition=short",
                "--time=0-04:00:00",
                "--mail-user=me@example.org",
                "--mail-type=END,FAIL",
                "--qos=high",
            ]
        );
    }

    #[test]
    fn test_memory_per_node_flag() {
        let request = ResourceRequest::new().with_memory(Memory::PerNode(Megabytes(512)));
        assert_eq!(request.to_sbatch_args(), vec!["--mem=512M"]);
    }

    #[test]
    fn test_request_deserialize() {
        let request: ResourceRequest = serde_json::from_str(
            r#"{"cpus": 4, "memory": {"scope": "per_node", "amount": 1024}, "mail_types": ["TIME_LIMIT"]}"#,
        )
        .unwrap();

        assert_eq!(request.cpus, Some(4));
        assert_eq!(request.memory, Some(Memory::PerNode(Megabytes(1024))));
        assert_eq!(request.mail_types, vec![MailType::TimeLimit]);
    }
}
