//! Job manifest, the state document of a single job stored in the bucket.
pub mod layout;
pub mod store;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::Path;

pub type Timestamp = DateTime<Utc>;

/// Value stored in the manifest instead of a timestamp that was not set yet.
pub const UNSET_TIME: &str = "-";

/// Current time, truncated to the precision stored in the manifest.
pub fn now() -> Timestamp {
    Utc::now().trunc_subsecs(0)
}

pub fn format_time(time: &Timestamp) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parses an ISO-8601 timestamp. Timestamps without an offset are interpreted as UTC.
pub fn parse_time(value: &str) -> Option<Timestamp> {
    let value = value.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Some(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|time| time.and_utc())
}

/// Sets a timestamp unless it was already set before.
pub fn stamp(slot: &mut Option<Timestamp>, time: Timestamp) {
    if slot.is_none() {
        *slot = Some(time);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Init,
    Ready,
    Run,
    Deleting,
    Completing,
    Done,
    Error,
    Timeout,
    Deleted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done | JobState::Error | JobState::Timeout | JobState::Deleted
        )
    }

    /// The job was handed over to the local scheduler and has not finished yet.
    pub fn is_submitted(&self) -> bool {
        matches!(
            self,
            JobState::Ready | JobState::Run | JobState::Deleting | JobState::Completing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Init => "INIT",
            JobState::Ready => "READY",
            JobState::Run => "RUN",
            JobState::Deleting => "DELETING",
            JobState::Completing => "COMPLETING",
            JobState::Done => "DONE",
            JobState::Error => "ERROR",
            JobState::Timeout => "TIMEOUT",
            JobState::Deleted => "DELETED",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    /// Script written for a specific local scheduler.
    Local,
    /// Scheduler-agnostic script, converted to a local script before it reaches the agent.
    Meta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub uuid: String,
    pub name: String,
    #[serde(alias = "jobscript_type")]
    pub script_type: ScriptType,
    pub state: JobState,
    #[serde(default)]
    pub run_system: String,
    #[serde(default, alias = "jobid", with = "optional_string")]
    pub local_job_id: Option<String>,
    #[serde(default, alias = "hold_jid")]
    pub hold_job_id: String,
    #[serde(default, alias = "array_tid")]
    pub array_task_id: String,
    #[serde(default)]
    pub submit_to: String,
    #[serde(default)]
    pub submit_opt: String,
    #[serde(default)]
    pub submit_opt_local: String,
    #[serde(default, alias = "workdir")]
    pub work_dir: String,
    #[serde(default)]
    pub local_account: String,
    #[serde(default)]
    pub local_group: String,
    #[serde(default)]
    pub local_name: String,
    #[serde(default)]
    pub submit_command: String,

    #[serde(default, with = "timestamp")]
    pub time_submit: Option<Timestamp>,
    #[serde(default, with = "timestamp")]
    pub time_receive: Option<Timestamp>,
    #[serde(default, with = "timestamp")]
    pub time_ready: Option<Timestamp>,
    #[serde(default, with = "timestamp")]
    pub time_start: Option<Timestamp>,
    #[serde(default, with = "timestamp")]
    pub time_stageout_start: Option<Timestamp>,
    #[serde(default, with = "timestamp")]
    pub time_stageout_finish: Option<Timestamp>,
    #[serde(default, with = "timestamp")]
    pub time_finish: Option<Timestamp>,

    #[serde(default)]
    pub size_input: u64,
    #[serde(default)]
    pub size_output: u64,
    #[serde(default)]
    pub error_msg: String,

    /// Fields written by clients that the agent does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Manifest {
    pub fn new(uuid: String, name: String, script_type: ScriptType) -> Self {
        Self {
            uuid,
            name,
            script_type,
            state: JobState::Init,
            run_system: String::new(),
            local_job_id: None,
            hold_job_id: String::new(),
            array_task_id: String::new(),
            submit_to: String::new(),
            submit_opt: String::new(),
            submit_opt_local: String::new(),
            work_dir: String::new(),
            local_account: String::new(),
            local_group: String::new(),
            local_name: String::new(),
            submit_command: String::new(),
            time_submit: None,
            time_receive: None,
            time_ready: None,
            time_start: None,
            time_stageout_start: None,
            time_stageout_finish: None,
            time_finish: None,
            size_input: 0,
            size_output: 0,
            error_msg: String::new(),
            extra: Default::default(),
        }
    }

    pub fn from_json(data: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| crate::Error::DeserializationError(format!("Invalid manifest: {e}")))
    }

    pub fn to_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Dependencies that have to finish before this job can be submitted.
    pub fn hold_ids(&self) -> impl Iterator<Item = &str> {
        self.hold_job_id
            .split(',')
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
    }

    /// Returns true if the job belongs to another agent, either because the other agent has
    /// already claimed it or because a local script was explicitly targeted elsewhere.
    pub fn is_owned_by_other(&self, agent: &str) -> bool {
        let run_system = self.run_system.trim();
        if !run_system.is_empty() {
            return !run_system.eq_ignore_ascii_case(agent);
        }
        self.script_type == ScriptType::Local && !self.submit_to.trim().eq_ignore_ascii_case(agent)
    }

    pub fn work_dir(&self) -> Option<&Path> {
        if self.work_dir.is_empty() {
            None
        } else {
            Some(Path::new(&self.work_dir))
        }
    }

    /// File name of the script that is handed to the local scheduler.
    pub fn submit_script(&self) -> &str {
        if self.local_name.is_empty() {
            &self.name
        } else {
            &self.local_name
        }
    }

    pub fn is_array_job(&self) -> bool {
        !self.array_task_id.trim().is_empty()
    }

    /// Moves the job into a terminal state and records the finish time.
    pub fn finish(&mut self, state: JobState, time: Timestamp) {
        debug_assert!(state.is_terminal());
        self.state = state;
        stamp(&mut self.time_finish, time);
    }
}

mod timestamp {
    use super::{Timestamp, UNSET_TIME, format_time, parse_time};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Timestamp>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(time) => serializer.serialize_str(&format_time(time)),
            None => serializer.serialize_str(UNSET_TIME),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Timestamp>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value.as_deref().map(str::trim) {
            None | Some("") | Some(UNSET_TIME) => Ok(None),
            Some(value) => parse_time(value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp `{value}`"))),
        }
    }
}

/// An empty string in the manifest means that the value is not set.
mod optional_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        let value: Option<String> = Option::deserialize(deserializer)?;
        Ok(value.filter(|v| !v.trim().is_empty()))
    }
}
