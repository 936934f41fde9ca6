//! Bookkeeping of the executions the Maker is waiting for.
//!
//! The job log is an append-only JSON array written by the server
//! embedded in the launcher; each entry marks one command line as
//! done. This registry maps command lines to their derived state.

use serde_json::Value;
use strum_macros::{Display, EnumString};

use crate::job::LogEntry;

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("the job {0:?} is already registered")]
    JobAlreadyExisting(String),

    #[error("no job named {0:?}")]
    JobNotFound(String),

    #[error("a log entry does not carry the job's state")]
    JobStateNotFound,

    #[error("unknown job state {0:?}")]
    UnknownJobState(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Succeed,
    Failed,
}

impl JobState {
    pub fn parse(label: &str) -> Result<Self, JobError> {
        label
            .parse()
            .map_err(|_| JobError::UnknownJobState(label.to_owned()))
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Succeed | JobState::Failed)
    }
}

/// Decode one raw log-array element, checking the fields the Maker
/// relies on.
pub fn log_entry_from_value(value: &Value) -> Result<LogEntry, JobError> {
    let exec = value
        .get("exec")
        .and_then(Value::as_str)
        .ok_or(JobError::JobStateNotFound)?;
    let success = value
        .get("success")
        .ok_or(JobError::JobStateNotFound)?
        .as_bool()
        .ok_or_else(|| JobError::UnknownJobState(value["success"].to_string()))?;
    let text = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    Ok(LogEntry {
        exec: exec.to_owned(),
        stdout: text("stdout"),
        stderr: text("stderr"),
        success,
    })
}

#[derive(Debug, Default)]
pub struct JobsManager {
    // Insertion order matters for progress display.
    jobs: Vec<(String, JobState)>,
}

impl JobsManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>) -> Result<(), JobError> {
        let name = name.into();
        if self.jobs.iter().any(|(n, _)| *n == name) {
            return Err(JobError::JobAlreadyExisting(name));
        }
        self.jobs.push((name, JobState::Waiting));
        Ok(())
    }

    pub fn add_all<S: Into<String>>(
        &mut self,
        names: impl IntoIterator<Item = S>,
    ) -> Result<(), JobError> {
        for name in names {
            self.add(name)?;
        }
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), JobError> {
        let position = self
            .jobs
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| JobError::JobNotFound(name.to_owned()))?;
        self.jobs.remove(position);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn set_job_state(&mut self, name: &str, state: JobState) -> Result<(), JobError> {
        let job = self
            .jobs
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| JobError::JobNotFound(name.to_owned()))?;
        job.1 = state;
        Ok(())
    }

    pub fn jobs_with_states(&self, states: &[JobState]) -> Vec<&str> {
        self.jobs
            .iter()
            .filter(|(_, s)| states.contains(s))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    pub fn finished_count(&self) -> usize {
        self.jobs.iter().filter(|(_, s)| s.is_finished()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|(_, s)| *s == JobState::Failed)
            .count()
    }

    /// Apply a raw log array: every decoded entry marks its command
    /// line as succeeded or failed. Entries for unregistered command
    /// lines are ignored.
    pub fn update_from_log(&mut self, log: &[Value]) -> Result<(), JobError> {
        for value in log {
            let entry = log_entry_from_value(value)?;
            let state = if entry.success {
                JobState::Succeed
            } else {
                JobState::Failed
            };
            if let Some(job) = self.jobs.iter_mut().find(|(n, _)| *n == entry.exec) {
                job.1 = state;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn t_add_and_duplicates() {
        let mut jobs = JobsManager::new();
        jobs.add_all(["a", "b"]).unwrap();
        assert!(matches!(
            jobs.add("a"),
            Err(JobError::JobAlreadyExisting(_))
        ));
        assert_eq!(jobs.len(), 2);
        assert!(matches!(jobs.delete("z"), Err(JobError::JobNotFound(_))));
        jobs.delete("a").unwrap();
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn t_update_from_log() {
        let mut jobs = JobsManager::new();
        jobs.add_all(["./run --n 1", "./run --n 2"]).unwrap();

        let log = vec![json!({
            "exec": "./run --n 2",
            "stdout": "", "stderr": "boom", "success": false
        })];
        jobs.update_from_log(&log).unwrap();
        assert_eq!(jobs.finished_count(), 1);
        assert_eq!(jobs.failed_count(), 1);
        assert_eq!(jobs.jobs_with_states(&[JobState::Waiting]), ["./run --n 1"]);

        // a second pass with the full log finishes everything
        let log = vec![
            json!({"exec": "./run --n 2", "stdout": "", "stderr": "", "success": false}),
            json!({"exec": "./run --n 1", "stdout": "ok", "stderr": "", "success": true}),
        ];
        jobs.update_from_log(&log).unwrap();
        assert_eq!(jobs.finished_count(), 2);
    }

    #[test]
    fn t_malformed_log_entries() {
        assert!(matches!(
            log_entry_from_value(&json!({"stdout": "x"})),
            Err(JobError::JobStateNotFound)
        ));
        assert!(matches!(
            log_entry_from_value(&json!({"exec": "x", "success": "yes"})),
            Err(JobError::UnknownJobState(_))
        ));
    }

    #[test]
    fn t_state_labels() {
        assert_eq!(JobState::parse("succeed").unwrap(), JobState::Succeed);
        assert!(matches!(
            JobState::parse("finished"),
            Err(JobError::UnknownJobState(_))
        ));
        assert_eq!(JobState::Failed.to_string(), "failed");
    }
}
