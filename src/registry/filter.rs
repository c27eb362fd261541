use serde::Deserialize;

use crate::job::{IndexRecord, JobStatus};

/// Selection over index records. Empty criteria match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexFilter {
    pub statuses: Vec<JobStatus>,
    pub backend: Option<String>,
    pub application: Option<String>,
    /// Substring of the job name.
    pub name: Option<String>,
}

impl IndexFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Jobs a monitoring cycle looks at.
    pub fn monitored() -> Self {
        Self {
            statuses: JobStatus::ALL
                .iter()
                .copied()
                .filter(|s| s.is_monitored())
                .collect(),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &IndexRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if let Some(backend) = &self.backend {
            if &record.backend != backend {
                return false;
            }
        }
        if let Some(application) = &self.application {
            if &record.application != application {
                return false;
            }
        }
        match &self.name {
            Some(name) => record.name.contains(name.as_str()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Fqid;
    use chrono::Utc;

    fn record(status: JobStatus, backend: &str, name: &str) -> IndexRecord {
        IndexRecord {
            fqid: Fqid::master(1),
            status,
            name: name.to_string(),
            application: "executable".to_string(),
            backend: backend.to_string(),
            subjobs: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_filter_matches_all() {
        assert!(IndexFilter::new().matches(&record(JobStatus::New, "local", "a")));
    }

    #[test]
    fn criteria_combine() {
        let filter = IndexFilter::new()
            .with_status(JobStatus::Running)
            .with_backend("local")
            .with_name("analysis");
        assert!(filter.matches(&record(JobStatus::Running, "local", "analysis-7")));
        assert!(!filter.matches(&record(JobStatus::Completed, "local", "analysis-7")));
        assert!(!filter.matches(&record(JobStatus::Running, "batch", "analysis-7")));
        assert!(!filter.matches(&record(JobStatus::Running, "local", "other")));
    }

    #[test]
    fn monitored_filter_skips_terminal_jobs() {
        let filter = IndexFilter::monitored();
        assert!(filter.matches(&record(JobStatus::Submitting, "local", "")));
        assert!(filter.matches(&record(JobStatus::Running, "local", "")));
        assert!(!filter.matches(&record(JobStatus::New, "local", "")));
        assert!(!filter.matches(&record(JobStatus::Failed, "local", "")));
    }
}
