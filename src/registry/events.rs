use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{GantryError, Result};
use crate::job::{Fqid, Job, JobStatus, TransitionGraph, Trigger};

/// A committed status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub fqid: Fqid,
    pub from: JobStatus,
    pub to: JobStatus,
    /// Applied by an administrative force, bypassing the graph.
    pub forced: bool,
    /// Change of a master's status derived from its subjobs.
    pub aggregate: bool,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Notified once for every committed transition into a terminal state
/// (completed, failed, killed or unknown).
#[async_trait]
pub trait TransitionHook: Send + Sync {
    async fn on_terminal(&self, event: &TransitionEvent);
}

/// Which edges a change may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    User,
    Backend,
    Rollback,
    Forced,
}

impl Mode {
    fn allows(self, trigger: Trigger) -> bool {
        match self {
            Mode::User => matches!(trigger, Trigger::User | Trigger::Any),
            Mode::Backend => trigger.reportable_by_backend(),
            Mode::Rollback => trigger == Trigger::Rollback,
            Mode::Forced => true,
        }
    }
}

/// Status changes applied to one job during a commit.
pub(crate) struct Changes<'g> {
    graph: &'g TransitionGraph,
    at: DateTime<Utc>,
    reason: Option<String>,
    events: Vec<TransitionEvent>,
}

impl<'g> Changes<'g> {
    pub(crate) fn new(graph: &'g TransitionGraph) -> Self {
        Self {
            graph,
            at: Utc::now(),
            reason: None,
            events: Vec::new(),
        }
    }

    pub(crate) fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn graph(&self) -> &TransitionGraph {
        self.graph
    }

    /// Move one leaf record to `to`. Moving to the current status is a no-op.
    pub(crate) fn step(&mut self, job: &mut Job, fqid: Fqid, to: JobStatus, mode: Mode) -> Result<()> {
        let leaf = job.find_mut(fqid).ok_or(GantryError::JobNotFound(fqid))?;
        if !leaf.subjobs().is_empty() {
            return Err(GantryError::Internal(format!(
                "status of master {} is derived from its subjobs",
                fqid
            )));
        }

        let from = leaf.own_status();
        if from == to {
            return Ok(());
        }
        if mode != Mode::Forced {
            let allowed = self
                .graph
                .edge(from, to)
                .map(|edge| mode.allows(edge.trigger))
                .unwrap_or(false);
            if !allowed {
                return Err(GantryError::IllegalTransition { fqid, from, to });
            }
        }

        leaf.apply_status(to, self.at);
        self.events.push(TransitionEvent {
            fqid,
            from,
            to,
            forced: mode == Mode::Forced,
            aggregate: false,
            at: self.at,
            reason: self.reason.clone(),
        });
        Ok(())
    }

    /// Recompute the master's aggregate status, recording it if it moved.
    pub(crate) fn finish(&mut self, job: &mut Job) {
        if job.subjobs().is_empty() {
            return;
        }
        let before = job.own_status();
        job.sync_aggregate(self.at);
        let after = job.own_status();
        if before != after {
            self.events.push(TransitionEvent {
                fqid: job.fqid(),
                from: before,
                to: after,
                forced: false,
                aggregate: true,
                at: self.at,
                reason: None,
            });
        }
    }

    pub(crate) fn into_events(self) -> Vec<TransitionEvent> {
        self.events
    }
}
