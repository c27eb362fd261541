use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    New,
    Submitting,
    Submitted,
    Running,
    Completed,
    Failed,
    Killed,
    Removed,
    Incomplete,
    Unknown,
}

impl JobStatus {
    pub const ALL: [JobStatus; 10] = [
        JobStatus::New,
        JobStatus::Submitting,
        JobStatus::Submitted,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Killed,
        JobStatus::Removed,
        JobStatus::Incomplete,
        JobStatus::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Submitting => "submitting",
            JobStatus::Submitted => "submitted",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Killed => "killed",
            JobStatus::Removed => "removed",
            JobStatus::Incomplete => "incomplete",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Killed
                | JobStatus::Removed
                | JobStatus::Incomplete
                | JobStatus::Unknown
        )
    }

    /// States the monitoring engine reconciles against the backend.
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            JobStatus::Submitting | JobStatus::Submitted | JobStatus::Running
        )
    }

    /// Terminal states that notify transition hooks when entered.
    pub fn fires_hooks(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Killed | JobStatus::Unknown
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Who is allowed to request an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Lifecycle commands issued by a user (submit, kill, resubmit, remove)
    User,
    /// Status reported by a backend adapter
    Backend,
    /// Either a user command or a backend report
    Any,
    /// Reverting an optimistic transition after a failed backend call
    Rollback,
}

impl Trigger {
    pub fn reportable_by_backend(self) -> bool {
        matches!(self, Trigger::Backend | Trigger::Any)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub from: JobStatus,
    pub to: JobStatus,
    pub label: &'static str,
    pub trigger: Trigger,
}

/// One row of the exported transition diagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedEdge {
    pub from: JobStatus,
    pub to: JobStatus,
    pub label: String,
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphExport {
    pub initial: Vec<JobStatus>,
    pub transient: Vec<JobStatus>,
    pub edges: Vec<ExportedEdge>,
}

impl GraphExport {
    /// Render as Graphviz dot. Forced transitions are drawn dashed.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph job_status {\n    rankdir=LR;\n");
        for status in &self.initial {
            let _ = writeln!(out, "    {} [shape=doublecircle];", status);
        }
        for status in &self.transient {
            let _ = writeln!(out, "    {} [style=dotted];", status);
        }
        for edge in &self.edges {
            let style = if edge.forced {
                "\"dashed, color=gray\""
            } else {
                "solid"
            };
            let _ = writeln!(
                out,
                "    {} -> {} [label=\"{}\", style={}];",
                edge.from, edge.to, edge.label, style
            );
        }
        out.push_str("}\n");
        out
    }
}

/// The legal-transition graph for job status.
#[derive(Debug, Clone)]
pub struct TransitionGraph {
    edges: HashMap<(JobStatus, JobStatus), Edge>,
}

impl Default for TransitionGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransitionGraph {
    pub const INITIAL: [JobStatus; 2] = [JobStatus::New, JobStatus::Incomplete];
    pub const TRANSIENT: [JobStatus; 3] =
        [JobStatus::Incomplete, JobStatus::Removed, JobStatus::Unknown];

    pub fn standard() -> Self {
        use JobStatus::*;

        let mut edges = vec![
            (New, Submitting, "submit", Trigger::User),
            (New, Failed, "backend reported failure", Trigger::Backend),
            (Submitting, New, "submission failed", Trigger::Rollback),
            (Submitting, Submitted, "submission confirmed", Trigger::Backend),
            (Submitting, Failed, "backend reported failure", Trigger::Backend),
            (Submitting, Unknown, "remote job manager error", Trigger::Backend),
            (Submitted, Running, "started", Trigger::Backend),
            (Submitted, Completed, "finished", Trigger::Backend),
            (Submitted, Failed, "backend reported failure", Trigger::Backend),
            (Submitted, Killed, "kill", Trigger::Any),
            (Submitted, Unknown, "lost by backend", Trigger::Backend),
            (Running, Completed, "finished", Trigger::Backend),
            (Running, Failed, "backend reported failure", Trigger::Backend),
            (Running, Killed, "kill", Trigger::Any),
            (Running, Unknown, "lost by backend", Trigger::Backend),
            (Failed, Submitting, "resubmit", Trigger::User),
            (Killed, Submitting, "resubmit", Trigger::User),
        ];
        for status in JobStatus::ALL {
            if status != Removed {
                edges.push((status, Removed, "remove", Trigger::User));
            }
        }

        Self {
            edges: edges
                .into_iter()
                .map(|(from, to, label, trigger)| {
                    (
                        (from, to),
                        Edge {
                            from,
                            to,
                            label,
                            trigger,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Look up the edge `from -> to`. Self transitions are never edges.
    pub fn edge(&self, from: JobStatus, to: JobStatus) -> Option<&Edge> {
        self.edges.get(&(from, to))
    }

    pub fn is_legal(&self, from: JobStatus, to: JobStatus) -> bool {
        self.edge(from, to).is_some()
    }

    /// Shortest chain of backend-reportable edges leading from `from` to `to`.
    ///
    /// Returns the states to pass through, ending with `to`. A backend that
    /// reports `completed` for a job still `submitting` yields
    /// `[submitted, completed]`.
    pub fn backend_path(&self, from: JobStatus, to: JobStatus) -> Option<Vec<JobStatus>> {
        if from == to {
            return None;
        }

        let mut previous: HashMap<JobStatus, JobStatus> = HashMap::new();
        let mut queue = VecDeque::from([from]);

        while let Some(current) = queue.pop_front() {
            for status in JobStatus::ALL {
                let Some(edge) = self.edge(current, status) else {
                    continue;
                };
                if !edge.trigger.reportable_by_backend()
                    || status == from
                    || previous.contains_key(&status)
                {
                    continue;
                }
                previous.insert(status, current);
                if status == to {
                    let mut path = vec![to];
                    let mut step = current;
                    while step != from {
                        path.push(step);
                        step = previous[&step];
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(status);
            }
        }
        None
    }

    pub fn edges(&self) -> Vec<&Edge> {
        let mut edges: Vec<&Edge> = self.edges.values().collect();
        edges.sort_by_key(|e| (e.from, e.to));
        edges
    }

    /// Export the graph for visualization or audit. With `include_forced`
    /// every ordered pair lacking a legal edge appears as a forced edge.
    pub fn export(&self, include_forced: bool) -> GraphExport {
        let mut edges: Vec<ExportedEdge> = self
            .edges()
            .into_iter()
            .map(|e| ExportedEdge {
                from: e.from,
                to: e.to,
                label: e.label.to_string(),
                forced: false,
            })
            .collect();

        if include_forced {
            for from in JobStatus::ALL {
                for to in JobStatus::ALL {
                    if from != to && !self.is_legal(from, to) {
                        edges.push(ExportedEdge {
                            from,
                            to,
                            label: "force".to_string(),
                            forced: true,
                        });
                    }
                }
            }
        }

        GraphExport {
            initial: Self::INITIAL.to_vec(),
            transient: Self::TRANSIENT.to_vec(),
            edges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn status_display_and_parse() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), Running);
        assert!("completing".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_and_monitored_sets() {
        assert!(!New.is_terminal());
        assert!(Submitting.is_monitored());
        assert!(!New.is_monitored());
        for status in [Completed, Failed, Killed, Removed, Incomplete, Unknown] {
            assert!(status.is_terminal(), "{status} should be terminal");
            assert!(!status.is_monitored());
        }
        assert!(!Removed.fires_hooks());
    }

    #[test]
    fn representative_edges_exist() {
        let graph = TransitionGraph::standard();
        assert!(graph.is_legal(New, Submitting));
        assert!(graph.is_legal(Submitting, Submitted));
        assert!(graph.is_legal(Submitted, Running));
        assert!(graph.is_legal(Running, Completed));
        assert!(graph.is_legal(Running, Killed));
        assert!(graph.is_legal(Failed, Submitting));
        assert!(graph.is_legal(Killed, Submitting));
        assert!(graph.is_legal(Submitting, New));
        for status in JobStatus::ALL {
            if status != Removed {
                assert!(graph.is_legal(status, Removed));
            }
        }
    }

    #[test]
    fn terminal_states_only_leave_through_remove_or_resubmit() {
        let graph = TransitionGraph::standard();
        for from in [Completed, Failed, Killed, Removed, Incomplete, Unknown] {
            for to in JobStatus::ALL {
                if graph.is_legal(from, to) {
                    assert!(
                        to == Removed || (to == Submitting && matches!(from, Failed | Killed)),
                        "unexpected edge {from} -> {to}"
                    );
                }
            }
        }
    }

    #[test]
    fn self_transitions_are_not_edges() {
        let graph = TransitionGraph::standard();
        for status in JobStatus::ALL {
            assert!(!graph.is_legal(status, status));
        }
    }

    #[test]
    fn backend_path_walks_intermediate_states() {
        let graph = TransitionGraph::standard();
        assert_eq!(
            graph.backend_path(Submitting, Completed),
            Some(vec![Submitted, Completed])
        );
        assert_eq!(graph.backend_path(Submitted, Completed), Some(vec![Completed]));
        assert_eq!(
            graph.backend_path(Submitting, Running),
            Some(vec![Submitted, Running])
        );
    }

    #[test]
    fn backend_path_refuses_user_edges() {
        let graph = TransitionGraph::standard();
        assert_eq!(graph.backend_path(New, Submitting), None);
        assert_eq!(graph.backend_path(Failed, Submitting), None);
        assert_eq!(graph.backend_path(Completed, Running), None);
        assert_eq!(graph.backend_path(Running, Removed), None);
        assert_eq!(graph.backend_path(Running, Running), None);
    }

    #[test]
    fn export_marks_forced_edges() {
        let graph = TransitionGraph::standard();
        let plain = graph.export(false);
        assert!(plain.edges.iter().all(|e| !e.forced));
        assert_eq!(plain.edges.len(), graph.edges().len());
        assert_eq!(plain.initial, vec![New, Incomplete]);

        let full = graph.export(true);
        let total_pairs = JobStatus::ALL.len() * (JobStatus::ALL.len() - 1);
        assert_eq!(full.edges.len(), total_pairs);
        assert!(full
            .edges
            .iter()
            .any(|e| e.forced && e.from == Completed && e.to == Running));

        let dot = full.to_dot();
        assert!(dot.starts_with("digraph job_status"));
        assert!(dot.contains("completed -> running [label=\"force\", style=\"dashed, color=gray\"]"));
        assert!(dot.contains("new -> submitting [label=\"submit\", style=solid]"));
    }
}
