//! Job records and the status state machine.
//!
//! A job is a master record with an optional list of subjobs. Status moves
//! only along edges of the [`TransitionGraph`]; masters with subjobs derive
//! their status from them.

pub mod model;
pub mod status;

pub use model::{
    aggregate_status, ApplicationRef, BackendRef, Fqid, IndexRecord, Job, JobId, JobSpec,
};
pub use status::{Edge, ExportedEdge, GraphExport, JobStatus, TransitionGraph, Trigger};
