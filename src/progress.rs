//! The coordinator surface for job progress and cooperative cancellation.
//!
//! The engine never polls the coordinator on its own schedule: it piggybacks
//! a report on every N-th file boundary (see `SnapshotLoader::report_every`)
//! and aborts the job if the coordinator answers `Cancelled`.  Reporting is
//! best-effort: a transport failure must never fake a cancellation.

/// The flavor of job being reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskKind {
    Upload,
    Download,
}

/// The coordinator's verdict on a progress report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportStatus {
    /// Keep going.
    Ok,
    /// The job was cancelled on the coordinator side; unwind.
    Cancelled,
}

/// One progress report, as sent over the coordinator RPC.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgressReport {
    pub job_id: i64,
    pub task_id: i64,
    pub kind: TaskKind,
    pub finished_num: i32,
    pub total_num: i32,
}

/// The coordinator RPC stub.
///
/// Implementations must bound each call to roughly 10 seconds: a report is
/// issued from inside transfer loops, and an unbounded stall there would
/// defeat the point of cooperative cancellation.  Transport failures are
/// surfaced as `Err` and ignored by the engine.
pub trait Coordinator: Send + Sync {
    fn report(&self, report: &ProgressReport) -> crate::result::Result<ReportStatus>;
}
