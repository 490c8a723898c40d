//! Per-frame GPU timestamp log.
//!
//! Stages are bracketed by a `"<stage> begin"` and a `"<stage> end"` query.
//! After the frame's dispatch fence has signaled the queries are read back
//! and every matched pair becomes one line of the log.
//!
//! ```ignore
//! log.begin_frame(backend)?;
//! log.begin(&mut list, "deform");
//! // ... record work ...
//! log.end(&mut list, "deform");
//! scheduler.wait(rays)?;
//! log.resolve(backend)?;
//! assert!(log.text().starts_with("deform: "));
//! ```

use std::sync::Arc;

use crate::backend::{Command, CommandList, GpuQuerySet, RtBackend};
use crate::error::RaytraceResult;

/// Maximum number of timestamps per frame.
pub const MAX_TIMESTAMPS: u32 = 64;

const BEGIN: &str = " begin";
const END: &str = " end";

/// Duration of one bracketed stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTiming {
    pub stage: String,
    pub millis: f64,
}

/// Collects named timestamps for one renderer.
#[derive(Debug, Default)]
pub struct TimestampLog {
    set: Option<Arc<GpuQuerySet>>,
    names: Vec<String>,
    timings: Vec<StageTiming>,
    dropped: u32,
}

impl TimestampLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets the previous frame's queries, creating the query set on first use.
    pub fn begin_frame(&mut self, backend: &dyn RtBackend) -> RaytraceResult<()> {
        if self.set.is_none() {
            self.set = Some(Arc::new(backend.create_query_set(MAX_TIMESTAMPS)?));
        }
        self.names.clear();
        self.dropped = 0;
        Ok(())
    }

    /// Records a named timestamp. Returns false once the frame's queries are
    /// exhausted or before [`begin_frame`](Self::begin_frame).
    pub fn query(&mut self, list: &mut CommandList, name: impl Into<String>) -> bool {
        let Some(set) = &self.set else {
            return false;
        };
        if self.names.len() as u32 >= MAX_TIMESTAMPS {
            self.dropped += 1;
            return false;
        }
        list.push(Command::WriteTimestamp {
            set: Arc::clone(set),
            index: self.names.len() as u32,
        });
        self.names.push(name.into());
        true
    }

    pub fn begin(&mut self, list: &mut CommandList, stage: &str) -> bool {
        self.query(list, format!("{stage}{BEGIN}"))
    }

    pub fn end(&mut self, list: &mut CommandList, stage: &str) -> bool {
        self.query(list, format!("{stage}{END}"))
    }

    /// Number of queries recorded this frame.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Reads back this frame's queries. Every query must have completed.
    pub fn resolve(&mut self, backend: &dyn RtBackend) -> RaytraceResult<()> {
        self.timings.clear();
        let Some(set) = &self.set else {
            return Ok(());
        };
        if self.dropped > 0 {
            log::warn!("{} timestamps dropped, limit is {MAX_TIMESTAMPS}", self.dropped);
        }
        let values = backend.read_timestamps(set, self.names.len() as u32)?;
        self.timings = pair_stages(&self.names, &values);
        Ok(())
    }

    /// Stage timings of the last resolved frame.
    pub fn timings(&self) -> &[StageTiming] {
        &self.timings
    }

    /// One `"<stage>: <ms>ms"` line per stage of the last resolved frame.
    pub fn text(&self) -> String {
        self.timings
            .iter()
            .map(|t| format!("{}: {:.2}ms\n", t.stage, t.millis))
            .collect()
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.timings.clear();
    }
}

/// Matches every `"<stage> begin"` with the next `"<stage> end"`.
fn pair_stages(names: &[String], values: &[Option<u64>]) -> Vec<StageTiming> {
    let mut timings = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let Some(stage) = name.strip_suffix(BEGIN) else {
            continue;
        };
        let Some(Some(start)) = values.get(i) else {
            continue;
        };
        let end = names
            .iter()
            .enumerate()
            .skip(i + 1)
            .find(|(_, n)| n.strip_suffix(END) == Some(stage))
            .and_then(|(j, _)| values.get(j).copied().flatten());
        if let Some(end) = end {
            timings.push(StageTiming {
                stage: stage.to_string(),
                millis: end.saturating_sub(*start) as f64 / 1_000_000.0,
            });
        }
    }
    timings
}
