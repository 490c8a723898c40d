//! Cross-queue submission with fence dependencies.
//!
//! The scheduler hands out fence values from one context-wide timeline and
//! turns "run this after that" into backend queue waits. Every pipeline stage
//! submits through it, so the values it returns are strictly increasing for
//! the lifetime of the context.
//!
//! # Architecture
//!
//! | Layer | Type | Purpose |
//! |-------|------|---------|
//! | Renderer | [`ShadowRenderer`](crate::ShadowRenderer) | Per-frame stage chain |
//! | **Scheduler** | [`QueueScheduler`] | Fence values and cross-queue waits (this module) |
//! | Commands | [`CommandList`] | Recorded work for one submission |
//! | Backend | [`RtBackend`] | Queue execution and fence timelines |
//!
//! # Module Contents
//!
//! - [`QueueScheduler`] - Submits command lists and waits on fences
//! - [`FenceValue`] - A point on the context-wide timeline
//! - [`QueueKind`] - The direct, compute and copy queues
//! - [`StageFences`] - Per-stage completion values of one frame
//!
//! # Example
//!
//! ```ignore
//! let deform = scheduler.submit(QueueKind::Compute, deform_list, translate)?;
//! let blas = scheduler.submit(QueueKind::Direct, blas_list, deform)?;
//! let tlas = scheduler.submit(QueueKind::Direct, tlas_list, blas)?;
//! let rays = scheduler.submit(QueueKind::Direct, ray_list, tlas)?;
//!
//! // Block until the output can be read back
//! scheduler.wait(rays)?;
//! ```

mod fence;

pub use fence::{FenceValue, FenceWait, QueueKind, StageFences};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::{CommandList, RtBackend};
use crate::error::{RaytraceError, RaytraceResult};

#[derive(Debug, Default)]
struct SchedulerState {
    /// Last value handed out.
    last_value: u64,
    /// Queue of every value that may still be pending on the device.
    in_flight: BTreeMap<u64, QueueKind>,
}

/// Submits command lists onto backend queues, chaining them with fences.
pub struct QueueScheduler {
    backend: Arc<dyn RtBackend>,
    state: Mutex<SchedulerState>,
    timeout: Duration,
}

impl QueueScheduler {
    /// Create a scheduler whose blocking waits give up after `timeout`.
    pub fn new(backend: Arc<dyn RtBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            state: Mutex::new(SchedulerState::default()),
            timeout,
        }
    }

    pub fn backend(&self) -> &Arc<dyn RtBackend> {
        &self.backend
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Last fence value handed out.
    pub fn last_value(&self) -> FenceValue {
        FenceValue(self.state.lock().last_value)
    }

    /// Submit a command list.
    ///
    /// If `preceding` is not [`FenceValue::NONE`], `queue` waits for it before
    /// executing. Returns the fresh value `queue` signals when the list
    /// completes. An empty list is not submitted and `preceding` is returned.
    pub fn submit(
        &self,
        queue: QueueKind,
        commands: CommandList,
        preceding: FenceValue,
    ) -> RaytraceResult<FenceValue> {
        if commands.is_empty() {
            return Ok(preceding);
        }
        self.submit_always(queue, commands, preceding)
    }

    fn submit_always(
        &self,
        queue: QueueKind,
        commands: CommandList,
        preceding: FenceValue,
    ) -> RaytraceResult<FenceValue> {
        let mut state = self.state.lock();
        if preceding.get() > state.last_value {
            return Err(RaytraceError::InvalidParameter(format!(
                "fence {preceding} was never issued"
            )));
        }
        let wait = state
            .in_flight
            .get(&preceding.get())
            .map(|&wait_queue| FenceWait {
                queue: wait_queue,
                value: preceding.get(),
            });

        let signal = state.last_value + 1;
        log::trace!(
            "Submitting '{}' to {} queue ({} commands, wait {:?}, signal {})",
            commands.label(),
            queue,
            commands.len(),
            wait,
            signal
        );
        self.backend.submit(queue, commands, wait, signal)?;
        state.last_value = signal;
        state.in_flight.insert(signal, queue);
        Ok(FenceValue(signal))
    }

    /// Returns a value that completes only after both `a` and `b`.
    ///
    /// Values on the same queue are ordered already. Across queues an empty
    /// marker is queued behind the later value, waiting on the other.
    pub fn join(&self, a: FenceValue, b: FenceValue) -> RaytraceResult<FenceValue> {
        let (early, late) = if a <= b { (a, b) } else { (b, a) };
        if early.is_none() || early == late {
            return Ok(late);
        }
        let (early_queue, late_queue) = {
            let state = self.state.lock();
            (
                state.in_flight.get(&early.get()).copied(),
                state.in_flight.get(&late.get()).copied(),
            )
        };
        match (early_queue, late_queue) {
            (None, _) => Ok(late),
            (Some(_), None) => Ok(early),
            (Some(q1), Some(q2)) if q1 == q2 => Ok(late),
            (Some(_), Some(late_queue)) => {
                self.submit_always(late_queue, CommandList::new("join"), early)
            }
        }
    }

    /// Returns true once `fence` has been signaled.
    pub fn is_complete(&self, fence: FenceValue) -> RaytraceResult<bool> {
        if fence.is_none() {
            return Ok(true);
        }
        let queue = self.state.lock().in_flight.get(&fence.get()).copied();
        match queue {
            Some(queue) => Ok(self.backend.completed_value(queue)? >= fence.get()),
            None => Ok(true),
        }
    }

    /// Block until `fence` is signaled.
    ///
    /// Exceeding the timeout is reported as [`RaytraceError::Timeout`], which
    /// callers treat like a lost device.
    pub fn wait(&self, fence: FenceValue) -> RaytraceResult<()> {
        if fence.is_none() {
            return Ok(());
        }
        let queue = self.state.lock().in_flight.get(&fence.get()).copied();
        let Some(queue) = queue else {
            return Ok(());
        };
        if self.backend.wait(queue, fence.get(), self.timeout)? {
            Ok(())
        } else {
            log::error!(
                "Timed out after {:?} waiting for fence {} on {} queue",
                self.timeout,
                fence,
                queue
            );
            Err(RaytraceError::Timeout(self.timeout, fence.get()))
        }
    }

    /// Block until every submitted value is signaled.
    pub fn wait_idle(&self) -> RaytraceResult<()> {
        let last = {
            let state = self.state.lock();
            QueueKind::ALL.map(|queue| {
                state
                    .in_flight
                    .iter()
                    .rev()
                    .find(|(_, q)| **q == queue)
                    .map(|(value, _)| FenceValue(*value))
            })
        };
        for fence in last.into_iter().flatten() {
            self.wait(fence)?;
        }
        Ok(())
    }

    /// Forgets values the device has already signaled. Returns how many were retired.
    pub fn retire(&self) -> RaytraceResult<usize> {
        let completed = QueueKind::ALL
            .iter()
            .map(|&queue| self.backend.completed_value(queue))
            .collect::<RaytraceResult<Vec<_>>>()?;
        let mut state = self.state.lock();
        let before = state.in_flight.len();
        state
            .in_flight
            .retain(|value, queue| *value > completed[queue.index()]);
        Ok(before - state.in_flight.len())
    }

    /// Number of values that may still be pending on the device.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("QueueScheduler")
            .field("backend", &self.backend.name())
            .field("last_value", &state.last_value)
            .field("in_flight", &state.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::types::{BufferDescriptor, BufferUsage, MemoryLocation};

    fn setup() -> (Arc<SoftwareBackend>, QueueScheduler) {
        let backend = Arc::new(SoftwareBackend::new());
        let scheduler = QueueScheduler::new(backend.clone(), Duration::from_millis(50));
        (backend, scheduler)
    }

    fn work(backend: &SoftwareBackend, label: &str) -> CommandList {
        let buffer = Arc::new(
            backend
                .create_buffer(
                    &BufferDescriptor::new(4, BufferUsage::COPY_DST)
                        .with_location(MemoryLocation::CpuToGpu),
                )
                .unwrap(),
        );
        let mut list = CommandList::new(label);
        list.upload(&buffer, 0, &[1, 2, 3, 4]);
        list
    }

    #[test]
    fn test_values_strictly_increase() {
        let (backend, scheduler) = setup();
        let a = scheduler
            .submit(QueueKind::Copy, work(&backend, "a"), FenceValue::NONE)
            .unwrap();
        let b = scheduler
            .submit(QueueKind::Compute, work(&backend, "b"), a)
            .unwrap();
        let c = scheduler
            .submit(QueueKind::Direct, work(&backend, "c"), b)
            .unwrap();
        assert!(a < b && b < c);
        assert_eq!(scheduler.last_value(), c);
    }

    #[test]
    fn test_empty_list_returns_preceding() {
        let (backend, scheduler) = setup();
        let a = scheduler
            .submit(QueueKind::Copy, work(&backend, "a"), FenceValue::NONE)
            .unwrap();
        let skipped = scheduler
            .submit(QueueKind::Compute, CommandList::new("empty"), a)
            .unwrap();
        assert_eq!(skipped, a);
        assert_eq!(scheduler.last_value(), a);
    }

    #[test]
    fn test_cross_queue_wait_recorded() {
        let (backend, scheduler) = setup();
        let a = scheduler
            .submit(QueueKind::Compute, work(&backend, "deform"), FenceValue::NONE)
            .unwrap();
        scheduler
            .submit(QueueKind::Direct, work(&backend, "build"), a)
            .unwrap();

        let executed = backend.executed();
        assert_eq!(
            executed[1].wait,
            Some(FenceWait {
                queue: QueueKind::Compute,
                value: a.get()
            })
        );
    }

    #[test]
    fn test_dependent_waits_for_paused_queue() {
        let (backend, scheduler) = setup();
        backend.set_queue_paused(QueueKind::Copy, true);
        let upload = scheduler
            .submit(QueueKind::Copy, work(&backend, "upload"), FenceValue::NONE)
            .unwrap();
        let build = scheduler
            .submit(QueueKind::Direct, work(&backend, "build"), upload)
            .unwrap();

        assert!(!scheduler.is_complete(build).unwrap());
        assert_eq!(
            scheduler.wait(build),
            Err(RaytraceError::Timeout(Duration::from_millis(50), build.get()))
        );

        backend.set_queue_paused(QueueKind::Copy, false);
        scheduler.wait(build).unwrap();
        assert!(scheduler.is_complete(upload).unwrap());
    }

    #[test]
    fn test_join_across_queues() {
        let (backend, scheduler) = setup();
        backend.set_queue_paused(QueueKind::Copy, true);
        let copy = scheduler
            .submit(QueueKind::Copy, work(&backend, "copy"), FenceValue::NONE)
            .unwrap();
        let compute = scheduler
            .submit(QueueKind::Compute, work(&backend, "compute"), FenceValue::NONE)
            .unwrap();

        let joined = scheduler.join(copy, compute).unwrap();
        assert!(joined > compute);
        assert!(!scheduler.is_complete(joined).unwrap());

        backend.set_queue_paused(QueueKind::Copy, false);
        assert!(scheduler.is_complete(joined).unwrap());
    }

    #[test]
    fn test_join_trivial_cases() {
        let (backend, scheduler) = setup();
        let a = scheduler
            .submit(QueueKind::Direct, work(&backend, "a"), FenceValue::NONE)
            .unwrap();
        let b = scheduler
            .submit(QueueKind::Direct, work(&backend, "b"), FenceValue::NONE)
            .unwrap();
        assert_eq!(scheduler.join(FenceValue::NONE, a).unwrap(), a);
        assert_eq!(scheduler.join(a, b).unwrap(), b);
        assert_eq!(scheduler.last_value(), b);
    }

    #[test]
    fn test_unknown_fence_rejected() {
        let (backend, scheduler) = setup();
        let err = scheduler
            .submit(QueueKind::Direct, work(&backend, "a"), FenceValue(42))
            .unwrap_err();
        assert!(matches!(err, RaytraceError::InvalidParameter(_)));
    }

    #[test]
    fn test_retire() {
        let (backend, scheduler) = setup();
        for label in ["a", "b", "c"] {
            scheduler
                .submit(QueueKind::Direct, work(&backend, label), FenceValue::NONE)
                .unwrap();
        }
        assert_eq!(scheduler.in_flight(), 3);
        assert_eq!(scheduler.retire().unwrap(), 3);
        assert_eq!(scheduler.in_flight(), 0);
        scheduler.wait_idle().unwrap();
    }
}
