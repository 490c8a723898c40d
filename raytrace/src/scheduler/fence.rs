//! Fence values and queue identities.

use std::fmt;

/// GPU execution queues of the ray tracing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    /// Graphics-capable queue. Runs acceleration structure builds and ray dispatches.
    Direct,
    /// Async compute queue. Runs the deformation pass.
    Compute,
    /// Transfer queue. Runs uploads from the resource translator.
    Copy,
}

impl QueueKind {
    pub const ALL: [Self; 3] = [Self::Direct, Self::Compute, Self::Copy];

    /// Dense index for per-queue arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Direct => 0,
            Self::Compute => 1,
            Self::Copy => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Compute => "compute",
            Self::Copy => "copy",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A point on the context-wide fence timeline.
///
/// Values are handed out by the scheduler in strictly increasing order.
/// [`FenceValue::NONE`] means "no dependency".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FenceValue(pub u64);

impl FenceValue {
    pub const NONE: Self = Self(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A cross-queue wait: the submitting queue stalls until `queue` reaches `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceWait {
    pub queue: QueueKind,
    pub value: u64,
}

/// Fence values marking completion of each stage of one renderer frame.
///
/// A stage that did no work carries its predecessor's value, so the chain is
/// always non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageFences {
    pub translate: FenceValue,
    pub deform: FenceValue,
    pub blas: FenceValue,
    pub tlas: FenceValue,
    pub rays: FenceValue,
    pub output: FenceValue,
}

impl StageFences {
    /// Stage values in pipeline order.
    pub fn chain(&self) -> [FenceValue; 6] {
        [
            self.translate,
            self.deform,
            self.blas,
            self.tlas,
            self.rays,
            self.output,
        ]
    }

    /// Returns true if no stage completes before its predecessor.
    pub fn is_monotonic(&self) -> bool {
        self.chain().windows(2).all(|w| w[0] <= w[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_index() {
        for (i, queue) in QueueKind::ALL.iter().enumerate() {
            assert_eq!(queue.index(), i);
        }
        assert_eq!(QueueKind::Compute.to_string(), "compute");
    }

    #[test]
    fn test_stage_chain() {
        let mut fences = StageFences::default();
        assert!(fences.is_monotonic());

        fences.translate = FenceValue(1);
        fences.deform = FenceValue(2);
        fences.blas = FenceValue(2);
        fences.tlas = FenceValue(3);
        fences.rays = FenceValue(4);
        fences.output = FenceValue(4);
        assert!(fences.is_monotonic());

        fences.tlas = FenceValue(1);
        assert!(!fences.is_monotonic());
    }
}
