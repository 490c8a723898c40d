//! Bit flags shared between the scene layer and the ray tracing pipeline.

use bitflags::bitflags;

bitflags! {
    /// Per-renderer switches controlling how shadows are traced.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderFlags: u32 {
        /// Camera rays ignore back-facing receivers.
        const CULL_BACK_FACES = 0x1;
        /// Shadow rays cull front faces of casters instead of back faces.
        const FLIP_CASTER_FACES = 0x2;
        /// A receiver never shadows itself.
        const IGNORE_SELF_SHADOW = 0x4;
        /// With `IGNORE_SELF_SHADOW`, keep self shadows cast from beyond the threshold distance.
        const KEEP_SELF_DROP_SHADOW = 0x8;
        /// Trace a low resolution cascade first and refine only where it disagrees.
        const ADAPTIVE_SAMPLING = 0x100;
        /// Resolve edges with an extra supersampling pass.
        const ANTIALIASING = 0x200;
        /// Evaluate skinning and blendshapes on the GPU before building structures.
        const GPU_SKINNING = 0x10000;
        /// Clamp blendshape weights to the highest authored frame weight.
        const CLAMP_BLENDSHAPE_WEIGHTS = 0x20000;
        /// Record timestamps around each pipeline stage.
        const DBG_TIMESTAMP = 0x1000000;
        /// Rebuild every acceleration structure each frame.
        const DBG_FORCE_UPDATE_AS = 0x2000000;
    }
}

impl RenderFlags {
    /// Flags a freshly created renderer starts with.
    pub const DEFAULT: Self = Self::CULL_BACK_FACES
        .union(Self::IGNORE_SELF_SHADOW)
        .union(Self::KEEP_SELF_DROP_SHADOW)
        .union(Self::GPU_SKINNING);
}

bitflags! {
    /// Shadow participation and culling of one mesh instance.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstanceFlags: u32 {
        const RECEIVE_SHADOWS = 0x01;
        /// Invisible to camera rays, only casts.
        const SHADOWS_ONLY = 0x02;
        const CAST_SHADOWS = 0x04;
        const CULL_FRONT = 0x10;
        const CULL_BACK = 0x20;
        const CULL_FRONT_SHADOW = 0x40;
        const CULL_BACK_SHADOW = 0x80;
    }
}

impl InstanceFlags {
    /// Flags a freshly created instance starts with.
    pub const DEFAULT: Self = Self::RECEIVE_SHADOWS.union(Self::CAST_SHADOWS);
}

bitflags! {
    /// What changed on an instance since the pipeline last consumed it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UpdateFlags: u32 {
        const TRANSFORM = 0x1;
        const BLENDSHAPE = 0x2;
        const BONES = 0x4;
        const FLAGS = 0x8;
    }
}

impl UpdateFlags {
    /// Changes that invalidate deformed vertices.
    pub const DEFORM: Self = Self::BLENDSHAPE.union(Self::BONES);

    /// Returns true if deformation inputs changed.
    pub fn deform_changed(self) -> bool {
        self.intersects(Self::DEFORM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values() {
        assert_eq!(RenderFlags::ADAPTIVE_SAMPLING.bits(), 0x100);
        assert_eq!(RenderFlags::GPU_SKINNING.bits(), 0x10000);
        assert_eq!(InstanceFlags::CULL_BACK_SHADOW.bits(), 0x80);
        assert_eq!(InstanceFlags::DEFAULT.bits(), 0x05);
    }

    #[test]
    fn test_deform_changed() {
        assert!(UpdateFlags::BONES.deform_changed());
        assert!(UpdateFlags::BLENDSHAPE.deform_changed());
        assert!(!(UpdateFlags::TRANSFORM | UpdateFlags::FLAGS).deform_changed());
    }
}
