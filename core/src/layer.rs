//! Layer masks and per-renderer layer compaction.
//!
//! Instances live on one of [`MAX_LAYERS`] layers. Cameras and lights carry a
//! mask of the layers they interact with. Before rendering, a renderer compacts
//! the layers its instances actually use into dense GPU layer bits so that the
//! shader-side masks stay small and stable in layer order.

/// Maximum number of distinct layers.
pub const MAX_LAYERS: usize = 32;

/// Bit set over layer indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LayerMask(pub u32);

impl LayerMask {
    /// Mask selecting every layer.
    pub const ALL: Self = Self(u32::MAX);
    /// Mask selecting no layer.
    pub const NONE: Self = Self(0);

    /// Mask with a single layer set. Layers outside the valid range map to no layer.
    pub fn from_layer(layer: u32) -> Self {
        if (layer as usize) < MAX_LAYERS {
            Self(1 << layer)
        } else {
            Self::NONE
        }
    }

    pub fn contains(self, layer: u32) -> bool {
        (layer as usize) < MAX_LAYERS && self.0 & (1 << layer) != 0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

/// Mapping from scene layers to compacted GPU layers for one renderer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerTable {
    gpu_layer: [Option<u8>; MAX_LAYERS],
    used: usize,
}

impl Default for LayerTable {
    fn default() -> Self {
        Self {
            gpu_layer: [None; MAX_LAYERS],
            used: 0,
        }
    }
}

impl LayerTable {
    /// Builds the table from the layers of a renderer's instances.
    ///
    /// GPU layers are assigned in ascending scene-layer order. Out of range
    /// layers are ignored.
    pub fn from_layers(layers: impl IntoIterator<Item = u32>) -> Self {
        let mut present = [false; MAX_LAYERS];
        for layer in layers {
            if let Some(slot) = present.get_mut(layer as usize) {
                *slot = true;
            }
        }

        let mut table = Self::default();
        for (layer, _) in present.iter().enumerate().filter(|(_, p)| **p) {
            table.gpu_layer[layer] = Some(table.used as u8);
            table.used += 1;
        }
        table
    }

    /// Number of distinct layers in use.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// GPU layer assigned to a scene layer.
    pub fn gpu_layer(&self, layer: u32) -> Option<u32> {
        self.gpu_layer
            .get(layer as usize)
            .copied()
            .flatten()
            .map(u32::from)
    }

    /// GPU mask for an instance living on `layer`.
    pub fn instance_mask(&self, layer: u32) -> LayerMask {
        self.gpu_layer(layer)
            .map(LayerMask::from_layer)
            .unwrap_or(LayerMask::NONE)
    }

    /// Translates a scene layer mask (camera or light) into GPU layer bits.
    pub fn translate(&self, mask: LayerMask) -> LayerMask {
        let mut bits = 0u32;
        for (layer, gpu) in self.gpu_layer.iter().enumerate() {
            if let Some(gpu) = gpu {
                if mask.contains(layer as u32) {
                    bits |= 1 << gpu;
                }
            }
        }
        LayerMask(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(0, 0b1)]
    #[case::last(31, 1 << 31)]
    #[case::out_of_range(32, 0)]
    fn test_from_layer(#[case] layer: u32, #[case] bits: u32) {
        assert_eq!(LayerMask::from_layer(layer).bits(), bits);
    }

    #[test]
    fn test_layer_mask() {
        let mask = LayerMask::from_layer(3);
        assert_eq!(mask.bits(), 0b1000);
        assert!(mask.contains(3));
        assert!(!mask.contains(2));
        assert_eq!(LayerMask::from_layer(40), LayerMask::NONE);
    }

    #[test]
    fn test_compaction_preserves_order() {
        let table = LayerTable::from_layers([9, 2, 9, 31]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.gpu_layer(2), Some(0));
        assert_eq!(table.gpu_layer(9), Some(1));
        assert_eq!(table.gpu_layer(31), Some(2));
        assert_eq!(table.gpu_layer(0), None);
    }

    #[test]
    fn test_translate_mask() {
        let table = LayerTable::from_layers([4, 7]);
        let light = LayerMask((1 << 7) | (1 << 12));
        assert_eq!(table.translate(light), LayerMask(0b10));
        assert_eq!(table.translate(LayerMask::ALL), LayerMask(0b11));
        assert_eq!(table.instance_mask(4), LayerMask(0b01));
        assert_eq!(table.instance_mask(5), LayerMask::NONE);
    }
}
