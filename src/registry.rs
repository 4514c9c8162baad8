use crate::types::{PeripheralId, PeripheralRef};

/// Bikes seen while scanning, deduplicated by identifier in first-seen order
#[derive(Debug, Clone, Default)]
pub struct ScanRegistry {
    devices: Vec<PeripheralRef>,
}

impl ScanRegistry {
    /// Create an empty registry
    #[must_use]
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Add a discovered bike
    ///
    /// Returns `false` if a bike with the same identifier is already listed;
    /// the first entry is kept unchanged.
    pub fn insert(&mut self, peripheral: PeripheralRef) -> bool {
        if self.get(&peripheral.id).is_some() {
            return false;
        }
        self.devices.push(peripheral);
        true
    }

    /// Look up a bike by identifier
    #[must_use]
    pub fn get(&self, id: &PeripheralId) -> Option<&PeripheralRef> {
        self.devices.iter().find(|device| &device.id == id)
    }

    /// All discovered bikes
    #[must_use]
    pub fn devices(&self) -> &[PeripheralRef] {
        &self.devices
    }

    /// Number of discovered bikes
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no bike was discovered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget all discovered bikes
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}
