//! Compiled property-copy batches.

use serde::{Deserialize, Serialize};

use crate::handle::DataHandle;

/// Copies one property from a resolved source into the batch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyCopy {
    pub source: DataHandle,
    /// Field index in the source. Ignored for external global parameters,
    /// which resolve to a single value.
    pub source_property: u16,
    pub target_property: u16,
}

/// All copies feeding one target struct, plus the property functions whose
/// outputs the copies read. Functions run before the copies, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyBatch {
    pub copies: Vec<PropertyCopy>,
    /// Node indices of property functions.
    pub functions: Vec<u16>,
}

impl CopyBatch {
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty() && self.functions.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &DataHandle> {
        self.copies.iter().map(|copy| &copy.source)
    }
}
