//! src/column.rs
//!
//! Device-aware wrapper around a columnar array.
//!
//! Pipelines that hand batches to the tensor framework track, per column,
//! which device the data is destined for and whether the underlying buffer
//! is finalized (sealed against further appends by its builder). `Column`
//! carries an Arrow array together with both facts, so downstream stages can
//! decide between zero-copy handoff and materialization without inspecting
//! the buffer itself.

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use tch::Device;

/// A columnar buffer bound to a target device.
#[derive(Debug, Clone)]
pub struct Column {
    data: ArrayRef,
    device: Device,
    finalized: bool,
}

impl Column {
    /// Wraps an existing Arrow array. `finalized` records whether the
    /// array's builder has sealed the buffer; a finalized column is safe to
    /// share zero-copy.
    pub fn from_arrow(device: Device, data: ArrayRef, finalized: bool) -> Self {
        Self {
            data,
            device,
            finalized,
        }
    }

    pub fn dtype(&self) -> &DataType {
        self.data.data_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Seals the column. Idempotent.
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    pub fn data(&self) -> &ArrayRef {
        &self.data
    }

    pub fn into_inner(self) -> ArrayRef {
        self.data
    }
}
