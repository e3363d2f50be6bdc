//! Merging freshly observed provider state into the persisted record.
//!
//! This module is the single place allowed to write the cloud-specific
//! `data` sub-object. Merges are partial: only the fields a patch names are
//! touched, last-write-wins per field rather than per record, so the VM
//! state poller and a disk-creation step racing on the same record cannot
//! clobber each other's fields.

use crate::error::CloudError;
use crate::server::{Cloud, Data, DataPatch};

/// One field of a partial update: leave it alone, clear it, or set it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPatch<T> {
    Keep,
    Clear,
    Set(T),
}

// Not derived: the derive would demand `T: Default` even though the default
// variant carries no value.
impl<T> Default for FieldPatch<T> {
    fn default() -> Self {
        FieldPatch::Keep
    }
}

impl<T> FieldPatch<T> {
    pub fn apply(self, slot: &mut Option<T>) {
        match self {
            FieldPatch::Keep => {}
            FieldPatch::Clear => *slot = None,
            FieldPatch::Set(value) => *slot = Some(value),
        }
    }

    /// `Set` when a value is present, `Clear` otherwise. Matches the shape
    /// of provider payloads where an absent field means "gone".
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(value) => FieldPatch::Set(value),
            None => FieldPatch::Clear,
        }
    }
}

/// Merge `patch` into `existing`, producing the new data value.
///
/// The patch's cloud must match the record's configured cloud, and so must
/// any existing data. A mismatch is a stale-data error, never silently
/// trusted: it flags a record whose cloud was changed without clearing old
/// provider handles.
pub fn merge_data(
    configured: Cloud,
    existing: Option<Data>,
    patch: DataPatch,
) -> Result<Data, CloudError> {
    if patch.cloud() != configured {
        return Err(CloudError::StaleData {
            configured,
            data: patch.cloud(),
        });
    }
    let mut data = match existing {
        Some(data) if data.cloud() != configured => {
            return Err(CloudError::StaleData {
                configured,
                data: data.cloud(),
            });
        }
        Some(data) => data,
        None => Data::empty(configured),
    };
    match (&mut data, patch) {
        (Data::Hyperstack(data), DataPatch::Hyperstack(patch)) => patch.apply(data),
        (Data::GoogleCloud(data), DataPatch::GoogleCloud(patch)) => patch.apply(data),
        // Both sides were just checked against `configured`.
        _ => unreachable!("cloud tags verified above"),
    }
    Ok(data)
}
