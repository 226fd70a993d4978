//! Disk selection for new stripes

use crate::registry::DiskRegistry;
use std::collections::HashSet;
use stripestore_common::{DiskId, DiskRole};
use tracing::debug;

/// Pick up to `n` disks with `role` in registry order
///
/// Disks in `filter` and disks marked down are skipped. Fewer than `n` ids
/// come back when not enough disks qualify.
///
/// # Panics
/// Panics if fewer than `n` disks are registered at all.
#[must_use]
pub fn select_disks(
    registry: &DiskRegistry,
    n: usize,
    role: DiskRole,
    filter: &HashSet<DiskId>,
) -> Vec<DiskId> {
    assert!(
        registry.len() >= n,
        "asked for {n} disks but only {} are registered",
        registry.len()
    );

    let selected: Vec<DiskId> = registry
        .iter()
        .filter(|info| info.role == role)
        .filter(|info| !filter.contains(&info.id))
        .filter(|info| registry.is_up(info.id))
        .map(|info| info.id)
        .take(n)
        .collect();

    if selected.len() < n {
        debug!(
            "Selected {} of {} requested {:?} disks",
            selected.len(),
            n,
            role
        );
    }
    selected
}
