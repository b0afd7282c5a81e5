use super::Tablet;
use crate::error::Result;

/// Closed WAL segments whose every operation is durable in committed row
/// sets or delta files.
pub fn deletable_segments(tablet: &Tablet) -> Vec<u64> {
    let state = tablet.metadata.state();
    tablet.wal.deletable_segments(|target| state.is_durable(target))
}

/// Delete the WAL segments recovery no longer needs.
pub fn cleanup_segments(tablet: &Tablet) -> Result<usize> {
    tablet.check_open()?;
    let deletable = deletable_segments(tablet);
    if deletable.is_empty() {
        return Ok(0);
    }

    tracing::debug!(
        tablet_id = %tablet.tablet_id(),
        segments = ?deletable,
        "Found {} WAL segments to clean up",
        deletable.len()
    );
    Ok(tablet.wal.remove_segments(&deletable))
}
