//! Development world seeding.

use tracing::info;

use crate::db::{DbError, WorldStore};
use crate::model::Position;

/// Seeds one region with two areas unless a region already exists.
///
/// Returns true if the world was seeded.
pub async fn seed_dev_world(store: &dyn WorldStore) -> Result<bool, DbError> {
    if !store.list_regions().await?.is_empty() {
        return Ok(false);
    }

    let region = store.insert_region("1", "Region0001").await?;
    store
        .insert_area(region.id, 0, "A", Position::new(1250.0, 1800.0, 0.0))
        .await?;
    store
        .insert_area(region.id, 1, "B", Position::new(1500.0, 750.0, 0.0))
        .await?;

    info!(region_id = %region.id, "Seeded development world");
    Ok(true)
}
