use std::time::Duration;

use campus_core::{
    sort_by_distance, Coordinates, NewVendor, RequestResult, Vendor, VendorFilters, VendorUpdate,
    WithDistance,
};
use tracing::debug;

use super::{Resource, ResourceService};

/// Campus business listings.
#[derive(Debug, Clone, Copy)]
pub struct Vendors;

impl Resource for Vendors {
    const NAME: &'static str = "vendors";
    const PATH: &'static str = "/api/vendors";
    const TTL: Duration = Duration::from_secs(10 * 60);

    type Entity = Vendor;
    type Filters = VendorFilters;
    type Create = NewVendor;
    type Update = VendorUpdate;
}

pub type VendorsService = ResourceService<Vendors>;

impl ResourceService<Vendors> {
    /// Vendors within `radius_m` meters of `origin`, nearest first.
    ///
    /// Vendors without a position are excluded. Uses the same cached list
    /// as [`ResourceService::list`].
    pub async fn nearby(
        &self,
        origin: Coordinates,
        radius_m: f64,
        filters: &VendorFilters,
    ) -> RequestResult<Vec<WithDistance<Vendor>>> {
        let vendors = self.list(filters).await?;
        let total = vendors.len();
        let nearby: Vec<WithDistance<Vendor>> = sort_by_distance(vendors, origin)
            .into_iter()
            .filter(|v| v.distance.is_some_and(|d| d <= radius_m))
            .collect();
        debug!(total, within = nearby.len(), radius_m, "Filtered vendors by distance");
        Ok(nearby)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use campus_core::RetryPolicy;
    use campus_storage::LocalCacheStore;
    use campus_test_utils::{fixtures, ScriptedExecutor};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_nearby_sorts_and_limits() {
        // ~111 m per 0.001 degree of longitude at the equator
        let far = fixtures::vendor("Far Deli", 0.0, 0.02);
        let near = fixtures::vendor("Near Print", 0.0, 0.001);
        let mid = fixtures::vendor("Mid Laundry", 0.0, 0.005);
        let mut unplaced = fixtures::vendor("Online Only", 0.0, 0.0);
        unplaced.latitude = None;

        let executor = Arc::new(ScriptedExecutor::new());
        executor.push_ok(json!([far, near, mid, unplaced]));
        let vendors: VendorsService =
            ResourceService::new(executor, LocalCacheStore::in_memory(), RetryPolicy::none());

        let found = vendors
            .nearby(Coordinates::new(0.0, 0.0), 1_000.0, &VendorFilters::default())
            .await
            .unwrap();
        let names: Vec<&str> = found.iter().map(|v| v.item.name.as_str()).collect();
        assert_eq!(names, vec!["Near Print", "Mid Laundry"]);
        assert!(found[0].distance.unwrap() < found[1].distance.unwrap());
    }
}
