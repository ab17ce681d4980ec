use std::time::Duration;

use campus_core::{
    CampusEvent, CampusEventUpdate, Clock, EventFilters, NewCampusEvent, RequestResult,
};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use super::{Resource, ResourceService};

/// Campus events.
#[derive(Debug, Clone, Copy)]
pub struct Events;

impl Resource for Events {
    const NAME: &'static str = "events";
    const PATH: &'static str = "/api/events";
    const TTL: Duration = Duration::from_secs(5 * 60);

    type Entity = CampusEvent;
    type Filters = EventFilters;
    type Create = NewCampusEvent;
    type Update = CampusEventUpdate;
}

pub type EventsService = ResourceService<Events>;

impl ResourceService<Events> {
    /// The next `limit` events starting from now, soonest first. "Now" comes
    /// from the cache store's clock.
    pub async fn upcoming(&self, limit: u32) -> RequestResult<Vec<CampusEvent>> {
        // whole minutes keep the cache key stable between nearby calls
        let now = self.store.clock().now();
        let from = now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now);
        self.upcoming_from(from, limit).await
    }

    pub async fn upcoming_from(
        &self,
        from: DateTime<Utc>,
        limit: u32,
    ) -> RequestResult<Vec<CampusEvent>> {
        let filters = EventFilters {
            from: Some(from),
            limit: Some(limit),
            ..Default::default()
        };
        let mut events = self.list(&filters).await?;
        events.retain(|event| event.starts_at >= from);
        events.sort_by_key(|event| event.starts_at);
        events.truncate(limit as usize);
        Ok(events)
    }
}
