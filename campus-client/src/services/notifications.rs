use std::time::Duration;

use campus_core::{
    ApiRequest, EntityId, NewNotification, Notification, NotificationFilters, NotificationUpdate,
    RequestResult, UnreadCount,
};

use super::{decode, Resource, ResourceService};

#[derive(Debug, Clone, Copy)]
pub struct Notifications;

impl Resource for Notifications {
    const NAME: &'static str = "notifications";
    const PATH: &'static str = "/api/notifications";
    const TTL: Duration = Duration::from_secs(2 * 60);

    type Entity = Notification;
    type Filters = NotificationFilters;
    type Create = NewNotification;
    type Update = NotificationUpdate;
}

pub type NotificationsService = ResourceService<Notifications>;

impl ResourceService<Notifications> {
    pub async fn mark_read(&self, id: EntityId) -> RequestResult<Notification> {
        let request = ApiRequest::put(format!("{}/{}/read", Notifications::PATH, id));
        decode(self.write(request).await?)
    }

    pub async fn mark_all_read(&self) -> RequestResult<()> {
        let request = ApiRequest::put(format!("{}/read-all", Notifications::PATH));
        self.write(request).await?;
        Ok(())
    }

    /// Unread notifications for the session user. Served from the local
    /// cache while offline.
    pub async fn unread_count(&self) -> RequestResult<u64> {
        let request = ApiRequest::get(format!("{}/unread-count", Notifications::PATH));
        let count: UnreadCount = self
            .cached_read("notifications:unread-count", request)
            .await?;
        Ok(count.count)
    }
}
