use async_trait::async_trait;

use crate::client::{DriveClient, DriveError};
use crate::model::{AboutSnapshot, ChangeListPage};

/// Remote operations the sync core depends on.
///
/// Listings are paginated: callers pass the previous page's
/// `next_page_token` until a page comes back without one.
#[async_trait]
pub trait DriveService: Send + Sync {
    async fn fetch_about(&self) -> Result<AboutSnapshot, DriveError>;

    async fn fetch_changelist(
        &self,
        start_change_stamp: i64,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError>;

    async fn fetch_directory_children(
        &self,
        directory_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError>;
}

#[async_trait]
impl DriveService for DriveClient {
    async fn fetch_about(&self) -> Result<AboutSnapshot, DriveError> {
        self.get_about().await
    }

    async fn fetch_changelist(
        &self,
        start_change_stamp: i64,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError> {
        self.list_changes(start_change_stamp, page_token).await
    }

    async fn fetch_directory_children(
        &self,
        directory_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChangeListPage, DriveError> {
        self.list_children(directory_id, page_token).await
    }
}
