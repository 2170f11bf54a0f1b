mod client;
mod model;
mod service;

pub use client::{ApiErrorClass, DriveClient, DriveError};
pub use model::{AboutSnapshot, ChangeEntry, ChangeListPage};
pub use service::DriveService;
