pub mod about_loader;
pub mod backoff;
pub mod change_list_loader;
#[cfg(test)]
pub(crate) mod fake_service;
pub mod loader_controller;
pub mod metadata;
pub mod metadata_store;
