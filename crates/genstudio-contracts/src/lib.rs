pub mod api;
pub mod events;
pub mod jobs;
pub mod media;
pub mod models;
