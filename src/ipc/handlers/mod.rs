pub mod auth;
pub mod backup;
pub mod changes;
pub mod core;
pub mod events;
pub mod members;
pub mod questionnaires;
pub mod reports;
pub mod responses;
pub mod schedules;
pub mod setup;
pub mod students;
