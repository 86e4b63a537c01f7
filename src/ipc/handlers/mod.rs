pub mod attempts;
pub mod backup;
pub mod capabilities;
pub mod catalog;
pub mod core;
pub mod dashboard;
pub mod lessons;
pub mod sessions;
pub mod students;
