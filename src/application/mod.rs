//! Application services layer: errors, repositories, passwords, JSON and tasks.

pub mod error;
pub mod json;
pub mod passwords;
pub mod repos;
pub mod tasks;
