//! Truss assembles an axum application from typed settings: database, password hashing,
//! login management, optional admin UI and debug toolbar, the `main` blueprint, a
//! reverse-proxy adapter and a task-queue client.

pub mod app;
pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod presentation;
