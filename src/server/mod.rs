pub mod ai_groups;
pub mod auth;
pub mod config;
pub mod connection;
pub mod database;
pub mod error;
pub mod groups;
pub mod join_requests;
pub mod matching;
pub mod notifications;
pub mod suggestions;
pub mod users;
