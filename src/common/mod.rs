pub mod course;
pub mod models;
