//! Tutoring-simulation bench: provisions conversations against a Tutoring
//! API, drives them with generated tutor messages, and records batches,
//! transcripts, and evaluation scores in SQLite.

pub mod batch;
pub mod config;
pub mod db;
pub mod driver;
pub mod generate;
pub mod handlers;
pub mod model;
pub mod tutor;
