// Library exports for integration testing
//
// This file exposes internal modules for integration tests while keeping
// the binary entrypoint in main.rs

pub mod builder;
pub mod conditions;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod error;
pub mod events;
pub mod index;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod verify;

// Re-export commonly used types for testing
pub use error::ReconcileError;
pub use index::{ChangeIndex, ObjectKey};
pub use models::{Artifact, HelmChart, HelmRepository, OCIRepository};
pub use queue::WorkQueue;
pub use storage::Storage;
