/// Read-only collaborators supplying roster membership and goal definitions.
pub mod collaborators;
/// Database model definitions.
pub mod models;
/// Storage abstraction layer for database operations.
pub mod storage;
/// Session and event storage and retrieval operations.
pub mod tracking_store;
