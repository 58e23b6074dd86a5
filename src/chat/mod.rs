pub mod bridge;
pub mod ingest;
pub mod messages;
