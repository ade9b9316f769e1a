//! Build bot services: storage, publishing, and the ingest/retrieval flows.

pub mod content_type;
pub mod github_service;
pub mod ingest_service;
pub mod object_store;
pub mod publisher;
pub mod retrieval_service;
pub mod s3_store;
