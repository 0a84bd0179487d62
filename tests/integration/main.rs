//! Integration tests: announcement cycles, matching passes and trigger
//! serialization against in-memory collaborators.

mod announce;
mod concurrency;
mod mock_backend;
