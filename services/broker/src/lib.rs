// Library surface of the crossbard daemon, split out so integration tests
// can assemble the same broker the binary runs.
pub mod config;
pub mod observability;
pub mod service;
