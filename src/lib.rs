pub mod config;
pub mod fetch;
pub mod ingest;
pub mod logging;
pub mod merge;
pub mod model;
pub mod normalize;
pub mod store;
