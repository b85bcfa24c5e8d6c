pub mod config;
pub mod criterion;
pub mod dataset;
pub mod error;
pub mod metrics;
pub mod model;
pub mod profile;
pub mod validate;
