pub mod analysis;
pub mod cleaning;
pub mod config;
pub mod engine;
pub mod error;
pub mod imputation;
pub mod ingestion;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod schema;
pub mod weather;
pub mod zones;
