pub mod banscore;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod stratum;
pub mod upstream;
pub mod vardiff;
