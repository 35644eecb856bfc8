pub mod health;
pub mod jobs;
pub mod packages;
pub mod report;
pub mod rules;
pub mod stats;
