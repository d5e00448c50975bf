//! Risk scoring and chat safety monitoring for school student wellbeing.
//!
//! [`scorer::RiskScorer`] folds attendance, academic, fee and chat signals
//! into a green/amber/red classification. [`safety::SafetyMonitor`] screens
//! chat messages for self-harm keywords, raises SOS incidents and enforces
//! message retention.

pub mod config;
pub mod db;
pub mod error;
pub mod locks;
pub mod memory;
pub mod models;
pub mod notify;
pub mod report;
pub mod risk;
pub mod safety;
pub mod scheduler;
pub mod scorer;
pub mod store;
