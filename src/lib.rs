pub mod application;
pub mod assignment;
pub mod config;
pub mod decision;
pub mod error;
pub mod final_approval;
pub mod issue;
pub mod registry;
pub mod revocation;
pub mod service;
pub mod statistics;
pub mod store;
pub mod threads;
pub mod types;
pub mod utils;
