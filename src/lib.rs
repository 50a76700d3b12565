pub mod clock;
pub mod command;
pub mod config;
pub mod configure;
pub mod http;
pub mod ledger;
pub mod provision;
pub mod reconcile;
pub mod scheduler;
pub mod topology;
pub mod version;
