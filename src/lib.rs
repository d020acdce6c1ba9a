pub mod auth;
pub mod cascade;
pub mod compactor;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod projector;
pub mod site;
pub mod slots;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
