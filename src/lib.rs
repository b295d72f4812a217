pub mod config;
pub mod enrich;
pub mod error;
pub mod fake_feed;
pub mod feed;
pub mod http_client;
pub mod ingest;
pub mod lifecycle;
pub mod rest;
pub mod state;
pub mod store;
pub mod transport;
pub mod view;
pub mod wire;
