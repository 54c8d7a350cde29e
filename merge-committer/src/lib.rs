pub mod checkpoint;
pub mod commit;
pub mod config;
pub mod controller;
pub mod dedup;
pub mod error;
pub mod event;
pub mod lock;
pub mod merge;
pub mod metrics_consts;
pub mod position;
pub mod retry;
pub mod schema;
pub mod server;
pub mod source;
pub mod sql;
pub mod store;
pub mod test_utils;
pub mod timestamp;
pub mod window;
