pub mod config;
pub mod db;
pub mod dispatch;
pub mod model;
pub mod push;
pub mod realtime;
pub mod server;
pub mod sweeper;
