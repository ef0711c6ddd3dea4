pub mod config;
pub mod db;
pub mod extract;
pub mod mailbox;
pub mod models;
pub mod net;
pub mod routes;
pub mod services;
