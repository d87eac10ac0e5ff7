pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod redis_client;
pub mod repository;
pub mod service;
