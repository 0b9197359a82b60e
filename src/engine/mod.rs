pub mod access;
pub mod bridge;
pub mod config;
pub mod deleted;
pub mod http;
pub mod sessions;
pub mod telegram;
pub mod whatsapp;
