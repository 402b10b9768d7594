// Library for tests to access modules

pub mod agent;
pub mod alert;
pub mod checker;
pub mod config;
pub mod connectivity;
pub mod deferred;
pub mod error;
pub mod executor;
pub mod health;
pub mod models;
pub mod runtime;
pub mod window;
