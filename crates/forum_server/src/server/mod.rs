#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod error;
pub mod health;
pub mod http;
pub mod hub;
pub mod presence;
pub mod router;
pub mod state;
pub mod store;

#[cfg(test)]
mod connection_tests;



#[cfg(test)]
mod presence_tests;
