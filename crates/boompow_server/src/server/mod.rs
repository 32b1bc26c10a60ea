#![forbid(unsafe_code)]

pub mod events;
pub mod health;
pub mod http;
pub mod hub;
pub mod notifier;
pub mod stats;
pub mod supervisor;

#[cfg(test)]
mod http_tests;


#[cfg(test)]
mod pipeline_tests;
