pub mod api;
pub mod config;
pub mod controllers;
pub mod equality;
pub mod objects;
pub mod store;
pub mod util;

#[cfg(test)]
pub mod fixtures;
