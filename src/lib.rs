// src/lib.rs
pub mod banner;
pub mod command;
pub mod config;
pub mod errors;
pub mod interpreter;
pub mod limits;
pub mod listeners;
pub mod model;
pub mod question;
pub mod sandbox;
pub mod storage;
pub mod task;
pub mod test_model;
pub mod validation;

#[cfg(test)]
mod testing;
