#![doc = include_str!("../README.md")]

pub mod backend;
pub mod error;
pub mod resource;
pub mod signal;
pub mod stage_traits;
pub mod task;
pub mod ticket;
pub mod timer;
pub mod types;
pub mod worker;
