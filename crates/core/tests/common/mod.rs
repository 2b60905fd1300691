#![allow(dead_code)]

pub mod mock_agent;

pub use mock_agent::*;
