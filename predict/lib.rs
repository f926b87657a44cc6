#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod encode;
pub mod frame;
pub mod input;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod recipes;

#[cfg(test)]
mod test_fixtures;
