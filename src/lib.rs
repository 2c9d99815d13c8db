pub mod config;
pub mod error;
pub mod future;
pub mod group;
pub mod manager;
pub mod node;
pub mod routine;
mod test;
pub mod utils;

pub mod prelude;
