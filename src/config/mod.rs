//! Client configuration: schema and persistent store

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
