mod common;
mod dormant_database;
mod elasticsearch;
mod elasticsearch_version;
mod snapshot;

pub use common::*;
pub use dormant_database::*;
pub use elasticsearch::*;
pub use elasticsearch_version::*;
pub use snapshot::*;
