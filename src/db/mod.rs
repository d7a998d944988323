//! Database layer: entity definitions, the schema registry built from them,
//! and the runtime session provider.

pub mod models;
pub mod schema;
pub mod session;

pub use models::metadata;
pub use schema::{Entity, SchemaError, SchemaRegistry};
pub use session::{AcquirePolicy, PoolStatus, Session, SessionProvider};
