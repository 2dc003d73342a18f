pub mod connection;
pub mod decoder;
pub mod types;


pub use connection::{ReplicationConnection, ReplicationStream};
pub use decoder::{ColumnInfo, PgOutputDecoder, RelationInfo};
pub use types::{DecodedEvent, Tuple};
