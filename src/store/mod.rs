pub mod collaborators;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod row_stream;
pub mod traits;
pub mod validation;

pub use collaborators::*;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use records::*;
pub use row_stream::*;
pub use traits::*;
