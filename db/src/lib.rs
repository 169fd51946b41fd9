pub mod connection;
pub mod enums;
pub mod error;
pub mod events;
pub mod print_jobs;
pub mod schema;

pub use diesel;
pub use error::EdgeDbError;
