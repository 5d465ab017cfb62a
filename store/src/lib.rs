mod error;
mod postgres;
mod stream;

pub use error::{Error, Result};
pub use postgres::Postgres;
pub use stream::{JobMessage, JobStream};
