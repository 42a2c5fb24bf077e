pub mod bulk;
pub mod config;
pub mod database_ops;
pub mod error;

pub mod util {
    pub mod db;
    pub mod env;
    pub mod logging;
}

pub use error::{ImportError, Result};
