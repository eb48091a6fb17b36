pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod models;
pub mod services;

pub use config::Config;
pub use error::{AppError, AppResult};
