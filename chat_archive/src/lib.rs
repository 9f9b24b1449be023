pub mod bridge;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod folders;
pub mod hasher;
pub mod live;
pub mod maintenance;
pub mod media;
pub mod model;
pub mod runner;
pub mod source;
pub mod store;
pub mod sync;
pub mod timefmt;

pub use error::ArchiveError;
pub use source::MessageSource;
pub use store::Store;
pub use sync::{Archiver, StopPolicy};
