pub mod collector;
pub mod config;
pub mod error;
pub mod exchange;
pub mod file_pool;
pub mod http;
pub mod pair;
pub mod pair_manager;
pub mod reactive;
pub mod repository;
pub mod ws;

pub use collector::DataCollector;
pub use config::Config;
pub use error::{Error, Result};
pub use exchange::ExchangeClient;
pub use file_pool::FileWriterPool;
pub use pair::{Pair, PairChange, PairQuery, PairStatus};
pub use pair_manager::PairManager;
pub use repository::Repository;
