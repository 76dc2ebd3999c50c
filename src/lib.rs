pub mod actor;
pub mod attribute;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod health;
pub mod mqtt;
pub mod publish;
pub mod sample;
pub mod scheduler;
pub mod settings;
pub mod store;
pub mod watchdog;

// Re-export commonly used items
pub use actor::{Command, EngineHandle};
pub use attribute::{Attribute, AttributeValue, Event, EventBatch, Target};
pub use config::Config;
pub use engine::{Engine, Snapshot};
pub use error::{AppError, Result};
pub use sample::Sample;
pub use settings::Settings;
