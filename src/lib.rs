pub mod adapters;
pub mod api;
pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod messaging;
pub mod persistence;
pub mod services;

pub use config::AppConfig;
pub use error::{ErrorCode, ManmanError, Result};
pub use messaging::{InMemoryBroker, MessageBroker};
pub use persistence::{CatalogRepository, InMemoryStore, PortRepository, SessionRepository};
pub use services::{
    CommandPublisher, ConfigResolver, ForceOverrideReport, PortAllocator, RpcTimeouts,
    SessionHandler, StartSessionRequest,
};
