pub mod amqp;
pub mod postgres;
pub mod transaction_manager;

pub use amqp::AmqpBroker;
pub use postgres::PostgresStore;
pub use transaction_manager::{ManagedTransaction, TransactionManager, TransactionScope};
