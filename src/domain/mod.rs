pub mod game;
pub mod port;
pub mod session;
pub mod strategy;

pub use game::*;
pub use port::*;
pub use session::*;
pub use strategy::*;
