pub mod ports;
pub mod sessions;
pub mod system;

pub use ports::*;
pub use sessions::*;
pub use system::*;
