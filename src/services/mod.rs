pub mod command_publisher;
pub mod config_resolver;
pub mod port_allocator;
pub mod session_handler;

pub use command_publisher::{CommandPublisher, Delivery, PendingReply, ReplyRegistry};
pub use config_resolver::{
    render_strategy, ConfigResolver, RenderedConfiguration, ResolvedConfiguration, VolumeMount,
};
pub use port_allocator::{validate_port, validate_protocol, PortAllocator};
pub use session_handler::{
    build_start_command, ForceOverrideReport, RpcTimeouts, SessionHandler, StartSessionRequest,
};
