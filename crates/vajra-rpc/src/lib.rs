pub mod codec;
pub mod messages;

pub use codec::{call, Connection, RpcError, CONTROL_CALL_TIMEOUT, HEARTBEAT_CALL_TIMEOUT};
pub use messages::{Request, Response};
