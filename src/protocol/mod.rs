pub mod envelope;
pub mod jsonrpc;

pub use envelope::{Envelope, EnvelopeKind, ErrorInfo};
pub use jsonrpc::{JsonRpcError, JsonRpcFrame, JsonRpcId};

/// Built-in method names resolved by the dispatcher.
pub mod methods {
    pub const PING: &str = "ping";
    pub const HANDLERS_LIST: &str = "handlers/list";
    pub const HANDLERS_INVOKE: &str = "handlers/invoke";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
}
