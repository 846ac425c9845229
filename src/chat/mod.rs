mod accumulator;
pub mod error;
pub mod orchestrator;
pub mod state;

pub use accumulator::Accumulator;
pub use error::ChatError;
pub use orchestrator::{
    ExchangeHandle, ExchangeOutcome, OrchestratorConfig, SendOptions, SendRequest,
    StreamingChatOrchestrator,
};
pub use state::{ActiveExchange, ChatEvent, ChatState, ExchangePhase};
