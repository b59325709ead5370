mod config;
mod providers;
mod router;
mod routing;
mod secrets;
mod types;

pub use config::BrainConfig;
pub use providers::{
    ChatProvider, CloudOpenAiProvider, LocalOllamaProvider, ProviderCall, ProviderError,
    ProviderResult,
};
pub use router::{BrainError, BrainRouter, CallContext};
pub use routing::{
    decide_route, redact_secrets, sanitize_context_items, summarize_items_by_source, ContextItem,
    PolicyFlags, Route, RoutingDecision, SanitizationResult, Sensitivity, SourceType,
    FINANCIAL_APPROVAL_SCOPE,
};
pub use secrets::Secrets;
pub use types::{ChatMessage, LlmRequest, LlmResponse, LlmStatus, RenderMessages};
