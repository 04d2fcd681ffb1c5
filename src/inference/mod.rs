pub mod forward;
pub mod kv_cache;
pub mod params;
pub mod sampler;
pub mod templates;

pub use forward::ForwardSession;
pub use kv_cache::KvCache;
pub use params::SamplingParams;
pub use sampler::Sampler;
pub use templates::{apply_chat_template, ChatMessage, TemplateType};
