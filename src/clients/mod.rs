pub mod openai_client;
pub mod provider;

pub use openai_client::OpenAiProvider;
pub use provider::{ProviderClient, ProviderResponse};
