#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "mock")]
pub use mock::{ScriptedProvider, ScriptedTurn};
#[cfg(feature = "openai")]
pub use openai::OpenAIProvider;
