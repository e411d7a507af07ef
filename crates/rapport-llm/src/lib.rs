pub mod chat;
pub mod reliable;

pub mod mock;

pub use chat::ChatCompletionsProvider;
pub use mock::{MockProvider, MockResponse};
pub use reliable::{ReliableConfig, ReliableProvider};
