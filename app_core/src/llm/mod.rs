pub mod gateway;

pub use gateway::{LlmGateway, LlmRequest, LlmResponse, TextGenerator};
