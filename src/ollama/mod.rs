//! Ollama LLM integration
//!
//! Only the chat endpoint is used; each generation role is a system prompt
//! plus one user turn sent through [`ChatClient`].

pub mod chat;

pub use chat::{ChatClient, ChatError, ChatMessage, ChatResponse};
