//! Advisor integration: prompt assembly, the chat-completions transport,
//! and tolerant response parsing.

pub mod client;
pub mod parser;
pub mod prompt;

pub use client::{AdvisorClient, AdvisorConfig, AdvisorError};
pub use parser::parse_response;
pub use prompt::{build_system_prompt, build_user_prompt};
