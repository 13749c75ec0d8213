pub mod catalog;
pub mod config;
pub mod conversation;
pub mod llm;
pub mod router;
