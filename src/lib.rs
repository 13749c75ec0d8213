//! Switchboard: a terminal chat client that lets an LLM call tools on a
//! fleet of MCP backends reached over piped scripts, launched commands or
//! event streams.

pub mod api;
pub mod cli;
pub mod commands;
pub mod core;
pub mod mcp;
pub mod utils;
