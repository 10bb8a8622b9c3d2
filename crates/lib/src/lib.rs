//! Ponte core library — messaging channel adapters, the auto-reply engine
//! (FAQ matching, language pivot, generative fallback), and the dashboard
//! gateway used by the CLI.

pub mod accounts;
pub mod channels;
pub mod config;
pub mod dedup;
pub mod embedding;
pub mod faq;
pub mod gateway;
pub mod language;
pub mod llm;
pub mod media;
pub mod resolver;
pub mod sweep;
