//! Multi-agent code review over a quantized GGUF model, or over any
//! OpenAI-compatible completion server.

pub mod backend;
pub mod batch;
pub mod completion;
pub mod config;
pub mod engine;
pub mod prompting;
pub mod remote;
pub mod report;
pub mod sampling;

#[cfg(test)]
mod testing;
