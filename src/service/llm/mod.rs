//! LLM plane: chat client, chunking, JSON repair, request queue, worker.

pub mod chunking;
pub mod client;
pub mod json_repair;
pub mod queue;
pub mod worker;

pub use chunking::{chunk_document, count_tokens, DocumentChunk};
pub use client::{LlmClient, LlmClientConfig};
pub use queue::{LlmRequest, LlmRequestQueue, LlmResponse, LlmResponseStatus};
pub use worker::{ConcurrencyConfig, DynamicLimiter, LlmWorker, LlmWorkerConfig};
