//! API translation between the OpenAI and Gemini formats.
//!
//! The core of the proxy: converts requests, responses, and streaming results
//! between the two API formats. All translation functions are pure (no I/O).

pub mod gemini_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
