//! Translation between the OpenAI wire format and the proxy's chat types.
//!
//! Request normalization, completion envelopes and stream framing. All
//! translation functions are pure (no I/O).

pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
