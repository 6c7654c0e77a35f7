//! Network primitives shared by the transport and auth crates: a
//! cancellation-aware `text/event-stream` reader and a thin retrying HTTP
//! client wrapper built on `reqwest`.

pub mod http;
pub mod sse;

pub use http::{HttpClient, HttpClientConfig, HttpResponse};
pub use sse::{SseEvent, SseReader};
