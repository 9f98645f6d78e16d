// Binary transport: a chain of stages performing one file fetch.

pub mod admission;
pub mod http_fetch;
pub mod pipeline;
pub mod retry;

pub use admission::AdmissionStage;
pub use http_fetch::HttpFetchStage;
pub use pipeline::{FetchRequest, FetchResponse, Next, Pipeline, ProgressFn, TransportStage};
pub use retry::RetryStage;
