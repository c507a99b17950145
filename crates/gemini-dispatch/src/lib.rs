//! Rate-limited, retrying request dispatch for the Gemini client core
//!
//! Sits between callers and the wire, pairing the auth layer with adaptive
//! rate limiting and a retry coordinator. `dispatcher::Dispatcher::call` is
//! the single entry point for a request:
//!
//! 1. Rate-limiter capacity is reserved for the resource key, with denials
//!    waited out according to the limiter's suggested waits
//! 2. Fresh auth headers are attached and the request executes over the
//!    `transport::Transport` seam
//! 3. Failures classify as fatal, transient, rate-limited, or auth-expired;
//!    the retry coordinator backs off accordingly, with server retry hints
//!    taking precedence over local delays
//! 4. The permit is released with the terminal outcome, feeding server
//!    hints back into future admission decisions
//!
//! Streaming calls ride the same path and resume from the last
//! cursor-bearing event when a stream drops midway.

pub mod classify;
pub mod dispatcher;
pub mod error;
pub mod limiter;
pub mod retry;
pub mod transport;

pub use classify::ErrorClass;
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use limiter::{Acquired, LimiterConfig, Outcome, Permit, RateLimiterManager};
pub use retry::{RetryCoordinator, RetryPolicy};
pub use transport::{
    ApiRequest, ApiResponse, EventStream, HttpTransport, StreamEvent, StreamStart, Transport,
    TransportError,
};
