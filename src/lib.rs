//! Provides safe, asynchronous (tokio based), single-flight call coalescing
//! with group-aware cancellation.
//!
//! If independent callers may concurrently request the same expensive
//! asynchronous operation, [`Coalesce`] ensures they share exactly one
//! underlying execution while it is in flight. The shared entry is discarded
//! the moment that execution settles, whatever the outcome, so this is
//! deduplication of concurrent work, not a result cache: a call arriving
//! after settlement always runs afresh, and a failed call never poisons its
//! key.
//!
//! An example will probably make usage clear.
//!
//! We have an arbitrarily slow retrieval keyed by a `String`. We wrap it once
//! and invoke it concurrently; however many callers pile onto the same key,
//! the retrieval runs once for all of them.
//!
//! Example 1
//! ```
//! use std::convert::Infallible;
//!
//! use coalesce::CallFuture;
//! use coalesce::Coalesce;
//!
//! #[tokio::main]
//! async fn main() {
//!     let fetch = |key: String| -> CallFuture<String, Infallible> {
//!         Box::pin(async move {
//!             tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
//!             Ok(format!("fetched {key}"))
//!         })
//!     };
//!     let coalesce = Coalesce::new(fetch);
//!
//!     let (first, second) = tokio::join!(
//!         coalesce.invoke("a".to_string()),
//!         coalesce.invoke("a".to_string()),
//!     );
//!     assert_eq!(first.unwrap(), "fetched a");
//!     assert_eq!(second.unwrap(), "fetched a");
//!     assert_eq!(coalesce.coalesced_count(), 1);
//! }
//! ```
//!
//! Callers can also abandon a shared call independently. Each caller carries
//! its own [`AbortSignal`] inside the call arguments and a
//! [`SignalAccessors`] pair tells the wrapper where to find it. Aborting one
//! caller's handle fails only that caller's view with
//! [`CallError::Aborted`]; the underlying operation is handed a composed
//! signal which fires only once every joined caller has given up, and it may
//! react to that cooperatively or ignore it entirely.
//!
//! Example 2
//! ```
//! use coalesce::AbortHandle;
//! use coalesce::AbortSignal;
//! use coalesce::CallError;
//! use coalesce::CallFuture;
//! use coalesce::Coalesce;
//! use coalesce::SignalAccessors;
//!
//! #[derive(Clone)]
//! struct Request {
//!     url: String,
//!     signal: Option<AbortSignal>,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let fetch = |request: Request| -> CallFuture<String, std::io::Error> {
//!         Box::pin(async move {
//!             // A cooperative operation would select against request.signal
//!             // here; this one just takes its time.
//!             tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
//!             Ok(request.url)
//!         })
//!     };
//!     let coalesce = Coalesce::with_key_fn(fetch, |request: &Request| request.url.clone())
//!         .with_signal_accessors(SignalAccessors::new(
//!             |request: &Request| request.signal.clone(),
//!             |signal, mut request: Request| {
//!                 request.signal = Some(signal);
//!                 request
//!             },
//!         ));
//!
//!     let handle = AbortHandle::new();
//!     let pending = coalesce.invoke(Request {
//!         url: "https://example.com".to_string(),
//!         signal: Some(handle.signal()),
//!     });
//!     handle.abort();
//!     assert!(matches!(pending.await, Err(CallError::Aborted)));
//! }
//! ```
mod coalesce;
mod signal;
mod store;

pub use crate::coalesce::CallError;
pub use crate::coalesce::CallFuture;
pub use crate::coalesce::Coalesce;
pub use crate::coalesce::Operation;
pub use crate::coalesce::SharedCall;
pub use crate::signal::AbortHandle;
pub use crate::signal::AbortSignal;
pub use crate::signal::SignalAccessors;
pub use crate::store::CallStore;
