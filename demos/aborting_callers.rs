use std::sync::Arc;
use std::time::Duration;

use coalesce::AbortHandle;
use coalesce::AbortSignal;
use coalesce::CallFuture;
use coalesce::Coalesce;
use coalesce::SignalAccessors;

use thiserror::Error;

#[derive(Clone)]
struct Request {
    url: &'static str,
    signal: Option<AbortSignal>,
}

#[derive(Debug, Error)]
#[error("fetch stopped")]
struct FetchStopped;

/// A cooperative fetch: it works in small steps and gives up once the
/// composed signal fires, i.e. once every caller still joined has aborted.
fn fetch(request: Request) -> CallFuture<String, FetchStopped> {
    Box::pin(async move {
        let signal = request.signal.expect("coalesce threads a signal in");
        for step in 1..=10 {
            if signal.is_aborted() {
                println!("fetch: every caller gave up, stopping at step {step}");
                return Err(FetchStopped);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            println!("fetch: step {step} of 10 for {}", request.url);
        }
        Ok(format!("contents of {}", request.url))
    })
}

/// Two callers share one fetch. The first aborts early and fails alone; the
/// second aborts later, completing the group, and the fetch is told to stop.
#[tokio::main]
async fn main() {
    let coalesce = Arc::new(
        Coalesce::with_key_fn(fetch, |request: &Request| request.url).with_signal_accessors(
            SignalAccessors::new(
                |request: &Request| request.signal.clone(),
                |signal, mut request: Request| {
                    request.signal = Some(signal);
                    request
                },
            ),
        ),
    );

    let first = AbortHandle::new();
    let second = AbortHandle::new();

    let mut waiters = vec![];
    for (name, handle) in [("first", &first), ("second", &second)] {
        let my_coalesce = coalesce.clone();
        let signal = handle.signal();
        waiters.push(tokio::spawn(async move {
            let outcome = my_coalesce
                .invoke(Request {
                    url: "https://example.com",
                    signal: Some(signal),
                })
                .await;
            println!("{name} caller finished with: {outcome:?}");
        }));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("aborting first caller; the fetch keeps running");
    first.abort();

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("aborting second caller; the group is now complete");
    second.abort();

    for waiter in waiters {
        waiter.await.expect("caller task");
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("in flight after teardown: {}", coalesce.in_flight());
}
