use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::future::Shared;
use futures::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

use crate::signal::SignalAccessors;
use crate::signal::SignalGroup;
use crate::store::CallStore;

/// Boxed future returned by a wrapped operation.
pub type CallFuture<V, E> = Pin<Box<dyn Future<Output = Result<V, E>> + Send>>;

/// The shared pending result registered for a key while a call is in flight.
///
/// Every caller that coalesces onto a key holds a clone of the same shared
/// future. Values of this type may also be placed in a custom [`CallStore`]
/// to seed a key before the first call.
pub type SharedCall<V, E> = Shared<BoxFuture<'static, Result<V, CallError<E>>>>;

/// Coalescing errors.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// This caller's own abort signal fired before the shared call settled.
    /// The shared call keeps running for any other waiters.
    #[error("call aborted")]
    Aborted,
    /// The underlying operation failed. Every waiter on the key observes the
    /// same error.
    #[error("operation failed")]
    Failed(Arc<E>),
    /// The underlying operation panicked or its task was cancelled before it
    /// could settle.
    #[error("operation did not settle")]
    Lost,
}

impl<E> Clone for CallError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Aborted => Self::Aborted,
            Self::Failed(error) => Self::Failed(Arc::clone(error)),
            Self::Lost => Self::Lost,
        }
    }
}

/// A wrapped operation expressed as a trait rather than a closure.
#[async_trait::async_trait]
pub trait Operation: Send + Sync {
    /// Call arguments. With [`Coalesce::from_operation`] these double as the
    /// coalescing key.
    type Args: Send;
    /// Success value.
    type Value: Send;
    /// Failure value.
    type Error: Send;

    async fn call(&self, args: Self::Args) -> Result<Self::Value, Self::Error>;
}

// Both registries live behind one lock so a call entry and its signal group
// are created and evicted together, with no window where only one exists.
struct Registries<K, V, E> {
    calls: Box<dyn CallStore<K, SharedCall<V, E>> + Send>,
    groups: HashMap<K, SignalGroup>,
}

/// Single-flight coalescing for an asynchronous operation.
///
/// Concurrent calls whose arguments derive equal keys share one execution of
/// the underlying operation; the shared entry is evicted as soon as that
/// execution settles, whatever the outcome. This deduplicates concurrent
/// work only: a call arriving after settlement always starts a fresh
/// execution.
///
/// With [signal accessors](Coalesce::with_signal_accessors) configured, each
/// caller may attach its own [`AbortSignal`](crate::AbortSignal). Aborting it
/// fails only that caller's view of the call; the operation itself is told to
/// stop, through the composed signal written into its arguments, only once
/// every joined caller has aborted.
///
/// Clones share the same registries, so a `Coalesce` can be handed to many
/// tasks cheaply. Independently constructed instances never share state.
pub struct Coalesce<A, K, V, E> {
    op: Arc<dyn Fn(A) -> CallFuture<V, E> + Send + Sync>,
    key_of: Arc<dyn Fn(&A) -> K + Send + Sync>,
    accessors: Option<Arc<SignalAccessors<A>>>,
    registries: Arc<Mutex<Registries<K, V, E>>>,
    calls_total: Arc<AtomicU64>,
    calls_coalesced: Arc<AtomicU64>,
}

impl<A, K, V, E> Clone for Coalesce<A, K, V, E> {
    fn clone(&self) -> Self {
        Self {
            op: Arc::clone(&self.op),
            key_of: Arc::clone(&self.key_of),
            accessors: self.accessors.clone(),
            registries: Arc::clone(&self.registries),
            calls_total: Arc::clone(&self.calls_total),
            calls_coalesced: Arc::clone(&self.calls_coalesced),
        }
    }
}

impl<K, V, E> Coalesce<K, K, V, E>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a coalescer whose key is the call argument itself.
    pub fn new<G>(op: G) -> Self
    where
        G: Fn(K) -> CallFuture<V, E> + Send + Sync + 'static,
    {
        Self::with_key_fn(op, K::clone)
    }

    /// Create a coalescer from an [`Operation`] implementation, keyed by the
    /// call argument itself.
    pub fn from_operation<O>(op: O) -> Self
    where
        O: Operation<Args = K, Value = V, Error = E> + 'static,
    {
        let op = Arc::new(op);
        Self::new(move |args: K| -> CallFuture<V, E> {
            let op = Arc::clone(&op);
            Box::pin(async move { op.call(args).await })
        })
    }
}

impl<A, K, V, E> Coalesce<A, K, V, E>
where
    A: 'static,
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a coalescer with a custom key derivation function.
    ///
    /// `key_of` must be deterministic and side-effect free: calls which
    /// should share one execution must derive keys that are equal by `Eq`
    /// and `Hash`.
    pub fn with_key_fn<G, F>(op: G, key_of: F) -> Self
    where
        G: Fn(A) -> CallFuture<V, E> + Send + Sync + 'static,
        F: Fn(&A) -> K + Send + Sync + 'static,
    {
        Self {
            op: Arc::new(op),
            key_of: Arc::new(key_of),
            accessors: None,
            registries: Arc::new(Mutex::new(Registries {
                calls: Box::new(HashMap::new()),
                groups: HashMap::new(),
            })),
            calls_total: Arc::new(AtomicU64::new(0)),
            calls_coalesced: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Replace the call registry storage, typically with a pre-populated
    /// map. An existing entry for a key is returned to callers as-is, without
    /// invoking the underlying operation.
    pub fn with_store<S>(self, store: S) -> Self
    where
        S: CallStore<K, SharedCall<V, E>> + Send + 'static,
    {
        self.registries.lock().calls = Box::new(store);
        self
    }

    /// Enable cancellation composition through the given accessor pair.
    pub fn with_signal_accessors(mut self, accessors: SignalAccessors<A>) -> Self {
        self.accessors = Some(Arc::new(accessors));
        self
    }

    /// Call the underlying operation, coalescing with any in-flight call
    /// that derives the same key.
    ///
    /// Must be called within a tokio runtime: the operation runs on its own
    /// task so it settles, and the registries are cleaned up, even if every
    /// caller has gone away.
    pub async fn invoke(&self, args: A) -> Result<V, CallError<E>> {
        self.calls_total.fetch_add(1, Ordering::SeqCst);
        let key = (self.key_of)(&args);
        let caller_signal = self.accessors.as_ref().and_then(|acc| (acc.get)(&args));

        // Lookup, group membership and insertion happen in one synchronous
        // critical section: two callers racing on the same key must never
        // both conclude they are first.
        let pending = {
            let mut registries = self.registries.lock();
            match registries.calls.get(&key) {
                Some(pending) => {
                    self.calls_coalesced.fetch_add(1, Ordering::SeqCst);
                    trace!("joining in-flight call");
                    if self.accessors.is_some() {
                        if let Some(signal) = &caller_signal {
                            registries
                                .groups
                                .entry(key)
                                .or_default()
                                .join(signal.clone());
                        }
                    }
                    pending
                }
                None => {
                    trace!("starting shared call");
                    let args = match &self.accessors {
                        Some(accessors) => {
                            let group = registries.groups.entry(key.clone()).or_default();
                            if let Some(signal) = &caller_signal {
                                group.join(signal.clone());
                            }
                            (accessors.set)(group.signal(), args)
                        }
                        None => args,
                    };

                    let task = tokio::spawn((self.op)(args));
                    let (publish, settled) = oneshot::channel();
                    let shared_registries = Arc::clone(&self.registries);
                    let evict_key = key.clone();
                    tokio::spawn(async move {
                        let outcome = match task.await {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(error)) => Err(CallError::Failed(Arc::new(error))),
                            Err(_) => Err(CallError::Lost),
                        };
                        // Evict before publishing: a caller that observes the
                        // settled result and calls again must start a fresh
                        // execution, not find a stale entry.
                        let mut registries = shared_registries.lock();
                        registries.calls.delete(&evict_key);
                        if let Some(group) = registries.groups.remove(&evict_key) {
                            group.retire();
                        }
                        drop(registries);
                        trace!("call settled, registry entries evicted");
                        let _ = publish.send(outcome);
                    });

                    let pending: SharedCall<V, E> = async move {
                        match settled.await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(CallError::Lost),
                        }
                    }
                    .boxed()
                    .shared();
                    registries.calls.set(key, pending.clone());
                    pending
                }
            }
        };

        match caller_signal {
            Some(signal) => {
                tokio::select! {
                    outcome = pending => outcome,
                    () = signal.aborted() => Err(CallError::Aborted),
                }
            }
            None => pending.await,
        }
    }

    /// Number of calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.registries.lock().calls.len()
    }

    /// Total number of calls made through this instance.
    pub fn call_count(&self) -> u64 {
        self.calls_total.load(Ordering::SeqCst)
    }

    /// Number of calls which joined an already in-flight execution.
    pub fn coalesced_count(&self) -> u64 {
        self.calls_coalesced.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::AbortHandle;
    use crate::signal::AbortSignal;
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    fn slow_echo(invocations: Arc<AtomicUsize>) -> impl Fn(String) -> CallFuture<String, Infallible> {
        move |key: String| -> CallFuture<String, Infallible> {
            invocations.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                sleep(Duration::from_millis(100)).await;
                Ok(key)
            })
        }
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let coalesce = Arc::new(Coalesce::new(slow_echo(invocations.clone())));

        let mut waiters = vec![];
        for _ in 0..10 {
            let coalesce = coalesce.clone();
            waiters.push(tokio::spawn(
                async move { coalesce.invoke("a".to_string()).await },
            ));
        }
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), "a");
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(coalesce.call_count(), 10);
        assert_eq!(coalesce.coalesced_count(), 9);
        assert_eq!(coalesce.in_flight(), 0);
    }

    #[tokio::test]
    async fn settled_results_are_never_reused() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let coalesce = Coalesce::new(slow_echo(invocations.clone()));

        assert_eq!(coalesce.invoke("a".to_string()).await.unwrap(), "a");
        assert_eq!(coalesce.invoke("a".to_string()).await.unwrap(), "a");

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
        assert_eq!(coalesce.coalesced_count(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_coalesce() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let coalesce = Arc::new(Coalesce::new(slow_echo(invocations.clone())));

        let a = tokio::spawn({
            let coalesce = coalesce.clone();
            async move { coalesce.invoke("a".to_string()).await }
        });
        let b = tokio::spawn({
            let coalesce = coalesce.clone();
            async move { coalesce.invoke("b".to_string()).await }
        });
        assert_eq!(a.await.unwrap().unwrap(), "a");
        assert_eq!(b.await.unwrap().unwrap(), "b");

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn constant_key_fn_coalesces_everything() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let op = slow_echo(invocations.clone());
        let coalesce = Arc::new(Coalesce::with_key_fn(op, |_args: &String| 0u8));

        let a = tokio::spawn({
            let coalesce = coalesce.clone();
            async move { coalesce.invoke("a".to_string()).await }
        });
        sleep(Duration::from_millis(20)).await;
        let b = tokio::spawn({
            let coalesce = coalesce.clone();
            async move { coalesce.invoke("b".to_string()).await }
        });

        // Both callers observe the first caller's execution.
        assert_eq!(a.await.unwrap().unwrap(), "a");
        assert_eq!(b.await.unwrap().unwrap(), "a");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn preseeded_store_entry_is_returned_unchanged() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let op = slow_echo(invocations.clone());

        let mut store: HashMap<String, SharedCall<String, Infallible>> = HashMap::new();
        store.insert(
            "a".to_string(),
            futures::future::ready(Ok("seeded".to_string()))
                .boxed()
                .shared(),
        );
        let coalesce = Coalesce::new(op).with_store(store);

        assert_eq!(coalesce.invoke("a".to_string()).await.unwrap(), "seeded");
        assert_eq!(invocations.load(Ordering::SeqCst), 0);

        // A key the store does not hold still runs the operation.
        assert_eq!(coalesce.invoke("b".to_string()).await.unwrap(), "b");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn failures_are_shared_and_do_not_poison_the_key() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let fail_once = {
            let invocations = invocations.clone();
            move |key: String| -> CallFuture<String, Boom> {
                let first = invocations.fetch_add(1, Ordering::SeqCst) == 0;
                Box::pin(async move {
                    sleep(Duration::from_millis(100)).await;
                    if first {
                        Err(Boom)
                    } else {
                        Ok(key)
                    }
                })
            }
        };
        let coalesce = Arc::new(Coalesce::new(fail_once));

        let mut waiters = vec![];
        for _ in 0..2 {
            let coalesce = coalesce.clone();
            waiters.push(tokio::spawn(
                async move { coalesce.invoke("a".to_string()).await },
            ));
        }
        let mut errors = vec![];
        for waiter in waiters {
            match waiter.await.unwrap() {
                Err(CallError::Failed(error)) => errors.push(error),
                other => panic!("expected shared failure, got {other:?}"),
            }
        }
        // Both waiters hold the same underlying error.
        assert!(Arc::ptr_eq(&errors[0], &errors[1]));

        // The failure evicted the entry; the key is usable again.
        assert_eq!(coalesce.invoke("a".to_string()).await.unwrap(), "a");
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_operation_fails_waiters_and_evicts() {
        let coalesce = Arc::new(Coalesce::new(|_key: String| -> CallFuture<String, Boom> {
            Box::pin(async move {
                sleep(Duration::from_millis(50)).await;
                panic!("BAD NUMBER");
            })
        }));

        let waiter = tokio::spawn({
            let coalesce = coalesce.clone();
            async move { coalesce.invoke("a".to_string()).await }
        });
        assert!(matches!(waiter.await.unwrap(), Err(CallError::Lost)));

        sleep(Duration::from_millis(20)).await;
        assert_eq!(coalesce.in_flight(), 0);
    }

    #[derive(Clone)]
    struct Request {
        body: &'static str,
        signal: Option<AbortSignal>,
    }

    #[derive(Debug, Error)]
    #[error("stopped")]
    struct Stopped;

    fn with_accessors<G>(op: G) -> Coalesce<Request, &'static str, &'static str, Stopped>
    where
        G: Fn(Request) -> CallFuture<&'static str, Stopped> + Send + Sync + 'static,
    {
        Coalesce::with_key_fn(op, |request: &Request| request.body).with_signal_accessors(
            SignalAccessors::new(
                |request: &Request| request.signal.clone(),
                |signal, mut request: Request| {
                    request.signal = Some(signal);
                    request
                },
            ),
        )
    }

    #[tokio::test]
    async fn caller_abort_is_local_until_every_caller_aborts() {
        // The operation records the composed signal it was handed, then runs
        // until that signal fires.
        let threaded: Arc<Mutex<Option<AbortSignal>>> = Arc::new(Mutex::new(None));
        let coalesce = {
            let threaded = threaded.clone();
            Arc::new(with_accessors(move |request: Request| -> CallFuture<
                &'static str,
                Stopped,
            > {
                let threaded = threaded.clone();
                Box::pin(async move {
                    let signal = request.signal.expect("composed signal threaded into args");
                    *threaded.lock() = Some(signal.clone());
                    signal.aborted().await;
                    Err(Stopped)
                })
            }))
        };

        let first = AbortHandle::new();
        let second = AbortHandle::new();

        let first_waiter = tokio::spawn({
            let coalesce = coalesce.clone();
            let signal = first.signal();
            async move {
                coalesce
                    .invoke(Request {
                        body: "key",
                        signal: Some(signal),
                    })
                    .await
            }
        });
        sleep(Duration::from_millis(20)).await;
        let second_waiter = tokio::spawn({
            let coalesce = coalesce.clone();
            let signal = second.signal();
            async move {
                coalesce
                    .invoke(Request {
                        body: "key",
                        signal: Some(signal),
                    })
                    .await
            }
        });
        sleep(Duration::from_millis(20)).await;
        assert_eq!(coalesce.coalesced_count(), 1);

        // First caller gives up: only its own view fails.
        first.abort();
        assert!(matches!(
            first_waiter.await.unwrap(),
            Err(CallError::Aborted)
        ));
        let composed = threaded.lock().clone().expect("operation saw the signal");
        assert!(!composed.is_aborted());
        assert!(!second_waiter.is_finished());

        // Second caller gives up: the group is complete, the operation is
        // told to stop, and it settles.
        second.abort();
        assert!(matches!(
            second_waiter.await.unwrap(),
            Err(CallError::Aborted)
        ));
        composed.aborted().await;

        sleep(Duration::from_millis(20)).await;
        assert_eq!(coalesce.in_flight(), 0);
    }

    #[tokio::test]
    async fn aborting_one_caller_leaves_the_result_for_others() {
        let coalesce = Arc::new(with_accessors(
            |_request: Request| -> CallFuture<&'static str, Stopped> {
                Box::pin(async move {
                    sleep(Duration::from_millis(100)).await;
                    Ok("value")
                })
            },
        ));

        let impatient = AbortHandle::new();
        let first_waiter = tokio::spawn({
            let coalesce = coalesce.clone();
            let signal = impatient.signal();
            async move {
                coalesce
                    .invoke(Request {
                        body: "key",
                        signal: Some(signal),
                    })
                    .await
            }
        });
        sleep(Duration::from_millis(20)).await;
        let second_waiter = tokio::spawn({
            let coalesce = coalesce.clone();
            async move {
                coalesce
                    .invoke(Request {
                        body: "key",
                        signal: None,
                    })
                    .await
            }
        });

        impatient.abort();
        assert!(matches!(
            first_waiter.await.unwrap(),
            Err(CallError::Aborted)
        ));
        // The signal-less caller rides the shared execution to completion.
        assert_eq!(second_waiter.await.unwrap().unwrap(), "value");
    }

    #[tokio::test]
    async fn operation_may_ignore_the_composed_signal() {
        let coalesce = Arc::new(with_accessors(
            |_request: Request| -> CallFuture<&'static str, Stopped> {
                Box::pin(async move {
                    sleep(Duration::from_millis(100)).await;
                    Ok("finished anyway")
                })
            },
        ));

        let only = AbortHandle::new();
        let waiter = tokio::spawn({
            let coalesce = coalesce.clone();
            let signal = only.signal();
            async move {
                coalesce
                    .invoke(Request {
                        body: "key",
                        signal: Some(signal),
                    })
                    .await
            }
        });
        sleep(Duration::from_millis(20)).await;
        only.abort();
        assert!(matches!(waiter.await.unwrap(), Err(CallError::Aborted)));

        // The operation ignores the composed signal, settles on its own and
        // the registries still tear down.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(coalesce.in_flight(), 0);
    }

    struct Shout;

    #[async_trait::async_trait]
    impl Operation for Shout {
        type Args = String;
        type Value = String;
        type Error = Infallible;

        async fn call(&self, args: String) -> Result<String, Infallible> {
            sleep(Duration::from_millis(20)).await;
            Ok(args.to_uppercase())
        }
    }

    #[tokio::test]
    async fn operation_trait_delegates_work() {
        let coalesce = Coalesce::from_operation(Shout);
        assert_eq!(coalesce.invoke("hello".to_string()).await.unwrap(), "HELLO");
    }
}
