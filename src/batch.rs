//! Bounded-concurrency batching.

use futures::future::join_all;
use std::future::Future;

/// Run `f` over `items` at most `limit` at a time.
///
/// Items are taken in consecutive batches of `limit`; each batch is awaited in
/// full before the next one starts. Results come back in input order.
pub async fn map_in_batches<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let limit = limit.max(1);
    let mut results = Vec::with_capacity(items.len());
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        let batch: Vec<Fut> = items.by_ref().take(limit).map(&f).collect();
        results.extend(join_all(batch).await);
    }
    results
}
