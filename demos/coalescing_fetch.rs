use std::sync::Arc;
use std::time::Instant;

use coalesce::Coalesce;
use coalesce::Operation;

use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("bad number")]
struct BadNumber;

struct SlowFetch;

/// If our operation fails, all concurrent callers share that failure. Let's
/// cause that to happen sometimes by failing on even numbers.
#[async_trait::async_trait]
impl Operation for SlowFetch {
    type Args = usize;
    type Value = String;
    type Error = BadNumber;

    async fn call(&self, key: usize) -> Result<String, BadNumber> {
        let num = rand::rng().random_range(1000..2000);
        tokio::time::sleep(tokio::time::Duration::from_millis(num)).await;
        if num % 2 == 0 {
            return Err(BadNumber);
        }
        Ok(format!("key: {key}, duration: {num}"))
    }
}

/// Create our coalescer and then loop around 5 times creating 100 jobs which
/// all invoke our slow fetch with the same key. We print out data about each
/// iteration: how many succeed, the range of times between each settlement
/// and how long the iteration took. Every iteration runs the fetch exactly
/// once, however the outcome turns out.
#[tokio::main]
async fn main() {
    let coalesce = Arc::new(Coalesce::from_operation(SlowFetch));

    for _i in 0..5 {
        let mut hdls = vec![];
        let start = Instant::now();
        for _i in 0..100 {
            let my_coalesce = coalesce.clone();
            hdls.push(async move {
                let is_ok = my_coalesce.invoke(5).await.is_ok();
                (Instant::now(), is_ok)
            });
        }
        let mut result: Vec<(Instant, bool)> =
            futures::future::join_all(hdls).await.into_iter().collect();
        result.sort();
        println!(
            "range: {:?}",
            result.last().unwrap().0 - result.first().unwrap().0
        );
        println!(
            "passed: {:?}",
            result
                .iter()
                .fold(0, |acc, x| if x.1 { acc + 1 } else { acc })
        );
        println!("calls made: {}", coalesce.call_count());
        println!("calls coalesced: {}", coalesce.coalesced_count());
        println!("elapsed: {:?}\n", Instant::now() - start);
    }
}
