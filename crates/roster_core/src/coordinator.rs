//! Bounded fan-out over independent units of work.

use std::future::Future;
use std::num::NonZeroUsize;
use std::thread;

use futures::{StreamExt, TryStreamExt, stream};
use serde::{Deserialize, Serialize};

use crate::RosterResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Parallelism {
    Sequential,
    Workers { count: NonZeroUsize },
}

impl Default for Parallelism {
    fn default() -> Self {
        match thread::available_parallelism() {
            Ok(count) => Self::Workers { count },
            Err(_) => Self::Sequential,
        }
    }
}

impl Parallelism {
    /// `count` workers, with zero treated as one.
    pub fn workers(count: usize) -> Self {
        Self::Workers {
            count: NonZeroUsize::new(count).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// `None` and `Some(0)` select the host's parallelism; `Some(1)` runs sequentially.
    pub fn from_count(count: Option<usize>) -> Self {
        match count {
            None | Some(0) => Self::default(),
            Some(1) => Self::Sequential,
            Some(count) => Self::workers(count),
        }
    }

    pub fn worker_count(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Workers { count } => count.get(),
        }
    }
}

/// Run `task` over `items` and return the results in input order.
///
/// At most `parallelism.worker_count()` tasks are in flight. The first error
/// stops the fan-out and is returned; in-flight tasks are dropped.
pub async fn fan_out<I, T, R, F, Fut>(
    items: I,
    parallelism: Parallelism,
    task: F,
) -> RosterResult<Vec<R>>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = RosterResult<R>>,
{
    match parallelism {
        Parallelism::Sequential => {
            let mut results = Vec::new();
            for item in items {
                results.push(task(item).await?);
            }
            Ok(results)
        }
        Parallelism::Workers { count } => {
            let mut indexed: Vec<(usize, R)> =
                stream::iter(items.into_iter().enumerate().map(|(idx, item)| {
                    let pending = task(item);
                    async move { pending.await.map(|result| (idx, result)) }
                }))
                .buffer_unordered(count.get())
                .try_collect()
                .await?;
            indexed.sort_by_key(|(idx, _)| *idx);
            Ok(indexed.into_iter().map(|(_, result)| result).collect())
        }
    }
}
