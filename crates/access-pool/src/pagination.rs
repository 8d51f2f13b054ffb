//! Lazy pagination on top of `AccessCoordinator::run`
//!
//! Each page is one `run`, so every page fetch gets its own credential
//! selection and retry budget. The stream ends after the last page or after
//! the first error.

use std::future::Future;

use futures_util::Stream;
use futures_util::stream;
use transport::ApiResponse;

use crate::coordinator::AccessCoordinator;
use crate::error::RunError;

/// Stream pages starting at `first`, following `next_cursor` until it
/// returns `None`.
///
/// `fetch` gets the leased transport and the cursor of the page to load.
pub fn paginate<'a, T, C, F, Fut, R, E, N>(
    coordinator: &'a AccessCoordinator<T>,
    first: C,
    fetch: F,
    next_cursor: N,
) -> impl Stream<Item = Result<R, RunError<E>>> + 'a
where
    T: Clone + 'a,
    C: Clone + 'a,
    F: FnMut(T, C) -> Fut + 'a,
    Fut: Future<Output = Result<R, E>> + 'a,
    R: ApiResponse + 'a,
    E: 'a,
    N: Fn(&R) -> Option<C> + 'a,
{
    stream::unfold(
        Some((first, fetch, next_cursor)),
        move |state| async move {
            let (cursor, mut fetch, next_cursor) = state?;
            match coordinator
                .run(|transport| fetch(transport, cursor.clone()))
                .await
            {
                Ok(page) => {
                    let next = next_cursor(&page).map(|cursor| (cursor, fetch, next_cursor));
                    Some((Ok(page), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        },
    )
}
