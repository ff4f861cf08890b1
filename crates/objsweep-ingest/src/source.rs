//! Object enumeration
//!
//! [`ObjectSource::enumerate`] turns the paged listing API into one lazy,
//! finite stream of descriptors. Page boundaries (including empty pages) are
//! invisible to the consumer. The stream is single-pass: calling `enumerate`
//! again starts a fresh listing from the first page.

use futures::stream::{self, BoxStream, StreamExt};
use objsweep_common::{ObjectDescriptor, Result, SweepError};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use crate::store::ObjectStore;

enum Cursor {
    Start,
    Token(String),
    Exhausted,
}

struct ListingState<S: ?Sized> {
    store: Arc<S>,
    bucket: String,
    prefix: String,
    pending: VecDeque<ObjectDescriptor>,
    cursor: Cursor,
    pages: usize,
}

pub struct ObjectSource<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for ObjectSource<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> ObjectSource<S>
where
    S: ObjectStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Lazily enumerate every object under `bucket`/`prefix`.
    ///
    /// A listing failure yields one `SourceUnavailable` item and ends the
    /// stream; no retry happens here.
    pub fn enumerate(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<ObjectDescriptor>> {
        let state = ListingState {
            store: Arc::clone(&self.store),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            pending: VecDeque::new(),
            cursor: Cursor::Start,
            pages: 0,
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(descriptor) = state.pending.pop_front() {
                    return Ok(Some((descriptor, state)));
                }

                let token = match std::mem::replace(&mut state.cursor, Cursor::Exhausted) {
                    Cursor::Exhausted => {
                        debug!(
                            bucket = %state.bucket,
                            prefix = %state.prefix,
                            pages = state.pages,
                            "Listing exhausted"
                        );
                        return Ok(None);
                    },
                    Cursor::Start => None,
                    Cursor::Token(token) => Some(token),
                };

                let page = state
                    .store
                    .list_page(&state.bucket, &state.prefix, token)
                    .await
                    .map_err(|e| SweepError::SourceUnavailable {
                        bucket: state.bucket.clone(),
                        prefix: state.prefix.clone(),
                        cause: format!("{:#}", e),
                    })?;

                state.pages += 1;
                debug!(page = state.pages, objects = page.objects.len(), "Listed page");

                state.pending.extend(page.objects);
                if let Some(next) = page.next_token {
                    state.cursor = Cursor::Token(next);
                }
            }
        })
        .boxed()
    }
}
