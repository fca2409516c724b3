use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::warn;

use super::{decode, Document, RawChange};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent<D> {
    Upserted { revision: u64, document: D },
    Removed { revision: u64, id: String },
}

impl<D> ChangeEvent<D> {
    pub fn revision(&self) -> u64 {
        match self {
            ChangeEvent::Upserted { revision, .. } | ChangeEvent::Removed { revision, .. } => {
                *revision
            }
        }
    }
}

/// Typed change stream over one collection, optionally narrowed to a single
/// document. Ends when cancelled or when the store is dropped.
pub struct Subscription<D> {
    inner: BroadcastStream<RawChange>,
    id: Option<String>,
    cancelled: bool,
    _marker: PhantomData<fn() -> D>,
}

impl<D: Document> Subscription<D> {
    pub(super) fn new(rx: broadcast::Receiver<RawChange>, id: Option<String>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
            id,
            cancelled: false,
            _marker: PhantomData,
        }
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn matches(&self, change: &RawChange) -> bool {
        change.collection == D::COLLECTION
            && self.id.as_deref().map_or(true, |id| id == change.id)
    }
}

impl<D: Document> Stream for Subscription<D> {
    type Item = ChangeEvent<D>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.cancelled {
                return Poll::Ready(None);
            }

            let change = match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(
                        collection = D::COLLECTION.as_str(),
                        skipped, "subscription lagged; events dropped"
                    );
                    continue;
                }
                Some(Ok(change)) => change,
            };

            if !this.matches(&change) {
                continue;
            }

            let event = match change.data {
                None => ChangeEvent::Removed {
                    revision: change.revision,
                    id: change.id,
                },
                Some(data) => match decode::<D>(&change.id, &data) {
                    Ok(document) => ChangeEvent::Upserted {
                        revision: change.revision,
                        document,
                    },
                    Err(err) => {
                        warn!(error = %err, "dropping change that failed validation");
                        continue;
                    }
                },
            };

            return Poll::Ready(Some(event));
        }
    }
}
