//! A lazy, cancellable sequence of documents produced from a SQL row stream.
//!
//! The iterator owns the pooled connection for as long as rows are streaming;
//! closing it (or hitting the end, or any error) releases the connection
//! immediately. After that, every further `next` returns the stable done value.

use std::pin::Pin;

use deadpool_postgres::Object;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_postgres::{Row, RowStream};
use tracing::warn;

use crate::errors::StoatDBError;
use crate::sjson;
use crate::types::Document;

pub struct QueryIterator {
    state: Mutex<State>,
}

enum State {
    Active(Box<Active>),
    Done,
}

struct Active {
    /// Held only to keep the connection checked out while rows stream.
    _client: Object,
    rows: Pin<Box<RowStream>>,
    capped: bool,
    only_record_ids: bool,
}

impl QueryIterator {
    pub(crate) fn new(
        client: Object,
        rows: RowStream,
        capped: bool,
        only_record_ids: bool,
    ) -> Self {
        Self {
            state: Mutex::new(State::Active(Box::new(Active {
                _client: client,
                rows: Box::pin(rows),
                capped,
                only_record_ids,
            }))),
        }
    }

    /// An iterator over nothing, used when the database or collection does
    /// not exist.
    pub(crate) fn empty() -> Self {
        Self {
            state: Mutex::new(State::Done),
        }
    }

    /// Produces the next document, or `None` once the stream is exhausted,
    /// closed, or failed. Safe to call concurrently with `close`.
    pub async fn next(&self) -> Result<Option<Document>, StoatDBError> {
        let mut state = self.state.lock().await;
        let active = match &mut *state {
            State::Done => return Ok(None),
            State::Active(active) => active,
        };

        match active.rows.next().await {
            None => {
                *state = State::Done;
                Ok(None)
            }
            Some(Err(err)) => {
                *state = State::Done;
                Err(err.into())
            }
            Some(Ok(row)) => {
                let capped = active.capped;
                let only_record_ids = active.only_record_ids;
                match decode_row(&row, capped, only_record_ids) {
                    Ok(doc) => Ok(Some(doc)),
                    Err(err) => {
                        *state = State::Done;
                        Err(err)
                    }
                }
            }
        }
    }

    /// Releases the row stream and its connection. Idempotent.
    pub async fn close(&self) {
        *self.state.lock().await = State::Done;
    }
}

impl Drop for QueryIterator {
    fn drop(&mut self) {
        // Dropping still releases the stream and connection; the warning only
        // flags callers that skipped close and may be leaking elsewhere.
        if let Ok(state) = self.state.try_lock() {
            if matches!(*state, State::Active(_)) {
                warn!("query iterator dropped without close");
            }
        }
    }
}

impl std::fmt::Debug for QueryIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryIterator").finish_non_exhaustive()
    }
}

fn decode_row(row: &Row, capped: bool, only_record_ids: bool) -> Result<Document, StoatDBError> {
    if capped && only_record_ids {
        let record_id: i64 = row.try_get(0)?;
        let mut doc = Document::new();
        doc.set_record_id(Some(record_id));
        return Ok(doc);
    }

    if capped {
        let record_id: i64 = row.try_get(0)?;
        let json: serde_json::Value = row.try_get(1)?;
        let mut doc = sjson::unmarshal_json(json)?;
        doc.set_record_id(Some(record_id));
        return Ok(doc);
    }

    let json: serde_json::Value = row.try_get(0)?;
    Ok(sjson::unmarshal_json(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_iterator_is_done() {
        let iter = QueryIterator::empty();
        assert!(iter.next().await.unwrap().is_none());
        assert!(iter.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let iter = QueryIterator::empty();
        iter.close().await;
        iter.close().await;
        assert!(iter.next().await.unwrap().is_none());
    }
}
