//! Resumable table reader
//!
//! [`TableReader`] drives one [`ReadSession`] over the network: it issues
//! the request, frames the body into rows, feeds them through the session
//! and, on a retriable failure, backs off and re-issues the rewritten
//! request. Consumers pull items with [`TableReader::next_item`] or turn
//! the reader into a stream.

use super::session::{ReadItem, ReadSession};
use crate::cancel::{until_cancelled, CancellationToken};
use crate::codec::RowSplitter;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::progress::TransferProgress;
use crate::retry::{
    sleep_or_cancel, with_timeout, Deadline, DefaultRetryPolicy, RetryConfig, RetryPolicy,
};
use crate::service::{ByteStream, ReadRequest, TableService};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// How a reader retries and reports
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Resume after retriable failures
    pub retries_enabled: bool,
    /// Permit resuming reads of several ranges
    pub allow_multiple_ranges: bool,
    /// Backoff between attempts
    pub retry: RetryConfig,
    /// Which failures are retried
    pub policy: Arc<dyn RetryPolicy>,
    /// Bound on the request and on each body read
    pub attempt_timeout: Option<Duration>,
    /// No attempt starts after this point
    pub deadline: Option<Deadline>,
    /// Stops the read
    pub cancel: Option<CancellationToken>,
    /// Shared counters updated per delivered row
    pub progress: Option<Arc<TransferProgress>>,
}

impl ReaderOptions {
    /// Options from a transfer configuration
    pub fn from_config(config: &TransferConfig, policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            retries_enabled: config.read_retries.enable,
            allow_multiple_ranges: config.read_retries.allow_multiple_ranges,
            retry: config.read_retries.retry.clone(),
            policy,
            attempt_timeout: config.request_timeout(),
            deadline: config.transfer_timeout().map(Deadline::after),
            cancel: None,
            progress: None,
        }
    }
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default(), Arc::new(DefaultRetryPolicy::default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    NotStarted,
    Streaming,
    Done,
    Failed,
}

/// Pull-based reader of one table read
pub struct TableReader {
    service: Arc<dyn TableService>,
    session: ReadSession,
    options: ReaderOptions,
    state: ReaderState,
    body: Option<ByteStream>,
    splitter: Option<RowSplitter>,
    pending: VecDeque<ReadItem>,
    /// Consecutive failures without a delivered row
    failures: u32,
    retries: u32,
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("session", &self.session)
            .field("state", &self.state)
            .field("failures", &self.failures)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl TableReader {
    /// Validate the read and prepare a reader. No request is issued yet.
    pub fn new(
        service: Arc<dyn TableService>,
        request: ReadRequest,
        options: ReaderOptions,
    ) -> Result<Self> {
        let session = ReadSession::new(
            request,
            options.retries_enabled,
            options.allow_multiple_ranges,
            service.capabilities(),
        )?;
        let splitter = session.request().format.row_framing().map(RowSplitter::new);

        Ok(Self {
            service,
            session,
            options,
            state: ReaderState::NotStarted,
            body: None,
            splitter,
            pending: VecDeque::new(),
            failures: 0,
            retries: 0,
        })
    }

    /// Session bookkeeping, for inspection
    pub fn session(&self) -> &ReadSession {
        &self.session
    }

    /// Retries performed so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Next row or control marker; `None` once the read is complete
    pub async fn next_item(&mut self) -> Result<Option<ReadItem>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                if let ReadItem::Row(row) = &item {
                    self.failures = 0;
                    if let Some(progress) = &self.options.progress {
                        progress.add_rows(1, row.len() as u64);
                    }
                }
                return Ok(Some(item));
            }

            match self.state {
                ReaderState::Done | ReaderState::Failed => return Ok(None),
                ReaderState::NotStarted | ReaderState::Streaming => {}
            }

            if let Err(error) = self.advance().await {
                if let Err(error) = self.recover(error).await {
                    self.state = ReaderState::Failed;
                    self.body = None;
                    return Err(error);
                }
            }
        }
    }

    /// Stream of items; ends after the first error
    pub fn into_stream(self) -> BoxStream<'static, Result<ReadItem>> {
        futures::stream::unfold(self, |mut reader| async move {
            match reader.next_item().await {
                Ok(Some(item)) => Some((Ok(item), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
        .boxed()
    }

    /// Stream of wire bytes, control markers re-encoded in the read format
    pub fn into_byte_stream(self) -> BoxStream<'static, Result<Bytes>> {
        let codec = self.session.codec();
        self.into_stream()
            .and_then(move |item| async move { item.into_bytes(codec) })
            .boxed()
    }

    fn describe(&self) -> String {
        format!(
            "read {} range {}",
            self.session.request().path.path,
            self.session.current_range_index()
        )
    }

    /// One step: open a response, or consume one body buffer
    async fn advance(&mut self) -> Result<()> {
        let cancel = self.options.cancel.as_ref();
        let timeout = self.options.attempt_timeout;

        let Some(body) = self.body.as_mut() else {
            let request = self.session.request().clone();
            tracing::debug!("Issuing read of {}", request.path);
            let response = until_cancelled(
                cancel,
                with_timeout(timeout, "read request", self.service.read_table(&request)),
            )
            .await?;
            self.session.begin_response(&response.parameters)?;
            self.body = Some(response.body);
            self.state = ReaderState::Streaming;
            return Ok(());
        };

        let next = until_cancelled(cancel, with_timeout(timeout, "read body", body.try_next())).await?;
        match next {
            Some(buffer) => match &mut self.splitter {
                Some(splitter) => {
                    splitter.push(&buffer);
                    while let Some(row) = splitter.next_row()? {
                        self.session.observe(row, &mut self.pending)?;
                    }
                }
                None => self.pending.push_back(ReadItem::Row(buffer)),
            },
            None => {
                if let Some(splitter) = &mut self.splitter {
                    if let Some(row) = splitter.finish()? {
                        self.session.observe(row, &mut self.pending)?;
                    }
                }
                self.body = None;
                self.state = ReaderState::Done;
                tracing::debug!(
                    "Finished {} after {} retries",
                    self.session.request().path,
                    self.retries
                );
            }
        }
        Ok(())
    }

    /// Decide whether a failure can be resumed; sleeps before returning `Ok`
    async fn recover(&mut self, error: TransferError) -> Result<()> {
        self.body = None;
        if let Some(splitter) = &mut self.splitter {
            splitter.reset();
        }

        if !self.session.resumable() || !self.options.policy.is_retriable(&error) {
            return Err(error);
        }
        if !self.options.retry.should_retry(self.failures) {
            return Err(TransferError::exhausted(
                self.describe(),
                self.failures + 1,
                error,
            ));
        }

        let delay = self.options.retry.delay_for_attempt(self.failures);
        if let Some(deadline) = &self.options.deadline {
            deadline.check(delay)?;
        }
        self.failures += 1;
        self.retries += 1;
        if let Some(progress) = &self.options.progress {
            progress.add_retries(1);
        }

        tracing::warn!(
            "{} failed (attempt {}/{}): {}. Resuming at row {} in {:?}",
            self.describe(),
            self.failures,
            self.options.retry.max_retries,
            error,
            self.session.next_row_index(),
            delay
        );
        sleep_or_cancel(delay, self.options.cancel.as_ref()).await?;
        self.session.prepare_retry();
        Ok(())
    }
}
