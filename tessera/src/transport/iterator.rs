//! Iterators over rows returned by paged queries\
//! A page fetch is hidden I/O: the `next_row` future may issue an EXECUTE
//! for the next page, so it can fail.

use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::statement::prepared_statement::PreparedStatement;
use crate::statement::query::Query;
use crate::statement::Consistency;
use crate::transport::cluster::ClusterData;
use crate::transport::connection::{Connection, NonErrorQueryResponse, QueryResponse};
use crate::transport::errors::QueryError;
use crate::transport::load_balancing::{LoadBalancingPolicy, Statement};
use crate::transport::metrics::Metrics;
use crate::transport::prepared_cache::PreparedStatementCache;
use crate::transport::retry_policy::{
    enforce_idempotency_gate, QueryInfo, RetryDecision, RetrySession,
};
use tessera_cql::cql_to_rust::{FromRow, FromRowError};
use tessera_cql::frame::response::result::{ResultMetadata, Row, Rows};
use tessera_cql::frame::response::{result, NonErrorResponse};
use tessera_cql::frame::value::SerializedValues;

struct ReceivedPage {
    rows: Rows,
    tracing_id: Option<Uuid>,
    /// State to resume from after this page, None on the last page.
    paging_state: Option<Bytes>,
}

/// Iterator over rows returned by paged queries;
/// the next pages are fetched as the rows are consumed.
pub struct RowIterator {
    current_row_idx: usize,
    current_page: Rows,
    page_receiver: mpsc::Receiver<Result<ReceivedPage, QueryError>>,
    tracing_ids: Vec<Uuid>,
    latest_paging_state: Option<Bytes>,
}

/// Fetching pages is asynchronous so `RowIterator` does not implement the
/// `Iterator` trait.\
/// Instead it uses the asynchronous `Stream` trait, or the convenience
/// [RowIterator::next_row].
impl Stream for RowIterator {
    type Item = Result<Row, QueryError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let s = self.as_mut().get_mut();

        if s.is_current_page_exhausted() {
            match s.page_receiver.poll_recv(cx) {
                Poll::Ready(Some(Ok(received_page))) => {
                    s.current_page = received_page.rows;
                    s.current_row_idx = 0;
                    s.latest_paging_state = received_page.paging_state;

                    if let Some(tracing_id) = received_page.tracing_id {
                        s.tracing_ids.push(tracing_id);
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }

        let idx = s.current_row_idx;
        if idx < s.current_page.rows.len() {
            let row = mem::take(&mut s.current_page.rows[idx]);
            s.current_row_idx += 1;
            return Poll::Ready(Some(Ok(row)));
        }

        // The page was empty (possible on the final page); ask to be
        // polled again so the next recv can run.
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

impl RowIterator {
    /// Returns the next row, fetching the next page first when the current
    /// one is exhausted. The page fetch can fail, hence the `Result`.
    pub async fn next_row(&mut self) -> Option<Result<Row, QueryError>> {
        use futures::StreamExt;
        self.next().await
    }

    /// Converts this iterator into an iterator over rows parsed as given type.
    pub fn into_typed<RowT: FromRow>(self) -> TypedRowIterator<RowT> {
        TypedRowIterator {
            row_iterator: self,
            phantom_data: Default::default(),
        }
    }

    /// The paging state after the most recently received page.
    /// It can be stored away and later used to resume the query
    /// from this position, even in another process.
    pub fn paging_state(&self) -> Option<Bytes> {
        self.latest_paging_state.clone()
    }

    /// If tracing was enabled, returns tracing ids of all succeeded page
    /// queries.
    pub fn get_tracing_ids(&self) -> &[Uuid] {
        &self.tracing_ids
    }

    /// Returns specification of row columns
    pub fn get_column_specs(&self) -> &[result::ColumnSpec] {
        &self.current_page.metadata.col_specs
    }

    fn is_current_page_exhausted(&self) -> bool {
        self.current_row_idx >= self.current_page.rows.len()
    }

    pub(crate) async fn new_for_query(
        query: Query,
        values: SerializedValues,
        statement_info: Statement,
        config: RowIteratorConfig,
    ) -> Result<RowIterator, QueryError> {
        let (sender, receiver) = mpsc::channel(1);

        let consistency = query.config.determine_consistency(config.default_consistency);
        let serial_consistency = query.config.serial_consistency;
        let is_idempotent = query.config.is_idempotent;
        let retry_session = query
            .config
            .retry_policy
            .as_ref()
            .unwrap_or(&config.retry_policy)
            .new_session();

        let page_query = move |connection: Arc<Connection>, paging_state: Option<Bytes>| {
            let query = query.clone();
            let values = values.clone();
            async move {
                connection
                    .query_with_consistency(
                        &query,
                        &values,
                        consistency,
                        serial_consistency,
                        paging_state,
                    )
                    .await
            }
        };

        let worker = RowIteratorWorker {
            sender,
            page_query,
            statement_info,
            query_is_idempotent: is_idempotent,
            query_consistency: consistency,
            retry_session,
            metrics: config.metrics,
            paging_state: None,
        };

        let worker_task = worker.work(config.cluster_data, config.policy);
        Self::new_from_worker_future(worker_task, receiver).await
    }

    pub(crate) async fn new_for_prepared_statement(
        config: PreparedIteratorConfig,
    ) -> Result<RowIterator, QueryError> {
        let (sender, receiver) = mpsc::channel(1);

        let consistency = config
            .prepared
            .config
            .determine_consistency(config.common.default_consistency);
        let serial_consistency = config.prepared.config.serial_consistency;
        let is_idempotent = config.prepared.config.is_idempotent;
        let retry_session = config
            .prepared
            .config
            .retry_policy
            .as_ref()
            .unwrap_or(&config.common.retry_policy)
            .new_session();

        let prepared = config.prepared;
        let values = config.values;
        let cache = config.cache;
        let page_query = move |connection: Arc<Connection>, paging_state: Option<Bytes>| {
            let prepared = prepared.clone();
            let values = values.clone();
            let cache = cache.clone();
            async move {
                connection
                    .execute_cached(
                        &cache,
                        &prepared,
                        &values,
                        consistency,
                        serial_consistency,
                        paging_state,
                    )
                    .await
            }
        };

        let worker = RowIteratorWorker {
            sender,
            page_query,
            statement_info: config.statement_info,
            query_is_idempotent: is_idempotent,
            query_consistency: consistency,
            retry_session,
            metrics: config.common.metrics,
            paging_state: None,
        };

        let worker_task = worker.work(config.common.cluster_data, config.common.policy);
        Self::new_from_worker_future(worker_task, receiver).await
    }

    /// Pages through a query on a single connection; used by driver-internal
    /// metadata reads on the control connection.
    pub(crate) async fn new_for_connection_query_iter(
        query: Query,
        connection: Arc<Connection>,
    ) -> Result<RowIterator, QueryError> {
        let (sender, receiver) = mpsc::channel(1);

        let worker = SingleConnectionRowIteratorWorker {
            sender,
            connection,
            query,
            paging_state: None,
        };

        Self::new_from_worker_future(worker.work(), receiver).await
    }

    async fn new_from_worker_future(
        worker_task: impl Future<Output = PageSendAttemptedProof> + Send + 'static,
        mut receiver: mpsc::Receiver<Result<ReceivedPage, QueryError>>,
    ) -> Result<RowIterator, QueryError> {
        tokio::task::spawn(worker_task);

        // Waiting for the first page here makes construction slower, but
        // it lets a first-page failure surface as a plain error instead
        // of popping out of the stream later.
        let received_page = receiver.recv().await.ok_or(QueryError::ProtocolError(
            "Driver bug: the page channel closed before the first page",
        ))??;

        Ok(RowIterator {
            current_row_idx: 0,
            latest_paging_state: received_page.paging_state.clone(),
            tracing_ids: received_page.tracing_id.into_iter().collect(),
            current_page: received_page.rows,
            page_receiver: receiver,
        })
    }
}

/// Iterator over rows returned by paged queries where each row is parsed
/// as the given type\
/// Returned by `RowIterator::into_typed`
pub struct TypedRowIterator<RowT> {
    row_iterator: RowIterator,
    phantom_data: std::marker::PhantomData<RowT>,
}

impl<RowT> TypedRowIterator<RowT> {
    /// If tracing was enabled, returns tracing ids of all succeeded page
    /// queries.
    pub fn get_tracing_ids(&self) -> &[Uuid] {
        self.row_iterator.get_tracing_ids()
    }

    /// The paging state after the most recently received page.
    pub fn paging_state(&self) -> Option<Bytes> {
        self.row_iterator.paging_state()
    }
}

/// Couldn't get next typed row from the iterator
#[derive(thiserror::Error, Debug, Clone)]
pub enum NextRowError {
    /// Query to fetch next page has failed
    #[error(transparent)]
    QueryError(#[from] QueryError),

    /// Parsing values in row as given types failed
    #[error(transparent)]
    FromRowError(#[from] FromRowError),
}

impl<RowT: FromRow> Stream for TypedRowIterator<RowT> {
    type Item = Result<RowT, NextRowError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next_elem: Option<Result<Row, QueryError>> =
            match Pin::new(&mut self.row_iterator).poll_next(cx) {
                Poll::Ready(next_elem) => next_elem,
                Poll::Pending => return Poll::Pending,
            };

        let next_ready: Option<Self::Item> = match next_elem {
            Some(Ok(next_row)) => Some(RowT::from_row(next_row).map_err(|e| e.into())),
            Some(Err(e)) => Some(Err(e.into())),
            None => None,
        };

        Poll::Ready(next_ready)
    }
}

// TypedRowIterator can be moved freely for any RowT so it's Unpin
impl<RowT> Unpin for TypedRowIterator<RowT> {}

/// Common configuration of the iterator workers.
pub(crate) struct RowIteratorConfig {
    pub(crate) policy: Arc<dyn LoadBalancingPolicy>,
    pub(crate) retry_policy: Arc<dyn crate::transport::retry_policy::RetryPolicy>,
    pub(crate) default_consistency: Consistency,
    pub(crate) cluster_data: Arc<ClusterData>,
    pub(crate) metrics: Arc<Metrics>,
}

pub(crate) struct PreparedIteratorConfig {
    pub(crate) prepared: PreparedStatement,
    pub(crate) values: SerializedValues,
    pub(crate) statement_info: Statement,
    pub(crate) cache: Arc<PreparedStatementCache>,
    pub(crate) common: RowIteratorConfig,
}

// A separate module to provide a type which can only be constructed in it,
// so that worker implementations must send a page (or an error) before
// finishing - forgetting to do so becomes a type error.
mod checked_channel_sender {
    pub(crate) struct PageSendAttemptedProof;
}
use checked_channel_sender::PageSendAttemptedProof;

// The body of the RowIterator worker task: pages through the results,
// sending pages to the channel, retrying over the plan per the policy.
struct RowIteratorWorker<QueryFunc> {
    sender: mpsc::Sender<Result<ReceivedPage, QueryError>>,

    // Closure used to perform a single page query
    page_query: QueryFunc,

    statement_info: Statement,
    query_is_idempotent: bool,
    query_consistency: Consistency,
    retry_session: Box<dyn RetrySession>,
    metrics: Arc<Metrics>,

    paging_state: Option<Bytes>,
}

impl<QueryFunc, QueryFut> RowIteratorWorker<QueryFunc>
where
    QueryFunc: Fn(Arc<Connection>, Option<Bytes>) -> QueryFut,
    QueryFut: Future<Output = Result<QueryResponse, QueryError>>,
{
    async fn work(
        mut self,
        cluster_data: Arc<ClusterData>,
        policy: Arc<dyn LoadBalancingPolicy>,
    ) -> PageSendAttemptedProof {
        let plan = policy.plan(&self.statement_info, &cluster_data);

        let mut last_error: QueryError = QueryError::ProtocolError("Empty query plan - driver bug!");

        'plan: for node in plan {
            trace!(node = %node.address, "Paging through a query");
            let connection = match node.random_connection().await {
                Ok(connection) => connection,
                Err(e) => {
                    trace!(error = %e, "Choosing connection failed");
                    // No request was sent, so the failure metrics stay
                    // untouched; just move down the plan.
                    last_error = e;
                    continue 'plan;
                }
            };

            'retry_on_node: loop {
                match self.query_pages(&connection).await {
                    Ok(proof) => return proof,
                    Err(error) => {
                        trace!(error = %error, "Query failed");
                        self.metrics.inc_failed_paged_queries();

                        // Use the retry policy to decide what to do next
                        let query_info = QueryInfo {
                            error: &error,
                            is_idempotent: self.query_is_idempotent,
                            consistency: self.query_consistency,
                        };

                        let retry_decision = self.retry_session.decide_should_retry(query_info);
                        let retry_decision = enforce_idempotency_gate(
                            retry_decision,
                            &error,
                            self.query_is_idempotent,
                        );
                        trace!(retry_decision = ?retry_decision);
                        last_error = error;

                        match retry_decision {
                            RetryDecision::RetrySameNode(cl) => {
                                self.metrics.inc_retries_num();
                                if let Some(cl) = cl {
                                    self.query_consistency = cl;
                                }
                                continue 'retry_on_node;
                            }
                            RetryDecision::RetryNextNode(cl) => {
                                self.metrics.inc_retries_num();
                                if let Some(cl) = cl {
                                    self.query_consistency = cl;
                                }
                                continue 'plan;
                            }
                            // IgnoreWriteError does not apply to reads;
                            // surface the error.
                            RetryDecision::DontRetry | RetryDecision::IgnoreWriteError => {
                                break 'plan;
                            }
                        }
                    }
                }
            }
        }

        // Send the final error to the receiver.
        self.fail(last_error).await
    }

    // Given a working connection, fetches as many pages as possible,
    // starting at self.paging_state.
    async fn query_pages(
        &mut self,
        connection: &Arc<Connection>,
    ) -> Result<PageSendAttemptedProof, QueryError> {
        loop {
            self.metrics.inc_total_paged_queries();
            let query_start = std::time::Instant::now();

            let query_response =
                (self.page_query)(connection.clone(), self.paging_state.clone()).await?;
            let elapsed = query_start.elapsed();
            let query_response: NonErrorQueryResponse =
                query_response.into_non_error_query_response()?;

            let _ = self.metrics.log_query_latency(elapsed.as_millis() as u64);

            match query_response.response {
                NonErrorResponse::Result(result::Result::Rows(mut rows)) => {
                    self.paging_state = rows.metadata.paging_state.take();

                    let received_page = ReceivedPage {
                        rows,
                        tracing_id: query_response.tracing_id,
                        paging_state: self.paging_state.clone(),
                    };

                    // Send next page to RowIterator
                    if self.sender.send(Ok(received_page)).await.is_err() {
                        // The iterator was dropped; stop fetching.
                        return Ok(PageSendAttemptedProof);
                    }

                    if self.paging_state.is_none() {
                        // The last page was sent, the iterator is done.
                        return Ok(PageSendAttemptedProof);
                    }

                    // The retry counters are for a single page.
                    self.retry_session.reset();
                }
                NonErrorResponse::Result(_) => {
                    // A non-Rows result: yield a single empty page so that
                    // the consumer sees a finished iteration.
                    let received_page = ReceivedPage {
                        rows: empty_rows(),
                        tracing_id: query_response.tracing_id,
                        paging_state: None,
                    };
                    let _ = self.sender.send(Ok(received_page)).await;
                    return Ok(PageSendAttemptedProof);
                }
                _ => {
                    return Err(QueryError::ProtocolError(
                        "Unexpected response to a read query",
                    ))
                }
            }
        }
    }

    // Send an error to the receiver and finish.
    async fn fail(self, error: QueryError) -> PageSendAttemptedProof {
        let _ = self.sender.send(Err(error)).await;
        PageSendAttemptedProof
    }
}

// A single-connection variant, for driver-internal reads which must stick
// to the control connection.
struct SingleConnectionRowIteratorWorker {
    sender: mpsc::Sender<Result<ReceivedPage, QueryError>>,
    connection: Arc<Connection>,
    query: Query,
    paging_state: Option<Bytes>,
}

impl SingleConnectionRowIteratorWorker {
    async fn work(mut self) -> PageSendAttemptedProof {
        loop {
            let result = self
                .connection
                .query(&self.query, (), self.paging_state.clone())
                .await
                .and_then(|response| response.into_non_error_query_response());

            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    let _ = self.sender.send(Err(error)).await;
                    return PageSendAttemptedProof;
                }
            };

            match response.response {
                NonErrorResponse::Result(result::Result::Rows(mut rows)) => {
                    self.paging_state = rows.metadata.paging_state.take();
                    let page = ReceivedPage {
                        rows,
                        tracing_id: response.tracing_id,
                        paging_state: self.paging_state.clone(),
                    };
                    if self.sender.send(Ok(page)).await.is_err() {
                        return PageSendAttemptedProof;
                    }
                    if self.paging_state.is_none() {
                        return PageSendAttemptedProof;
                    }
                }
                NonErrorResponse::Result(_) => {
                    let page = ReceivedPage {
                        rows: empty_rows(),
                        tracing_id: response.tracing_id,
                        paging_state: None,
                    };
                    let _ = self.sender.send(Ok(page)).await;
                    return PageSendAttemptedProof;
                }
                _ => {
                    let _ = self
                        .sender
                        .send(Err(QueryError::ProtocolError(
                            "Unexpected response to a read query",
                        )))
                        .await;
                    return PageSendAttemptedProof;
                }
            }
        }
    }
}

fn empty_rows() -> Rows {
    Rows {
        metadata: ResultMetadata::default(),
        rows_count: 0,
        rows: Vec::new(),
        serialized_size: 0,
    }
}
