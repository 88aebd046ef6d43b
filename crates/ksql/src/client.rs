//! ksqlDB REST client
//!
//! [`Client`] turns requests into [`Transport`] calls. Streams it opens are
//! tracked weakly so [`Client::close`] can shut down whatever is still open
//! without keeping finished streams alive.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use futures::FutureExt;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::context::Context;
use crate::cursor::{CursorShared, QueryStream, TerminateFn};
use crate::error::{KsqlError, Result};
use crate::frames;
use crate::protocol::{
    CloseQueryPayload, ExecPayload, ExecResult, HealthcheckResult, InsertsStreamTarget,
    QueryDescription, QueryPayload, QueryStreamPayload, RunningQuery, ServerInfo,
    SourceDescription, StreamInfo, TableInfo, TerminateClusterPayload, decode_exec_results,
    error_from_body,
};
use crate::rows::QueryRows;
use crate::transport::{HttpTransport, Route, Transport};
use crate::writer::{InsertsStream, WriterShared};

fn encode<T: Serialize>(payload: &T) -> Result<Bytes> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(KsqlError::Encode)
}

async fn post_close_query<T: Transport + ?Sized>(transport: &T, query_id: &str) -> Result<()> {
    let body = encode(&CloseQueryPayload {
        query_id: query_id.to_string(),
    })?;
    transport
        .send(Route::CloseQuery, Some(body))
        .await?
        .error_for_status()?;
    debug!("closed query {}", query_id);
    Ok(())
}

/// Streams opened through a client, held weakly.
#[derive(Default)]
struct Registry {
    cursors: Vec<Weak<CursorShared>>,
    writers: Vec<Weak<WriterShared>>,
}

impl Registry {
    fn prune(&mut self) {
        self.cursors.retain(|c| c.strong_count() > 0);
        self.writers.retain(|w| w.strong_count() > 0);
    }
}

pub struct Client<T: Transport = HttpTransport> {
    transport: Arc<T>,
    config: ClientConfig,
    registry: Mutex<Registry>,
}

impl Client<HttpTransport> {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(transport: T, config: ClientConfig) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ============ Statements ============

    /// Run one or more non-`SELECT` statements.
    pub async fn exec(&self, payload: &ExecPayload) -> Result<Vec<ExecResult>> {
        let resp = self
            .transport
            .send(Route::Exec, Some(encode(payload)?))
            .await?
            .error_for_status()?;
        decode_exec_results(&resp.body)
    }

    /// Run a statement that must produce exactly one result.
    pub async fn single_exec(&self, payload: &ExecPayload) -> Result<ExecResult> {
        let mut results = self.exec(payload).await?;
        if results.len() != 1 {
            return Err(KsqlError::UnexpectedResultCount { got: results.len() });
        }
        results.pop().ok_or(KsqlError::UnexpectedResultCount { got: 0 })
    }

    pub async fn list_streams(&self) -> Result<Vec<StreamInfo>> {
        let result = self.single_exec(&ExecPayload::new("LIST STREAMS;")).await?;
        Ok(result.streams.unwrap_or_default())
    }

    pub async fn list_tables(&self) -> Result<Vec<TableInfo>> {
        let result = self.single_exec(&ExecPayload::new("LIST TABLES;")).await?;
        Ok(result.tables.unwrap_or_default())
    }

    pub async fn list_queries(&self) -> Result<Vec<RunningQuery>> {
        let result = self.single_exec(&ExecPayload::new("LIST QUERIES;")).await?;
        Ok(result.queries.unwrap_or_default())
    }

    pub async fn list_properties(&self) -> Result<BTreeMap<String, Value>> {
        let result = self
            .single_exec(&ExecPayload::new("LIST PROPERTIES;"))
            .await?;
        Ok(result.properties.unwrap_or_default())
    }

    /// `DESCRIBE` a stream or table.
    pub async fn describe(&self, source: &str) -> Result<SourceDescription> {
        let result = self
            .single_exec(&ExecPayload::new(format!("DESCRIBE {};", source)))
            .await?;
        Ok(result.source_description.unwrap_or_default())
    }

    /// `EXPLAIN` a running query or a query expression.
    pub async fn explain(&self, query: &str) -> Result<QueryDescription> {
        let query = query.trim_end().trim_end_matches(';');
        let result = self
            .single_exec(&ExecPayload::new(format!("EXPLAIN {};", query)))
            .await?;
        Ok(result.query_description.unwrap_or_default())
    }

    // ============ Queries ============

    /// Run a query and buffer its whole result.
    pub async fn query(&self, payload: &QueryPayload) -> Result<QueryRows> {
        let resp = self
            .transport
            .send(Route::Query, Some(encode(payload)?))
            .await?;
        if resp.is_success() {
            return QueryRows::parse(&resp.body);
        }
        match QueryRows::parse(&resp.body) {
            Err(err @ KsqlError::Statement { .. }) => Err(err),
            _ => Err(error_from_body(resp.status, &resp.body)),
        }
    }

    /// Open a push or pull query. Rows are read with [`QueryStream::next`],
    /// which is cancelled by `ctx`.
    pub async fn query_stream(
        &self,
        ctx: &Context,
        payload: &QueryStreamPayload,
    ) -> Result<QueryStream> {
        let body = encode(payload)?;
        let stream = ctx
            .run(self.transport.open_stream(Route::QueryStream, body))
            .await?;
        let frames = frames::lines(stream, self.config.max_frame_bytes);

        let transport = Arc::clone(&self.transport);
        let terminate: TerminateFn = Box::new(move |query_id: String| {
            async move { post_close_query(&*transport, &query_id).await }.boxed()
        });

        let cursor = QueryStream::open(
            ctx.clone(),
            frames,
            self.config.drain_timeout,
            Some(terminate),
        )
        .await?;

        let mut registry = self.registry();
        registry.prune();
        registry.cursors.push(Arc::downgrade(cursor.shared()));
        Ok(cursor)
    }

    /// Stop a push query by id.
    pub async fn close_query(&self, query_id: &str) -> Result<()> {
        post_close_query(&*self.transport, query_id).await
    }

    // ============ Inserts ============

    /// Open an inserts stream to an existing stream named `target`.
    pub async fn inserts_stream(&self, ctx: &Context, target: &str) -> Result<InsertsStream> {
        let mut first = serde_json::to_vec(&InsertsStreamTarget {
            target: target.to_string(),
        })
        .map_err(KsqlError::Encode)?;
        first.push(b'\n');

        let (outbound, body) = mpsc::channel(self.config.outbound_capacity.max(1));
        outbound
            .try_send(Bytes::from(first))
            .map_err(|_| KsqlError::StreamClosed)?;

        let stream = ctx
            .run(self.transport.open_duplex(Route::InsertsStream, body))
            .await?;
        let frames = frames::lines(stream, self.config.max_frame_bytes);
        let writer = InsertsStream::start(target, outbound, frames, &self.config);

        let mut registry = self.registry();
        registry.prune();
        registry.writers.push(Arc::downgrade(writer.shared()));
        Ok(writer)
    }

    // ============ Server ============

    pub async fn info(&self) -> Result<ServerInfo> {
        let resp = self
            .transport
            .send(Route::Info, None)
            .await?
            .error_for_status()?;
        Ok(serde_json::from_slice(&resp.body)?)
    }

    pub async fn healthcheck(&self) -> Result<HealthcheckResult> {
        let resp = self
            .transport
            .send(Route::HealthCheck, None)
            .await?
            .error_for_status()?;
        Ok(serde_json::from_slice(&resp.body)?)
    }

    pub async fn terminate_cluster(&self, payload: &TerminateClusterPayload) -> Result<()> {
        self.transport
            .send(Route::TerminateCluster, Some(encode(payload)?))
            .await?
            .error_for_status()?;
        info!("cluster termination requested");
        Ok(())
    }

    /// Streams opened through this client that are still alive.
    pub fn open_streams(&self) -> usize {
        let mut registry = self.registry();
        registry.prune();
        registry.cursors.len() + registry.writers.len()
    }

    /// Close every stream opened through this client that is still alive.
    ///
    /// Every stream is closed even if some fail; the first failure is
    /// returned.
    pub async fn close(&self) -> Result<()> {
        let (cursors, writers) = {
            let mut registry = self.registry();
            let cursors: Vec<_> = registry.cursors.drain(..).filter_map(|c| c.upgrade()).collect();
            let writers: Vec<_> = registry.writers.drain(..).filter_map(|w| w.upgrade()).collect();
            (cursors, writers)
        };
        debug!("closing {} cursors and {} writers", cursors.len(), writers.len());

        let mut first_err = None;
        for cursor in cursors {
            if let Err(e) = cursor.close().await {
                warn!("failed to close query stream: {}", e);
                first_err.get_or_insert(e);
            }
        }
        for writer in writers {
            if let Err(e) = writer.close().await {
                warn!("failed to close inserts stream: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use futures::StreamExt;
    use futures::future::BoxFuture;
    use serde_json::json;
    use tokio_stream::wrappers::ReceiverStream;

    use crate::Row;
    use crate::frames::ByteStream;
    use crate::transport::Buffered;

    /// In-memory server: canned bodies per route, and an acker for inserts.
    #[derive(Default)]
    struct FakeTransport {
        responses: Mutex<BTreeMap<&'static str, (u16, &'static str)>>,
        stream_body: Mutex<Vec<&'static str>>,
        /// Keeps streamed bodies open, like a push query
        open_bodies: Mutex<Vec<mpsc::Sender<io::Result<Bytes>>>>,
        requests: Mutex<Vec<(Route, Option<Value>)>>,
    }

    impl FakeTransport {
        fn respond(self, route: Route, status: u16, body: &'static str) -> Self {
            self.responses.lock().unwrap().insert(route.path(), (status, body));
            self
        }

        fn stream(self, lines: Vec<&'static str>) -> Self {
            *self.stream_body.lock().unwrap() = lines;
            self
        }

        fn record(&self, route: Route, body: Option<&Bytes>) {
            let body = body.map(|b| serde_json::from_slice(b).unwrap());
            self.requests.lock().unwrap().push((route, body));
        }

        fn sent(&self, route: Route) -> Vec<Option<Value>> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(r, _)| *r == route)
                .map(|(_, body)| body.clone())
                .collect()
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, route: Route, body: Option<Bytes>) -> BoxFuture<'_, Result<Buffered>> {
            self.record(route, body.as_ref());
            let (status, body) = self
                .responses
                .lock()
                .unwrap()
                .get(route.path())
                .copied()
                .unwrap_or((200, "{}"));
            async move {
                Ok(Buffered {
                    status,
                    body: Bytes::from_static(body.as_bytes()),
                })
            }
            .boxed()
        }

        fn open_stream(&self, route: Route, body: Bytes) -> BoxFuture<'_, Result<ByteStream>> {
            self.record(route, Some(&body));
            let (tx, rx) = mpsc::channel(16);
            for line in self.stream_body.lock().unwrap().iter() {
                tx.try_send(Ok(Bytes::from(format!("{}\n", line)))).unwrap();
            }
            self.open_bodies.lock().unwrap().push(tx);
            async move { Ok(ReceiverStream::new(rx).boxed()) }.boxed()
        }

        fn open_duplex(
            &self,
            route: Route,
            mut body: mpsc::Receiver<Bytes>,
        ) -> BoxFuture<'_, Result<ByteStream>> {
            self.record(route, None);
            let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(16);
            tokio::spawn(async move {
                let mut seq = 0;
                let _target = body.recv().await;
                while body.recv().await.is_some() {
                    let ack = format!("{{\"status\":\"ok\",\"seq\":{}}}\n", seq);
                    if tx.send(Ok(Bytes::from(ack))).await.is_err() {
                        return;
                    }
                    seq += 1;
                }
            });
            async move { Ok(ReceiverStream::new(rx).boxed()) }.boxed()
        }
    }

    fn client(transport: FakeTransport) -> Client<FakeTransport> {
        Client::with_transport(
            transport,
            ClientConfig::default().with_drain_timeout(std::time::Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn single_exec_requires_one_result() {
        let client = client(FakeTransport::default().respond(
            Route::Exec,
            200,
            r#"[{"statementText":"a"},{"statementText":"b"}]"#,
        ));
        assert!(matches!(
            client.single_exec(&ExecPayload::new("A; B;")).await,
            Err(KsqlError::UnexpectedResultCount { got: 2 })
        ));
    }

    #[tokio::test]
    async fn list_streams_reads_streams_section() {
        let client = client(FakeTransport::default().respond(
            Route::Exec,
            200,
            r#"[{"@type":"streams","statementText":"LIST STREAMS;","streams":[{"name":"PAGEVIEWS","topic":"pageviews","format":"JSON","type":"STREAM"}]}]"#,
        ));
        let streams = client.list_streams().await.unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].name, "PAGEVIEWS");
        assert_eq!(
            client.transport().sent(Route::Exec),
            vec![Some(json!({"ksql": "LIST STREAMS;"}))]
        );
    }

    #[tokio::test]
    async fn exec_error_status_is_a_server_error() {
        let client = client(FakeTransport::default().respond(
            Route::Exec,
            400,
            r#"{"@type":"statement_error","error_code":40001,"message":"line 1:1: mismatched input"}"#,
        ));
        assert!(matches!(
            client.exec(&ExecPayload::new("NOPE;")).await,
            Err(KsqlError::Server { code: 40001, .. })
        ));
    }

    #[tokio::test]
    async fn rejected_query_is_a_statement_error() {
        let client = client(FakeTransport::default().respond(
            Route::Query,
            400,
            r#"{"@type":"statement_error","message":"no such stream"}"#,
        ));
        assert!(matches!(
            client.query(&QueryPayload::new("SELECT * FROM X;")).await,
            Err(KsqlError::Statement { .. })
        ));
    }

    #[tokio::test]
    async fn closing_a_push_query_tells_the_server() {
        let client = client(FakeTransport::default().stream(vec![
            r#"{"queryId":"q-7","columnNames":["N"],"columnTypes":["INTEGER"]}"#,
            "[1]",
        ]));
        let ctx = Context::background();
        let stream = client
            .query_stream(&ctx, &QueryStreamPayload::new("SELECT N FROM S EMIT CHANGES;"))
            .await
            .unwrap();

        let mut row = Row::new();
        assert!(stream.next(&mut row).await.unwrap());
        assert_eq!(row, vec![json!(1)]);

        stream.close().await.unwrap();
        assert_eq!(
            client.transport().sent(Route::CloseQuery),
            vec![Some(json!({"queryId": "q-7"}))]
        );
    }

    #[tokio::test]
    async fn inserts_stream_sends_target_first() {
        let client = client(FakeTransport::default());
        let ctx = Context::background();
        let writer = client.inserts_stream(&ctx, "PAGEVIEWS").await.unwrap();
        assert_eq!(writer.target(), "PAGEVIEWS");

        writer.write_json(&ctx, &json!({"ID": 1})).await.unwrap();
        writer.write_json(&ctx, &json!({"ID": 2})).await.unwrap();
        assert_eq!(writer.next_seq(), 2);
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn bulk_close_reaches_live_streams_only() {
        let client = client(FakeTransport::default().stream(vec![
            r#"{"queryId":"q-1","columnNames":["N"],"columnTypes":["INTEGER"]}"#,
        ]));
        let ctx = Context::background();

        let kept = client
            .query_stream(&ctx, &QueryStreamPayload::new("SELECT N FROM S EMIT CHANGES;"))
            .await
            .unwrap();
        let dropped = client
            .query_stream(&ctx, &QueryStreamPayload::new("SELECT N FROM S EMIT CHANGES;"))
            .await
            .unwrap();
        let writer = client.inserts_stream(&ctx, "S").await.unwrap();
        drop(dropped);
        assert_eq!(client.open_streams(), 2);

        client.close().await.unwrap();
        assert!(kept.is_closed());
        assert!(writer.is_closed());
        assert_eq!(client.open_streams(), 0);
        assert_eq!(client.transport().sent(Route::CloseQuery).len(), 1);

        // closing again is a no-op
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_stops_opening() {
        let client = client(FakeTransport::default());
        let ctx = Context::background();
        ctx.cancel();
        assert!(matches!(
            client.inserts_stream(&ctx, "S").await,
            Err(KsqlError::Cancelled(_))
        ));
    }
}
