//! HTTP transport seam
//!
//! [`Client`](crate::Client) talks to the server only through the
//! [`Transport`] trait, so the streaming machinery can be driven by an
//! in-memory implementation in tests. [`HttpTransport`] is the reqwest-backed
//! implementation used in production.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, TryStreamExt};
use log::debug;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Body, Method};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use url::Url;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::frames::ByteStream;
use crate::protocol::error_from_body;

pub const CONTENT_TYPE_JSON: &str = "application/vnd.ksql.v1+json";
pub const CONTENT_TYPE_DELIMITED: &str = "application/vnd.ksqlapi.delimited.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Exec,
    Query,
    QueryStream,
    CloseQuery,
    InsertsStream,
    TerminateCluster,
    Info,
    HealthCheck,
}

impl Route {
    pub fn path(self) -> &'static str {
        match self {
            Route::Exec => "/ksql",
            Route::Query => "/query",
            Route::QueryStream => "/query-stream",
            Route::CloseQuery => "/close-query",
            Route::InsertsStream => "/inserts-stream",
            Route::TerminateCluster => "/ksql/terminate",
            Route::Info => "/info",
            Route::HealthCheck => "/healthcheck",
        }
    }

    pub fn method(self) -> Method {
        match self {
            Route::Info | Route::HealthCheck => Method::GET,
            _ => Method::POST,
        }
    }

    /// Used for both `Content-Type` and `Accept`.
    pub fn content_type(self) -> &'static str {
        if self.is_streaming() {
            CONTENT_TYPE_DELIMITED
        } else {
            CONTENT_TYPE_JSON
        }
    }

    pub fn is_streaming(self) -> bool {
        matches!(self, Route::QueryStream | Route::InsertsStream)
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct Buffered {
    pub status: u16,
    pub body: Bytes,
}

impl Buffered {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-success response into a server error.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(error_from_body(self.status, &self.body))
        }
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Send a request and read the whole response.
    fn send(&self, route: Route, body: Option<Bytes>) -> BoxFuture<'_, Result<Buffered>>;

    /// Send a request and stream the response body back.
    ///
    /// Non-success statuses are reported as errors before any of the body is
    /// handed out.
    fn open_stream(&self, route: Route, body: Bytes) -> BoxFuture<'_, Result<ByteStream>>;

    /// Like [`open_stream`](Transport::open_stream), but the request body is
    /// fed from `body` for as long as the sender stays alive.
    fn open_duplex(
        &self,
        route: Route,
        body: mpsc::Receiver<Bytes>,
    ) -> BoxFuture<'_, Result<ByteStream>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    request_timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)?;
        let mut builder = reqwest::Client::builder();
        if config.http2_prior_knowledge {
            builder = builder.http2_prior_knowledge();
        }
        Ok(Self {
            client: builder.build()?,
            base,
            request_timeout: config.request_timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, route: Route) -> Url {
        let mut url = self.base.clone();
        let path = format!("{}{}", self.base.path().trim_end_matches('/'), route.path());
        url.set_path(&path);
        url
    }

    fn request(&self, route: Route) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(route.method(), self.url(route))
            .header(ACCEPT, route.content_type());
        if route.method() == Method::POST {
            builder.header(CONTENT_TYPE, route.content_type())
        } else {
            builder
        }
    }

    async fn stream_response(&self, route: Route, body: Body) -> Result<ByteStream> {
        let resp = self.request(route).body(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await?;
            return Err(error_from_body(status.as_u16(), &body));
        }
        debug!("{} opened ({})", route.path(), status);
        Ok(resp.bytes_stream().map_err(io::Error::other).boxed())
    }
}

impl Transport for HttpTransport {
    fn send(&self, route: Route, body: Option<Bytes>) -> BoxFuture<'_, Result<Buffered>> {
        async move {
            let mut req = self.request(route);
            if let Some(body) = body {
                req = req.body(body);
            }
            if let Some(timeout) = self.request_timeout {
                req = req.timeout(timeout);
            }
            let resp = req.send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;
            Ok(Buffered { status, body })
        }
        .boxed()
    }

    fn open_stream(&self, route: Route, body: Bytes) -> BoxFuture<'_, Result<ByteStream>> {
        self.stream_response(route, Body::from(body)).boxed()
    }

    fn open_duplex(
        &self,
        route: Route,
        body: mpsc::Receiver<Bytes>,
    ) -> BoxFuture<'_, Result<ByteStream>> {
        let body = Body::wrap_stream(ReceiverStream::new(body).map(Ok::<_, io::Error>));
        self.stream_response(route, body).boxed()
    }
}
