//! Fetch capability
//!
//! A [`Fetcher`] turns merged parameters into a raw upstream response. The
//! pipeline treats it as opaque; all it relies on is that failures are
//! classified as transient or permanent ([`FetchError::is_transient`]).

pub mod finnhub;

use crate::error::FetchError;
use crate::model::RawResponse;
use async_trait::async_trait;
use finhub_common::types::Params;
use std::future::Future;

pub use finnhub::{EndpointFetcher, FinnhubClient};

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, params: &Params) -> Result<RawResponse, FetchError>;

    /// Short label for logs, e.g. the upstream endpoint.
    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// Adapts an async closure into a [`Fetcher`].
pub struct FnFetcher<F> {
    label: String,
    f: F,
}

impl<F, Fut> FnFetcher<F>
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RawResponse, FetchError>> + Send,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RawResponse, FetchError>> + Send,
{
    async fn fetch(&self, params: &Params) -> Result<RawResponse, FetchError> {
        (self.f)(params.clone()).await
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
