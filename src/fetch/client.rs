use async_trait::async_trait;
use reqwest::{Request, Response};

/// Minimal HTTP seam so feed auth can be layered as wrappers and the
/// poller can be tested against a mock endpoint.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Box<C> {
    async fn execute(&self, req: Request) -> reqwest::Result<Response> {
        (**self).execute(req).await
    }
}
