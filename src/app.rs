//! Boundary to the code that answers requests.

use async_trait::async_trait;

use crate::http::context::HttpContext;
use crate::http::request::Method;
use crate::http::response::StatusCode;

/// Produces a response for each parsed request.
///
/// Runs on the connection's loop thread, so the returned future need not
/// be `Send`. Returning an error before any body byte was written yields a
/// 500 response; after that the connection is aborted.
#[async_trait(?Send)]
pub trait Application: Send + Sync + 'static {
    async fn process_request(&self, ctx: &mut HttpContext) -> anyhow::Result<()>;
}

/// Small application used by the binary: `POST /echo` returns the request
/// body, everything else gets a greeting.
#[derive(Debug, Default, Clone)]
pub struct HelloApp;

#[async_trait(?Send)]
impl Application for HelloApp {
    async fn process_request(&self, ctx: &mut HttpContext) -> anyhow::Result<()> {
        match (ctx.method(), ctx.path()) {
            (Method::POST, "/echo") => {
                let body = ctx.read_body_to_end().await?;
                ctx.set_header("Content-Type", "application/octet-stream")?;
                ctx.set_header("Content-Length", body.len().to_string())?;
                ctx.write(&body).await?;
            }
            (Method::GET | Method::HEAD, _) => {
                let body = b"Hello from h1loop\n";
                ctx.set_header("Content-Type", "text/plain")?;
                ctx.set_header("Content-Length", body.len().to_string())?;
                ctx.write(body).await?;
            }
            _ => {
                ctx.set_status(StatusCode::METHOD_NOT_ALLOWED);
                ctx.set_header("Allow", "GET, HEAD, POST")?;
            }
        }
        Ok(())
    }
}
