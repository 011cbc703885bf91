use crate::http::{make_boxed_error_response, make_text_response};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Health endpoints of a running service.
///
/// - `/health` always answers `ok`.
/// - `/ready` answers `ok` while `is_ready` holds, 503 otherwise.
/// - `/status` answers whatever `status` reports.
pub struct AdminService<F, S, E> {
    is_ready: F,
    status: S,
    _error: PhantomData<E>,
}

impl<F, S, E> AdminService<F, S, E>
where
    F: Fn() -> bool,
    S: Fn() -> String,
{
    pub fn new(is_ready: F, status: S) -> Self {
        Self {
            is_ready,
            status,
            _error: PhantomData,
        }
    }
}

impl<F, S, E> Service<Request<Incoming>> for AdminService<F, S, E>
where
    F: Fn() -> bool + Send + Sync + 'static,
    S: Fn() -> String + Send + Sync + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = match req.uri().path() {
            "/health" => make_text_response("ok\n"),
            "/ready" => match (self.is_ready)() {
                true => make_text_response("ok\n"),
                false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
            },
            "/status" => make_text_response(format!("{}\n", (self.status)())),
            _ => make_boxed_error_response(StatusCode::NOT_FOUND),
        };

        Box::pin(async move { Ok(res) })
    }
}
