use crate::http::{make_boxed_error_response, make_boxed_json_response};
use crate::metrics_defs::MetricDef;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

#[derive(Serialize)]
struct StatusBody {
    status: &'static str,
}

/// Liveness, readiness and metric catalogue endpoints served on the admin listener.
///
/// - `GET /health` always answers 200.
/// - `GET /ready` answers 200 once `is_ready` returns true, 503 before.
/// - `GET /metrics` lists the metric definitions the service emits.
pub struct AdminService<F, E> {
    is_ready: F,
    metric_defs: &'static [MetricDef],
    _error: PhantomData<E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F, metric_defs: &'static [MetricDef]) -> Self {
        Self {
            is_ready,
            metric_defs,
            _error: PhantomData,
        }
    }
}

impl<F, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> bool + Clone + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let is_ready = (self.is_ready)();
        let metric_defs = self.metric_defs;

        Box::pin(async move {
            if req.method() != Method::GET {
                return Ok(make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED));
            }

            let res = match req.uri().path() {
                "/health" => make_boxed_json_response(StatusCode::OK, &StatusBody { status: "ok" }),
                "/ready" if is_ready => {
                    make_boxed_json_response(StatusCode::OK, &StatusBody { status: "ready" })
                }
                "/ready" => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
                "/metrics" => make_boxed_json_response(StatusCode::OK, &metric_defs),
                _ => make_boxed_error_response(StatusCode::NOT_FOUND),
            };
            Ok(res)
        })
    }
}
