use axum::extract::MatchedPath;
use axum::{Router, routing::get};
use futures_util::future::BoxFuture;
use http::{Request, StatusCode};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::{Layer, Service};

use crate::shutdown::shutdown_signal;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SERVER_STARTED: OnceLock<()> = OnceLock::new();

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Spawns the process-wide Prometheus endpoint when `METRICS_PORT` is
/// set. The endpoint gets its own listener so scrapes keep working even
/// while the main surface is saturated; calling this more than once is a
/// no-op.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = metric_port_env() else {
        return;
    };
    let Some(node_id) = node_id_env() else {
        eprintln!("🛑 NODE_ID not set; refusing to start the metrics server");
        return;
    };
    // A panic on any thread must take the process down so the platform
    // restarts it, instead of limping on with a dead worker or exporter.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        let _ = install_recorder_once();
        tokio::spawn(run_metrics_server(port, node_id));
    }
}

pub async fn run_metrics_server(port: u16, node_id: String) {
    let handle = install_recorder_once().clone();
    let metrics_route = {
        let handle = handle.clone();
        axum::routing::get(move || async move { handle.render() })
    };
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", metrics_route)
        .layer(MetricsLayer::new(node_id));
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("🛑 metrics server could not bind {}: {}", addr, e);
            e
        })
        .unwrap();
    println!(
        "{}{}",
        "📈 metrics server listening • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("serve metrics");
    println!(
        "{} {}",
        "🛑 metrics server stopped • uptime was".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}

fn metric_port_env() -> Option<u16> {
    std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
}

fn node_id_env() -> Option<String> {
    std::env::var("NODE_ID").ok()
}

/// Tower layer recording request count, latency, and in-flight gauge per
/// route. Labels use `MatchedPath` so raw URLs with resource ids never
/// blow up the cardinality.
#[derive(Clone)]
pub struct MetricsLayer {
    node_id: String,
}

impl MetricsLayer {
    fn new(node_id: String) -> Self {
        Self { node_id }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            node_id: self.node_id.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    node_id: String,
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let start = Instant::now();
        let method = req.method().as_str().to_owned();
        // resolved before the async block; MatchedPath is not Send-safe
        // to carry across the await
        let route: String = req
            .extensions()
            .get::<MatchedPath>()
            .map(|m| m.as_str().to_owned())
            .unwrap_or_else(|| "UNKNOWN".to_string());

        let mut svc = self.inner.clone();
        let fut = svc.call(req);
        let node_id = self.node_id.clone();

        Box::pin(async move {
            let in_flight =
                gauge!("orchestrator_http_in_flight_requests", "method" => method.clone());
            in_flight.increment(1);

            let result = fut.await;
            let elapsed = start.elapsed().as_secs_f64();

            let status = match &result {
                Ok(response) => response.status(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };

            histogram!(
                "orchestrator_http_request_duration_seconds",
                "method" => method.clone(),
                "route" => route.clone(),
                "status" => status.as_u16().to_string(),
                "node_id" => node_id.clone()
            )
            .record(elapsed);

            counter!(
                "orchestrator_http_requests_total",
                "method" => method,
                "route" => route,
                "status" => status.as_u16().to_string(),
                "node_id" => node_id
            )
            .increment(1);

            in_flight.decrement(1);

            result
        })
    }
}
