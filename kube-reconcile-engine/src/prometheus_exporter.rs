use std::{convert::Infallible, net::SocketAddr};

use http_body_util::Full;
use hyper::{
    Request, Response,
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;

fn serve_req(
    _req: Request<Incoming>,
    registry: &Registry,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => Response::builder()
            .status(200)
            .header(CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(result))),
        Err(e) => {
            error!("{}", e);
            Response::builder().status(500).body(Full::new(Bytes::new()))
        }
    }
}

/// Serve the metrics gathered by `registry` in the Prometheus text format.
/// Only returns if the listener cannot be bound.
pub async fn start_prometheus_metrics_server(
    addr: SocketAddr,
    registry: Registry,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Serving metrics on http://{}/metrics", addr);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("failed to accept metrics connection: {}", e);
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let response = serve_req(req, &registry);
                async move { Ok::<_, Infallible>(response.unwrap_or_else(internal_error)) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("metrics connection from {} failed: {}", peer, e);
            }
        });
    }
}

fn internal_error(e: hyper::http::Error) -> Response<Full<Bytes>> {
    error!("failed to build metrics response: {}", e);
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use hyper::client::conn::http1 as client;
    use prometheus::{IntCounter, Opts};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_registry_in_text_format() {
        let registry = Registry::new();
        let counter = IntCounter::with_opts(Opts::new("test_total", "test counter")).unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        counter.inc();

        // find a free port
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        tokio::spawn(start_prometheus_metrics_server(addr, registry));

        let stream = loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
            }
        };
        let (mut sender, connection) = client::handshake(TokioIo::new(stream)).await.unwrap();
        tokio::spawn(connection);
        let response = sender
            .send_request(
                Request::get("/metrics")
                    .header(hyper::header::HOST, "localhost")
                    .body(Full::new(Bytes::new()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(200, response.status().as_u16());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("test_total 1"));
    }
}
