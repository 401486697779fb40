use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::server::ParserServer;

pub async fn run_http_server(
    address: String,
    server: Arc<ParserServer>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(&address).await?;
    info!("🌐 HTTP stats listening on http://{}", address);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let server = server.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let server = server.clone();
                async move { handle_request(req, server).await }
            });

            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .serve_connection(io, service)
                .await
            {
                error!("Error serving connection: {:?}", err);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    server: Arc<ParserServer>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    server.request_count.fetch_add(1, Ordering::Relaxed);

    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let body = match (&method, path.as_str()) {
        (&Method::GET, "") => server.server_status().to_string(),
        (&Method::GET, "/share_stats") | (&Method::POST, "/share_stats") => {
            let query = request_query(req).await;
            share_stats_response(&server, query.as_deref())
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        }
    };

    server
        .response_bytes
        .fetch_add(body.len() as u64, Ordering::Relaxed);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default())
}

/// GET requests carry the query in the URI, POST requests in the body.
async fn request_query(req: Request<Incoming>) -> Option<String> {
    if req.method() == Method::POST {
        let bytes = req.into_body().collect().await.ok()?.to_bytes();
        if bytes.is_empty() {
            return None;
        }
        String::from_utf8(bytes.to_vec()).ok()
    } else {
        req.uri().query().map(|q| q.to_string())
    }
}

fn share_stats_response(server: &ParserServer, query: Option<&str>) -> String {
    let invalid_args = json!({"err_no": 1, "err_msg": "invalid args"}).to_string();

    let Some(query) = query else {
        return invalid_args;
    };
    let params = parse_query(query);

    let (Some(user_id), Some(worker_ids), Some(hours)) = (
        params_get(&params, "user_id").and_then(|v| v.parse::<i32>().ok()),
        params_get(&params, "worker_id").map(parse_i64_list),
        params_get(&params, "hour").map(parse_i32_list),
    ) else {
        return invalid_args;
    };

    let data = server.share_stats(user_id, &worker_ids, &hours);
    json!({"err_no": 0, "err_msg": "", "data": data}).to_string()
}

pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

pub fn params_get<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn parse_i64_list(value: &str) -> Vec<i64> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

fn parse_i32_list(value: &str) -> Vec<i32> {
    value
        .split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}
