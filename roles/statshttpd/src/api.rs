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

use crate::server::StatsServer;

pub async fn run_http_server(
    address: String,
    server: Arc<StatsServer>,
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
    server: Arc<StatsServer>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    server.request_count.fetch_add(1, Ordering::Relaxed);

    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();

    let body = if server.is_initializing() {
        // flushes are held back during initialization, so queries would
        // only see partial history
        json!({"err_no": 2, "err_msg": "service is initializing..."}).to_string()
    } else {
        match (&method, path.as_str()) {
            (&Method::GET, "") => server.server_status().to_string(),
            (&Method::GET, "/worker_status") | (&Method::POST, "/worker_status") => {
                let query = request_query(req).await;
                worker_status_response(&server, query.as_deref())
            }
            (&Method::GET, "/flush_db_time") => json!({
                "err_no": 0,
                "err_msg": "",
                "data": {
                    "flush_db_time": server.last_flush_time.load(Ordering::Relaxed),
                },
            })
            .to_string(),
            _ => {
                let mut response = Response::new(Full::new(Bytes::from("Not Found")));
                *response.status_mut() = StatusCode::NOT_FOUND;
                return Ok(response);
            }
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

fn worker_status_response(server: &StatsServer, query: Option<&str>) -> String {
    let invalid_args = json!({"err_no": 1, "err_msg": "invalid args"}).to_string();

    let Some(query) = query else {
        return invalid_args;
    };
    let params = parse_query(query);

    let (Some(user_id), Some(worker_ids)) = (
        params_get(&params, "user_id").and_then(|v| v.parse::<i32>().ok()),
        params_get(&params, "worker_id").map(parse_i64_list),
    ) else {
        return invalid_args;
    };

    // any value starting with T/t enables merging
    let is_merge = params_get(&params, "is_merge")
        .map(|v| v.starts_with('T') || v.starts_with('t'))
        .unwrap_or(false);

    let data = server.worker_status_response(user_id, &worker_ids, is_merge);
    json!({"err_no": 0, "err_msg": "", "data": data}).to_string()
}

pub fn format_uptime(secs: u64) -> String {
    format!(
        "{:04} d {:02} h {:02} m {:02} s",
        secs / 86_400,
        (secs % 86_400) / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use sharelog::{Share, ShareResult};
    use stats_core::unix_timestamp;

    fn test_server() -> StatsServer {
        StatsServer::new(Config::for_tests(), None, Vec::new(), None)
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0000 d 00 h 00 m 00 s");
        assert_eq!(format_uptime(86_400 + 3 * 3600 + 4 * 60 + 5), "0001 d 03 h 04 m 05 s");
    }

    #[test]
    fn test_worker_status_response_args() {
        let server = test_server();
        let now = unix_timestamp();
        let share = Share {
            job_id: 1,
            worker_hash_id: 42,
            user_id: 7,
            ip: 0x0a000001,
            result: ShareResult::Accept,
            timestamp: now as u32,
            share: 3,
            block_bits: 0x1d00ffff,
        };
        server.process_share(&share, now);

        assert!(worker_status_response(&server, None).contains("\"err_no\":1"));
        assert!(worker_status_response(&server, Some("worker_id=42")).contains("\"err_no\":1"));

        let ok = worker_status_response(&server, Some("user_id=7&worker_id=42"));
        assert!(ok.contains("\"err_no\":0"));
        assert!(ok.contains("\"42\""));

        let merged = worker_status_response(&server, Some("user_id=7&worker_id=42,43&is_merge=T"));
        assert!(merged.contains("\"0\""));
        assert!(!merged.contains("\"42\""));
    }

    #[test]
    fn test_is_merge_parsing() {
        let params = parse_query("is_merge=true");
        assert!(params_get(&params, "is_merge").unwrap().starts_with('t'));
        let params = parse_query("is_merge=F");
        assert!(!params_get(&params, "is_merge").unwrap().starts_with(['T', 't']));
    }
}
