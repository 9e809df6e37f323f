//! Plain WebSocket listener.

use anyhow::Result;
use ndt7_engine::Session;
use ndt7_engine::session::new_uuid;
use ndt7_engine::transport::websocket::WebSocketTransport;
use ndt7_model::SubtestKind;
use ndt7_model::protocol::{DEFAULT_WEBSOCKET_BUFFER_SIZE, SEC_WEBSOCKET_PROTOCOL};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode, header};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Query = Vec<(String, String)>;

pub async fn serve(listener: TcpListener, session: Session, shutdown: CancellationToken) -> Result<()> {
    info!("ndt7+ws listening on {}", listener.local_addr()?);
    loop {
        let (tcp, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        debug!(%peer, "connection accepted");
        let session = session.clone();
        tokio::spawn(async move { handle(tcp, session).await });
    }
}

async fn handle(tcp: TcpStream, session: Session) {
    let config = WebSocketConfig::default()
        .read_buffer_size(DEFAULT_WEBSOCKET_BUFFER_SIZE)
        .max_message_size(Some(session.bounds().max_message_size));

    let mut negotiated: Option<(SubtestKind, Query)> = None;
    let upgraded = accept_hdr_async_with_config(
        tcp,
        |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let (kind, query, resp) = negotiate(req, resp)?;
            negotiated = Some((kind, query));
            Ok(resp)
        },
        Some(config),
    )
    .await;

    let ws = match upgraded {
        Ok(ws) => ws,
        Err(e) => {
            debug!(error = %e, "upgrade failed");
            if let Some((kind, _)) = negotiated {
                session.observer().client_connection(kind, "websocket-error");
            }
            return;
        }
    };
    let Some((kind, query)) = negotiated else {
        return;
    };

    let transport = match WebSocketTransport::from_tcp(ws, new_uuid()) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "cannot identify connection");
            session.observer().client_connection(kind, "uuid-error");
            return;
        }
    };
    match session.run_measurement(kind, transport, &query).await {
        Ok(outcome) => {
            if let Some(e) = outcome.error {
                debug!(error = %e, "subtest ended with an error");
            }
        }
        Err(e) => warn!(error = %e, "session failed"),
    }
}

fn reject(status: StatusCode, msg: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Picks the subtest from the request path and checks the client asked
/// for the ndt7 subprotocol.
fn negotiate(req: &Request, mut resp: Response) -> Result<(SubtestKind, Query, Response), ErrorResponse> {
    let kind = SubtestKind::from_path(req.uri().path())
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "unknown subtest"))?;
    let offered = req
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == SEC_WEBSOCKET_PROTOCOL);
    if !offered {
        return Err(reject(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Protocol header"));
    }
    resp.headers_mut().insert(
        header::SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(SEC_WEBSOCKET_PROTOCOL),
    );
    let query = req.uri().query().map(parse_query).unwrap_or_default();
    Ok((kind, query, resp))
}

/// Splits an `application/x-www-form-urlencoded` query, keeping order and
/// repeated keys.
fn parse_query(query: &str) -> Query {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            (unescape(name), unescape(value))
        })
        .collect()
}

fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, proto: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(path);
        if let Some(p) = proto {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, p);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_negotiate_download_with_query() {
        let req = request(
            "/ndt/v7/download?client_name=ndt7-go&client_os=linux%2Famd64",
            Some("foo, net.measurementlab.ndt.v7"),
        );
        let (kind, query, resp) = negotiate(&req, Response::new(())).unwrap();
        assert_eq!(kind, SubtestKind::Download);
        assert_eq!(
            query,
            vec![
                ("client_name".to_string(), "ndt7-go".to_string()),
                ("client_os".to_string(), "linux/amd64".to_string()),
            ]
        );
        assert_eq!(
            resp.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
            SEC_WEBSOCKET_PROTOCOL
        );
    }

    #[test]
    fn test_negotiate_rejects_unknown_path_and_missing_protocol() {
        let err = negotiate(&request("/ndt/v5", Some(SEC_WEBSOCKET_PROTOCOL)), Response::new(())).unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let err = negotiate(&request("/ndt/v7/upload", None), Response::new(())).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_query_edge_cases() {
        assert_eq!(
            parse_query("a=1&&b&c=x+y&d=%zz&e=%4"),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), String::new()),
                ("c".to_string(), "x y".to_string()),
                ("d".to_string(), "%zz".to_string()),
                ("e".to_string(), "%4".to_string()),
            ]
        );
    }
}
