//! `http`, `rpc` and `network`

use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{Lua, Value};
use tokio::net::TcpStream;

use super::json::lua_to_json;
use super::{pair, Namespace};
use crate::env::VmContext;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PING_TIMEOUT_MS: u64 = 3000;

async fn read_body(resp: reqwest::Response) -> Result<String, String> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| e.to_string())?;
    if !status.is_success() {
        return Err(format!("http status {}: {}", status.as_u16(), body));
    }
    Ok(body)
}

async fn get(client: reqwest::Client, url: String) -> Result<String, String> {
    let resp = client.get(&url).send().await.map_err(|e| e.to_string())?;
    read_body(resp).await
}

async fn post(
    client: reqwest::Client,
    url: String,
    body: String,
    content_type: String,
) -> Result<String, String> {
    let resp = client
        .post(&url)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .body(body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    read_body(resp).await
}

async fn request_json(
    client: reqwest::Client,
    url: String,
    payload: serde_json::Value,
) -> Result<String, String> {
    let resp = client
        .post(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    read_body(resp).await
}

/// Milliseconds to open a TCP connection to `addr`
async fn tcp_ping(addr: String, timeout: Duration) -> Result<u64, String> {
    let started = Instant::now();
    tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| format!("ping timeout:{}", addr))?
        .map_err(|e| e.to_string())?;
    Ok(started.elapsed().as_millis() as u64)
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(mlua::Error::external)?;

    let ns = Namespace::new(lua, "http")?;
    let (vm, c) = (Arc::clone(ctx), client.clone());
    ns.add("Get", move |_, url: String| {
        Ok(pair(vm.block_on(get(c.clone(), url))?))
    })?;
    let (vm, c) = (Arc::clone(ctx), client.clone());
    ns.add(
        "Post",
        move |_, (url, body, content_type): (String, String, Option<String>)| {
            let content_type = content_type.unwrap_or_else(|| "application/json".to_string());
            Ok(pair(vm.block_on(post(c.clone(), url, body, content_type))?))
        },
    )?;
    ns.register()?;

    let ns = Namespace::new(lua, "rpc")?;
    let (vm, c) = (Arc::clone(ctx), client);
    ns.add("Request", move |lua, (url, data): (String, Value)| {
        let payload = match data {
            Value::String(s) => serde_json::from_slice(s.as_bytes())
                .unwrap_or_else(|_| serde_json::Value::String(s.to_string_lossy().into_owned())),
            other => lua_to_json(lua, other)?,
        };
        Ok(pair(vm.block_on(request_json(c.clone(), url, payload))?))
    })?;
    ns.register()?;

    let ns = Namespace::new(lua, "network")?;
    let vm = Arc::clone(ctx);
    ns.add("Ping", move |_, (addr, timeout_ms): (String, Option<u64>)| {
        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_PING_TIMEOUT_MS));
        Ok(pair(vm.block_on(tcp_ping(addr, timeout))?))
    })?;
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_ping_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let ms = tcp_ping(addr, Duration::from_secs(1)).await.unwrap();
        assert!(ms < 1000);
    }

    #[tokio::test]
    async fn test_tcp_ping_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(tcp_ping(addr, Duration::from_secs(1)).await.is_err());
    }
}
