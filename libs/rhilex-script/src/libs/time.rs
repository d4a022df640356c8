//! `time`: clocks, NTP and cancellable sleep

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use mlua::Lua;
use tokio::net::UdpSocket;

use super::{pair, Namespace};
use crate::env::VmContext;

const NTP_SERVER: &str = "pool.ntp.org:123";
/// Seconds between 1900-01-01 and the UNIX epoch
const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;
const NTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Transmit timestamp of an SNTP reply as a local datetime
fn parse_ntp_reply(reply: &[u8]) -> Result<String, String> {
    if reply.len() < 48 {
        return Err(format!("short ntp reply: {} bytes", reply.len()));
    }
    let secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]) as u64;
    let frac = u32::from_be_bytes([reply[44], reply[45], reply[46], reply[47]]) as u64;
    let unix = secs
        .checked_sub(NTP_EPOCH_OFFSET)
        .ok_or_else(|| "invalid ntp timestamp".to_string())?;
    let nanos = ((frac * 1_000_000_000) >> 32) as u32;
    let ts = DateTime::from_timestamp(unix as i64, nanos)
        .ok_or_else(|| "invalid ntp timestamp".to_string())?;
    Ok(ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
}

async fn query_ntp(server: &str) -> Result<String, String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|e| e.to_string())?;
    socket.connect(server).await.map_err(|e| e.to_string())?;
    let mut request = [0u8; 48];
    // LI = 0, VN = 3, Mode = 3 (client)
    request[0] = 0x1B;
    socket.send(&request).await.map_err(|e| e.to_string())?;
    let mut reply = [0u8; 48];
    let n = tokio::time::timeout(NTP_TIMEOUT, socket.recv(&mut reply))
        .await
        .map_err(|_| "ntp request timeout".to_string())?
        .map_err(|e| e.to_string())?;
    parse_ntp_reply(&reply[..n])
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "time")?;
    ns.add("Time", |_, ()| Ok(common::time::local_datetime()))?;
    ns.add("TimeMs", |_, ()| Ok(common::time::local_datetime_ms()))?;
    ns.add("TsUnix", |_, ()| Ok(common::time::now_secs()))?;
    ns.add("TsUnixNano", |_, ()| Ok(common::time::now_nanos()))?;

    let vm = Arc::clone(ctx);
    ns.add("NtpTime", move |_, ()| {
        let result = vm.block_on(query_ntp(NTP_SERVER))?;
        Ok(pair(result))
    })?;

    let vm = Arc::clone(ctx);
    ns.add("Sleep", move |_, ms: u64| {
        vm.block_on(async move { tokio::time::sleep(Duration::from_millis(ms)).await })
    })?;
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::libs::testing::vm;

    #[test]
    fn test_parse_ntp_reply() {
        let mut reply = [0u8; 48];
        // 2000-01-01T00:00:00Z
        let secs = (946_684_800u64 + NTP_EPOCH_OFFSET) as u32;
        reply[40..44].copy_from_slice(&secs.to_be_bytes());
        let local = parse_ntp_reply(&reply).unwrap();
        assert_eq!(local.len(), 19);
        assert!(parse_ntp_reply(&reply[..10]).is_err());
        assert!(parse_ntp_reply(&[0u8; 48]).is_err());
    }

    #[test]
    fn test_clock_functions() {
        let lua = vm();
        let (now, secs): (String, i64) = lua
            .load("return time:Time(), time.TsUnix()")
            .eval()
            .unwrap();
        assert_eq!(now.len(), 19);
        assert!(secs > 1_600_000_000);
    }

    #[test]
    fn test_sleep_needs_runtime() {
        let lua = vm();
        assert!(lua.load("time:Sleep(1)").exec().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sleep_inside_runtime() {
        let result = tokio::task::spawn_blocking(|| {
            let lua = vm();
            lua.load("time:Sleep(5) return 1").eval::<i64>()
        })
        .await
        .unwrap();
        assert_eq!(result.unwrap(), 1);
    }
}
