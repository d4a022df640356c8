//! `audio`: hand a sound file to the configured external player

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use mlua::Lua;
use tracing::debug;

use super::{err_only, Namespace};
use crate::env::VmContext;

fn play(player: &str, path: &str) -> Result<(), String> {
    if !Path::new(path).is_file() {
        return Err(format!("file not exists:{}", path));
    }
    let mut child = Command::new(player)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", player, e))?;
    debug!("Playing {} with {} (pid {})", path, player, child.id());
    // reap
    std::thread::spawn(move || child.wait());
    Ok(())
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "audio")?;
    let player = ctx.env.runtime().config.audio_player.clone();
    ns.add("PlayMusic", move |_, path: String| Ok(err_only(play(&player, &path))))?;
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_reported() {
        let err = play("aplay", "/definitely/not/here.wav").unwrap_err();
        assert_eq!(err, "file not exists:/definitely/not/here.wav");
    }
}
