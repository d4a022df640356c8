//! Extra functions on the standard `string` table

use mlua::{Lua, Value};

use super::binary::bytes_arg;
use super::Namespace;

/// Text of a byte buffer with trailing NUL padding removed
pub(crate) fn bin_to_text(data: &[u8]) -> String {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&data[..end]).into_owned()
}

pub(super) fn install(lua: &Lua) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "string")?;
    ns.add("T2Str", |lua, data: Value| lua.create_string(bytes_arg(data)?))?;
    ns.add("Bin2Str", |_, data: Value| Ok(bin_to_text(&bytes_arg(data)?)))?;
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::libs::testing::vm;

    #[test]
    fn test_bin_to_text_trims_padding() {
        assert_eq!(bin_to_text(b"abc\0\0"), "abc");
        assert_eq!(bin_to_text(b"\0\0"), "");
        assert_eq!(bin_to_text(b"a\0b"), "a\0b");
    }

    #[test]
    fn test_byte_table_to_string() {
        let lua = vm();
        let s: String = lua.load("return string:T2Str({72, 105})").eval().unwrap();
        assert_eq!(s, "Hi");
    }
}
