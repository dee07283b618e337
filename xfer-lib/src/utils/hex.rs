pub fn fmt_hex(f: &mut std::fmt::Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    for x in bytes {
        write!(f, "{:02x}", x)?;
    }
    Ok(())
}
