use anyhow::{bail, Context};

pub trait ToHex: AsRef<[u8]> {
    fn to_hex(&self) -> String {
        faster_hex::hex_string(self.as_ref())
    }

    fn to_prefixed_hex(&self) -> String {
        format!("0x{}", self.to_hex())
    }
}

impl<T: AsRef<[u8]>> ToHex for T {}

/// Parses an Ethereum JSON-RPC quantity such as `0x1b4`.
pub fn parse_quantity(s: &str) -> anyhow::Result<u64> {
    let digits = s
        .strip_prefix("0x")
        .with_context(|| format!("quantity `{s}` is missing 0x prefix"))?;
    if digits.is_empty() {
        bail!("quantity `{s}` has no digits");
    }
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid quantity `{s}`"))
}

pub fn format_quantity(value: u64) -> String {
    format!("{value:#x}")
}

/// Parses `0x`-prefixed (or bare) hex of any even length.
pub fn parse_hex_bytes(s: &str) -> anyhow::Result<Vec<u8>> {
    let hex = s.strip_prefix("0x").unwrap_or(s);
    if hex.len() % 2 != 0 {
        bail!("hex string `{s}` has odd length");
    }
    let mut out = vec![0u8; hex.len() / 2];
    faster_hex::hex_decode(hex.as_bytes(), &mut out)
        .map_err(|err| anyhow::anyhow!("invalid hex `{s}`: {err}"))?;
    Ok(out)
}

pub fn parse_word(s: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = parse_hex_bytes(s)?;
    bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| anyhow::anyhow!("expected 32 bytes, got {}", bytes.len()))
}
