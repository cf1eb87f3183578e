use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Legacy (`1`), script-hash (`3`) and segwit (`bc1`) prefixes, followed by 25 to 39
    /// base58/bech32-looking characters. `I` and `O` never appear in either alphabet.
    static ref ADDRESS: Regex =
        Regex::new(r"^(1|3|bc1)[a-zA-HJ-NP-Z0-9]{25,39}$").expect("static regex");
}

/// Structural check that `address` looks like a mainnet address.
/// This does not verify checksums.
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS.is_match(address)
}
