// src/address.rs
use eyre::{Result, WrapErr};

/// Re-encodes chain-internal address forms (validator operator etc.) into
/// the account form used as the aggregation key.
pub trait AddressConverter: Send + Sync {
    fn to_account(&self, raw: &str) -> Result<String>;
}

/// Swaps the bech32 human-readable prefix, keeping the payload.
#[derive(Debug, Clone)]
pub struct Bech32Converter {
    prefix: String,
}

impl Bech32Converter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl AddressConverter for Bech32Converter {
    fn to_account(&self, raw: &str) -> Result<String> {
        let (_hrp, data, variant) =
            bech32::decode(raw).wrap_err_with(|| format!("invalid bech32 address {:?}", raw))?;
        let converted = bech32::encode(&self.prefix, data, variant)
            .wrap_err_with(|| format!("cannot encode {:?} with prefix {}", raw, self.prefix))?;
        Ok(converted)
    }
}
