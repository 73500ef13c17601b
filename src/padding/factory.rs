use crate::util::{AnyTlsError, Result, StringMap};

/// Padding scheme advertised to clients when none is configured
pub const DEFAULT_PADDING_SCHEME: &str = r#"stop=8
0=30-30
1=100-400
2=400-500,c,500-1000,c,500-1000,c,500-1000,c,500-1000
3=9-9,500-1000
4=500-1000
5=500-1000
6=500-1000
7=500-1000"#;

/// Parsed padding scheme and its identity.
///
/// The server never pads its own writes. It only needs the raw text (sent
/// in `UpdatePaddingScheme`) and the md5 clients compare against.
#[derive(Debug, Clone)]
pub struct PaddingFactory {
    raw_scheme: Vec<u8>,
    md5: String,
}

impl PaddingFactory {
    /// Parse and validate a scheme
    pub fn new(raw_scheme: &[u8]) -> Result<Self> {
        let scheme = StringMap::from_bytes(raw_scheme);

        let stop = scheme
            .get("stop")
            .ok_or_else(|| AnyTlsError::PaddingScheme("missing 'stop' in padding scheme".into()))?
            .parse::<u32>()
            .map_err(|_| AnyTlsError::PaddingScheme("invalid 'stop' value".into()))?;

        for pkt in 0..stop {
            if let Some(entry) = scheme.get(&pkt.to_string()) {
                validate_rule(pkt, entry)?;
            }
        }

        Ok(Self::from_valid(raw_scheme.to_vec()))
    }

    fn from_valid(raw_scheme: Vec<u8>) -> Self {
        Self {
            md5: format!("{:x}", md5::compute(&raw_scheme)),
            raw_scheme,
        }
    }

    /// Lowercase hex md5 of the raw scheme
    pub fn md5(&self) -> &str {
        &self.md5
    }

    pub fn raw_scheme(&self) -> &[u8] {
        &self.raw_scheme
    }
}

impl Default for PaddingFactory {
    fn default() -> Self {
        Self::from_valid(DEFAULT_PADDING_SCHEME.as_bytes().to_vec())
    }
}

/// Each part is `c` or a `min-max` range of non-zero sizes
fn validate_rule(pkt: u32, entry: &str) -> Result<()> {
    let invalid = |part: &str| {
        AnyTlsError::PaddingScheme(format!("invalid entry '{}' for packet {}", part, pkt))
    };

    for part in entry.split(',').map(str::trim) {
        if part == "c" {
            continue;
        }
        let (min, max) = part.split_once('-').ok_or_else(|| invalid(part))?;
        let min = min.trim().parse::<u32>().map_err(|_| invalid(part))?;
        let max = max.trim().parse::<u32>().map_err(|_| invalid(part))?;
        if min == 0 || max == 0 {
            return Err(invalid(part));
        }
    }
    Ok(())
}
