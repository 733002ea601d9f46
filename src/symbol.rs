// =============================================================================
// Symbol normalization and candle-interval mapping
// =============================================================================
//
// Canonical symbol form is `BASE_QUOTE` (e.g. BTC_KRW). The venue's wire form
// is `QUOTE-BASE` (e.g. KRW-BTC). The normalizer accepts both, plus mixed
// case and dashed base-quote input, and is idempotent.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::ExitCode;

/// Quote currencies the venue lists markets under. Used to disambiguate
/// dashed input: `KRW-BTC` is wire form, `btc-krw` is a surface form.
const KNOWN_QUOTES: &[&str] = &["KRW", "BTC", "USDT"];

/// Canonical trading symbol, always `BASE_QUOTE` uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

/// Error carrying the result code surfaced to callers (`INVALID_ARGS`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolError {
    pub code: ExitCode,
    pub message: String,
}

impl std::fmt::Display for SymbolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SymbolError {}

fn invalid(msg: impl Into<String>) -> SymbolError {
    SymbolError {
        code: ExitCode::InvalidArgs,
        message: msg.into(),
    }
}

impl Symbol {
    /// Normalize any accepted surface form to `BASE_QUOTE`.
    ///
    /// Accepted: `btc-krw`, `BTC_KRW`, wire `KRW-BTC`, any casing.
    pub fn normalize(input: &str) -> Result<Self, SymbolError> {
        let upper = input.trim().to_uppercase();
        if upper.is_empty() {
            return Err(invalid("empty symbol"));
        }

        let (base, quote) = if let Some((a, b)) = upper.split_once('_') {
            (a.to_string(), b.to_string())
        } else if let Some((a, b)) = upper.split_once('-') {
            // Dashed input is ambiguous: `BTC-KRW` reads base-quote while the
            // wire form `KRW-BTC` reads quote-base. The second segment being
            // KRW always wins; otherwise a known quote in front means wire.
            if b == "KRW" {
                (a.to_string(), b.to_string())
            } else if KNOWN_QUOTES.contains(&a) {
                (b.to_string(), a.to_string())
            } else {
                (a.to_string(), b.to_string())
            }
        } else {
            return Err(invalid(format!("symbol '{input}' has no separator")));
        };

        if base.is_empty() || quote.is_empty() {
            return Err(invalid(format!("symbol '{input}' has an empty segment")));
        }
        if base == quote {
            return Err(invalid(format!("symbol '{input}' repeats its currency")));
        }
        if !base.chars().all(|c| c.is_ascii_alphanumeric())
            || !quote.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(invalid(format!("symbol '{input}' has invalid characters")));
        }

        Ok(Self(format!("{base}_{quote}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base currency (left of the underscore).
    pub fn base(&self) -> &str {
        self.0.split('_').next().unwrap_or("")
    }

    /// Quote currency (right of the underscore).
    pub fn quote(&self) -> &str {
        self.0.split('_').nth(1).unwrap_or("")
    }

    /// Venue wire form: `QUOTE-BASE`.
    pub fn to_wire(&self) -> String {
        format!("{}-{}", self.quote(), self.base())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Candle intervals
// =============================================================================

/// Closed set of candle intervals the venue serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CandleInterval {
    #[serde(rename = "1m")]
    Min1,
    #[serde(rename = "3m")]
    Min3,
    #[serde(rename = "5m")]
    Min5,
    #[serde(rename = "10m")]
    Min10,
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "30m")]
    Min30,
    #[serde(rename = "60m")]
    Min60,
    #[serde(rename = "240m")]
    Min240,
    #[serde(rename = "day")]
    Day,
    #[serde(rename = "week")]
    Week,
    #[serde(rename = "month")]
    Month,
}

impl CandleInterval {
    pub const ALL: &'static [CandleInterval] = &[
        Self::Min1,
        Self::Min3,
        Self::Min5,
        Self::Min10,
        Self::Min15,
        Self::Min30,
        Self::Min60,
        Self::Min240,
        Self::Day,
        Self::Week,
        Self::Month,
    ];

    /// Parse the textual form (`"15m"`, `"day"`). Anything outside the closed
    /// set fails with `INVALID_ARGS`.
    pub fn parse(input: &str) -> Result<Self, SymbolError> {
        match input {
            "1m" => Ok(Self::Min1),
            "3m" => Ok(Self::Min3),
            "5m" => Ok(Self::Min5),
            "10m" => Ok(Self::Min10),
            "15m" => Ok(Self::Min15),
            "30m" => Ok(Self::Min30),
            "60m" => Ok(Self::Min60),
            "240m" => Ok(Self::Min240),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            other => Err(invalid(format!("unsupported candle interval '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1m",
            Self::Min3 => "3m",
            Self::Min5 => "5m",
            Self::Min10 => "10m",
            Self::Min15 => "15m",
            Self::Min30 => "30m",
            Self::Min60 => "60m",
            Self::Min240 => "240m",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }

    /// REST path serving this interval.
    pub fn endpoint_path(self) -> String {
        match self {
            Self::Min1 => "/v1/candles/minutes/1".to_string(),
            Self::Min3 => "/v1/candles/minutes/3".to_string(),
            Self::Min5 => "/v1/candles/minutes/5".to_string(),
            Self::Min10 => "/v1/candles/minutes/10".to_string(),
            Self::Min15 => "/v1/candles/minutes/15".to_string(),
            Self::Min30 => "/v1/candles/minutes/30".to_string(),
            Self::Min60 => "/v1/candles/minutes/60".to_string(),
            Self::Min240 => "/v1/candles/minutes/240".to_string(),
            Self::Day => "/v1/candles/days".to_string(),
            Self::Week => "/v1/candles/weeks".to_string(),
            Self::Month => "/v1/candles/months".to_string(),
        }
    }
}

impl std::fmt::Display for CandleInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn normalize_accepts_all_surface_forms() {
        for input in ["btc-krw", "BTC_KRW", "Btc_Krw", "KRW-BTC", "krw-btc"] {
            let sym = Symbol::normalize(input).expect(input);
            assert_eq!(sym.as_str(), "BTC_KRW", "input {input}");
        }
        assert_eq!(Symbol::normalize("usdt-krw").unwrap().as_str(), "USDT_KRW");
        assert_eq!(Symbol::normalize("KRW-USDT").unwrap().as_str(), "USDT_KRW");
        assert_eq!(Symbol::normalize("eth_btc").unwrap().as_str(), "ETH_BTC");
        assert_eq!(Symbol::normalize("BTC-ETH").unwrap().as_str(), "ETH_BTC");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["btc-krw", "KRW-BTC", "XRP_KRW", "doge-krw"] {
            let once = Symbol::normalize(input).unwrap();
            let twice = Symbol::normalize(once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn wire_form_round_trips() {
        for input in ["BTC_KRW", "ETH_KRW", "USDT_KRW"] {
            let sym = Symbol::normalize(input).unwrap();
            let wire = sym.to_wire();
            assert_eq!(Symbol::normalize(&wire).unwrap(), sym);
        }
        assert_eq!(Symbol::normalize("BTC_KRW").unwrap().to_wire(), "KRW-BTC");
    }

    #[test]
    fn normalize_rejects_garbage() {
        for input in ["", "BTC", "BTC_", "_KRW", "BTC_BTC", "BT C_KRW"] {
            let err = Symbol::normalize(input).unwrap_err();
            assert_eq!(err.code, ExitCode::InvalidArgs, "input {input:?}");
        }
    }

    #[test]
    fn interval_set_maps_to_unique_endpoints() {
        let mut seen = HashSet::new();
        for iv in CandleInterval::ALL {
            let parsed = CandleInterval::parse(iv.as_str()).unwrap();
            assert_eq!(parsed, *iv);
            assert!(seen.insert(iv.endpoint_path()), "duplicate path for {iv}");
        }
        assert_eq!(seen.len(), 11);
        assert_eq!(
            CandleInterval::Min15.endpoint_path(),
            "/v1/candles/minutes/15"
        );
        assert_eq!(CandleInterval::Day.endpoint_path(), "/v1/candles/days");
    }

    #[test]
    fn interval_parse_rejects_outside_set() {
        for bad in ["2m", "1h", "4h", "min", "", "1440m"] {
            let err = CandleInterval::parse(bad).unwrap_err();
            assert_eq!(err.code, ExitCode::InvalidArgs, "input {bad:?}");
        }
    }
}
