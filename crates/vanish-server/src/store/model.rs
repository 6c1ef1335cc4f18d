use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// How long a secret may live before the sweeper destroys it.
///
/// Wire names are the short codes; the labels used by the first version of
/// the service are still accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Lifetime {
    #[serde(rename = "5m", alias = "5 минут")]
    FiveMinutes,
    #[serde(rename = "1h", alias = "1 час")]
    OneHour,
    #[serde(rename = "12h", alias = "12 часов")]
    TwelveHours,
    #[serde(rename = "1d", alias = "1 день")]
    OneDay,
    #[serde(rename = "7d", alias = "7 дней")]
    SevenDays,
    #[serde(rename = "14d", alias = "14 дней")]
    FourteenDays,
}

impl Lifetime {
    pub const ALL: [Lifetime; 6] = [
        Lifetime::FiveMinutes,
        Lifetime::OneHour,
        Lifetime::TwelveHours,
        Lifetime::OneDay,
        Lifetime::SevenDays,
        Lifetime::FourteenDays,
    ];

    pub fn seconds(self) -> i64 {
        match self {
            Self::FiveMinutes => 5 * 60,
            Self::OneHour => 60 * 60,
            Self::TwelveHours => 12 * 60 * 60,
            Self::OneDay => 24 * 60 * 60,
            Self::SevenDays => 7 * 24 * 60 * 60,
            Self::FourteenDays => 14 * 24 * 60 * 60,
        }
    }

    /// Stable one-byte tag used as the leading component of the expiry index key.
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::FiveMinutes => 0,
            Self::OneHour => 1,
            Self::TwelveHours => 2,
            Self::OneDay => 3,
            Self::SevenDays => 4,
            Self::FourteenDays => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FiveMinutes => "5m",
            Self::OneHour => "1h",
            Self::TwelveHours => "12h",
            Self::OneDay => "1d",
            Self::SevenDays => "7d",
            Self::FourteenDays => "14d",
        }
    }
}

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Lifetime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "5m" | "5 минут" => Ok(Self::FiveMinutes),
            "1h" | "1 час" => Ok(Self::OneHour),
            "12h" | "12 часов" => Ok(Self::TwelveHours),
            "1d" | "1 день" => Ok(Self::OneDay),
            "7d" | "7 дней" => Ok(Self::SevenDays),
            "14d" | "14 дней" => Ok(Self::FourteenDays),
            other => Err(format!(
                "unknown lifetime '{other}' (expected one of 5m, 1h, 12h, 1d, 7d, 14d)"
            )),
        }
    }
}

/// Stored in redb as bincode-encoded bytes, keyed by `id`.
/// Both ciphertexts carry their own nonce prefix (see `crypto::Cipher`).
/// Owner, lifetime and timestamp stay plaintext so the sweep never decrypts.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    pub owner_id: u64,
    pub content_encrypted: Vec<u8>,
    /// Doubles as the lookup token handed back to the creator.
    pub passphrase_encrypted: Vec<u8>,
    #[zeroize(skip)]
    pub lifetime: Lifetime,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

impl SecretRecord {
    pub fn expires_at(&self) -> i64 {
        self.created_at + self.lifetime.seconds()
    }
}

/// Metadata returned on list endpoints. Never includes content or token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub id: u64,
    pub created_at: i64,
    pub lifetime: Lifetime,
    pub expires_at: i64,
}

/// 1-based page request. Sizes are clamped to `PageRequest::MAX_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub size: usize,
}

impl PageRequest {
    pub const DEFAULT_SIZE: usize = 50;
    pub const MAX_SIZE: usize = 100;

    pub fn new(page: Option<usize>, size: Option<usize>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            size: size
                .unwrap_or(Self::DEFAULT_SIZE)
                .clamp(1, Self::MAX_SIZE),
        }
    }

    pub(crate) fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.size)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    pub(crate) fn new(items: Vec<T>, total: usize, req: PageRequest) -> Self {
        Self {
            items,
            total,
            page: req.page,
            size: req.size,
            pages: total.div_ceil(req.size),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            size: self.size,
            pages: self.pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn lifetime_accepts_legacy_labels() {
        let l: Lifetime = serde_json::from_str("\"5 минут\"").unwrap();
        assert_eq!(l, Lifetime::FiveMinutes);
        let l: Lifetime = serde_json::from_str("\"14 дней\"").unwrap();
        assert_eq!(l, Lifetime::FourteenDays);
        assert_eq!(serde_json::to_string(&Lifetime::OneHour).unwrap(), "\"1h\"");
        assert_eq!("12 часов".parse::<Lifetime>().unwrap(), Lifetime::TwelveHours);
        assert!("3 weeks".parse::<Lifetime>().is_err());
    }

    #[test]
    fn lifetime_codes_are_unique() {
        let codes: BTreeSet<u8> = Lifetime::ALL.iter().map(|l| l.code()).collect();
        assert_eq!(codes.len(), Lifetime::ALL.len());
        assert_eq!(Lifetime::SevenDays.seconds(), 604_800);
    }

    #[test]
    fn expires_at_adds_bucket_length() {
        let record = SecretRecord {
            owner_id: 1,
            content_encrypted: vec![],
            passphrase_encrypted: vec![],
            lifetime: Lifetime::FiveMinutes,
            created_at: 1_000,
        };
        assert_eq!(record.expires_at(), 1_300);
    }

    #[test]
    fn page_request_clamps() {
        let req = PageRequest::new(Some(0), Some(10_000));
        assert_eq!(req.page, 1);
        assert_eq!(req.size, PageRequest::MAX_SIZE);
        let page = Page::new(vec![1, 2, 3], 7, PageRequest::new(Some(3), Some(3)));
        assert_eq!(page.pages, 3);
    }
}
