//! Charset and collation tables.

use tracing::error;

pub const CHARSET_BIN: &str = "binary";
pub const COLLATION_BIN: &str = "binary";
pub const CHARSET_ASCII: &str = "ascii";
pub const CHARSET_LATIN1: &str = "latin1";
pub const CHARSET_UTF8: &str = "utf8";
pub const CHARSET_UTF8MB4: &str = "utf8mb4";
pub const CHARSET_GBK: &str = "gbk";

pub const DEFAULT_CHARSET: &str = CHARSET_UTF8MB4;
pub const DEFAULT_COLLATION: &str = "utf8mb4_bin";

pub const UTF8MB4_GENERAL_CI_ID: u8 = 45;
pub const UTF8MB4_BIN_ID: u8 = 46;
pub const BINARY_COLLATION_ID: u8 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    pub name: &'static str,
    pub default_collation: &'static str,
    pub max_len: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Collation {
    pub id: u8,
    pub name: &'static str,
    pub charset: &'static str,
}

static CHARSETS: &[Charset] = &[
    Charset { name: CHARSET_BIN, default_collation: COLLATION_BIN, max_len: 1 },
    Charset { name: CHARSET_ASCII, default_collation: "ascii_bin", max_len: 1 },
    Charset { name: CHARSET_LATIN1, default_collation: "latin1_bin", max_len: 1 },
    Charset { name: CHARSET_UTF8, default_collation: "utf8_bin", max_len: 3 },
    Charset { name: CHARSET_UTF8MB4, default_collation: "utf8mb4_bin", max_len: 4 },
    Charset { name: CHARSET_GBK, default_collation: "gbk_chinese_ci", max_len: 2 },
];

static COLLATIONS: &[Collation] = &[
    Collation { id: 8, name: "latin1_swedish_ci", charset: CHARSET_LATIN1 },
    Collation { id: 11, name: "ascii_general_ci", charset: CHARSET_ASCII },
    Collation { id: 28, name: "gbk_chinese_ci", charset: CHARSET_GBK },
    Collation { id: 33, name: "utf8_general_ci", charset: CHARSET_UTF8 },
    Collation { id: 45, name: "utf8mb4_general_ci", charset: CHARSET_UTF8MB4 },
    Collation { id: 46, name: "utf8mb4_bin", charset: CHARSET_UTF8MB4 },
    Collation { id: 47, name: "latin1_bin", charset: CHARSET_LATIN1 },
    Collation { id: 63, name: COLLATION_BIN, charset: CHARSET_BIN },
    Collation { id: 65, name: "ascii_bin", charset: CHARSET_ASCII },
    Collation { id: 83, name: "utf8_bin", charset: CHARSET_UTF8 },
    Collation { id: 87, name: "gbk_bin", charset: CHARSET_GBK },
    Collation { id: 192, name: "utf8_unicode_ci", charset: CHARSET_UTF8 },
    Collation { id: 224, name: "utf8mb4_unicode_ci", charset: CHARSET_UTF8MB4 },
    Collation { id: 255, name: "utf8mb4_0900_ai_ci", charset: CHARSET_UTF8MB4 },
];

pub fn charset_by_name(name: &str) -> Option<&'static Charset> {
    let lower = name.to_ascii_lowercase();
    CHARSETS.iter().find(|cs| cs.name == lower)
}

pub fn collation_by_name(name: &str) -> Option<&'static Collation> {
    let lower = name.to_ascii_lowercase();
    COLLATIONS.iter().find(|c| c.name == lower)
}

pub fn collation_by_id(id: u8) -> Option<&'static Collation> {
    COLLATIONS.iter().find(|c| c.id == id)
}

pub fn is_unicode(charset: &str) -> bool {
    charset == CHARSET_UTF8 || charset == CHARSET_UTF8MB4
}

/// Byte-order collations of the multi-byte-aware charsets.
pub fn is_bin_collation(collation: &str) -> bool {
    matches!(
        collation,
        "ascii_bin" | "latin1_bin" | "utf8_bin" | "utf8mb4_bin" | "gbk_bin"
    )
}

pub fn bin_collation(charset: &str) -> &'static str {
    match charset {
        CHARSET_UTF8 => "utf8_bin",
        CHARSET_UTF8MB4 => "utf8mb4_bin",
        CHARSET_GBK => "gbk_bin",
        other => {
            error!(charset = other, "unexpected charset for bin collation");
            "utf8mb4_bin"
        }
    }
}

/// Whether `s` can be stored in `charset` without loss.
pub fn is_valid_string(s: &str, charset: &str) -> bool {
    match charset {
        CHARSET_ASCII => s.is_ascii(),
        CHARSET_LATIN1 | CHARSET_BIN | CHARSET_UTF8 | CHARSET_UTF8MB4 => true,
        CHARSET_GBK => {
            let (_, _, unmappable) = encoding_rs::GBK.encode(s);
            !unmappable
        }
        _ => false,
    }
}

/// The connection-level charset and collation, from `collation_connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollationContext {
    pub charset: String,
    pub collation: String,
}

impl Default for CollationContext {
    fn default() -> Self {
        Self {
            charset: DEFAULT_CHARSET.to_string(),
            collation: DEFAULT_COLLATION.to_string(),
        }
    }
}

impl CollationContext {
    pub fn new(charset: &str, collation: &str) -> Self {
        Self {
            charset: charset.to_string(),
            collation: collation.to_string(),
        }
    }

    /// From the collation id a client sent in its handshake. Unknown ids
    /// keep the server default.
    pub fn from_collation_id(id: u8) -> Self {
        collation_by_id(id)
            .map(|c| Self::new(c.charset, c.name))
            .unwrap_or_default()
    }

    pub fn from_collation_name(name: &str) -> Option<Self> {
        collation_by_name(name).map(|c| Self::new(c.charset, c.name))
    }
}
