use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use rust_decimal::Decimal;

use crate::types::AmountCandidate;

/// Anything smaller is a quantity, a line number or a year, not a price.
pub const MIN_AMOUNT: Decimal = Decimal::ONE_THOUSAND;

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// 510.000 VND, 123.456.789 đ, 45.000 đồng
re!(re_grouped_currency,
    r"(?i)(\d{1,3}(?:\.\d{3})+)\s*(?:VNĐ|VND|ĐỒNG|DONG|Đ|D)\b");
// 510.000đ, or 123.456 standing alone
re!(re_grouped_standalone,
    r"(?i)(\d{1,3}(?:\.\d{3})+)(?:\s*(?:VNĐ|VND|Đ|D))?\b");
// 123.456,78 VND
re!(re_decimal_comma_currency,
    r"(?i)(\d{1,3}(?:\.\d{3})*(?:,\d{1,2})?)\s*(?:VNĐ|VND|Đ|D)\b");
// VND 510.000
re!(re_currency_prefix,
    r"(?i)\b(?:VNĐ|VND|Đ|D)\s*(\d{1,3}(?:\.\d{3})+)");
// TỔNG CỘNG: 1.234.000
re!(re_keyword_grouped,
    r"(?i)(?:TỔNG CỘNG|TONG CONG|THÀNH TIỀN|THANH TIEN|THANH TOÁN|THANH TOAN|PAYMENT|TOTAL|TỔNG|TONG|SUM|CỘNG|CONG)[\s:]*(\d{1,3}(?:\.\d{3})+)");
// TOTAL: 1.234,50
re!(re_keyword_decimal,
    r"(?i)(?:TỔNG CỘNG|TONG CONG|THÀNH TIỀN|THANH TIEN|THANH TOÁN|THANH TOAN|PAYMENT|TOTAL|TỔNG|TONG|SUM|CỘNG|CONG)[\s:]*(\d{1,3}(?:\.\d{3})*(?:,\d{1,2})?)");
// 1.234.567 with no currency at all (checked for a trailing `.digit` separately)
re!(re_bare_grouped,
    r"\b(\d{1,3}(?:\.\d{3}){1,3})\b");
// 123,456.78 USD, 12.50$
re!(re_english_suffix,
    r"(?i)(\d{1,3}(?:,\d{3})*(?:\.\d{1,2})?)\s*(?:USD|\$)");
// $123,456.78
re!(re_english_prefix,
    r"(?i)(?:\$|USD)\s*(\d{1,3}(?:,\d{3})*(?:\.\d{1,2})?)");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notation {
    /// `.` groups thousands, `,` marks decimals.
    Vietnamese,
    /// `,` groups thousands, `.` marks decimals.
    English,
}

struct Family {
    pattern: fn() -> &'static Regex,
    notation: Notation,
    /// Reject matches followed by `.digit`; those are decimals, not groups.
    reject_fractional_tail: bool,
}

/// Pattern families in priority order.
fn families() -> [Family; 9] {
    let vn = |pattern: fn() -> &'static Regex| Family {
        pattern,
        notation: Notation::Vietnamese,
        reject_fractional_tail: false,
    };
    let en = |pattern: fn() -> &'static Regex| Family {
        pattern,
        notation: Notation::English,
        reject_fractional_tail: false,
    };
    [
        vn(re_grouped_currency),
        vn(re_grouped_standalone),
        vn(re_decimal_comma_currency),
        vn(re_currency_prefix),
        vn(re_keyword_grouped),
        vn(re_keyword_decimal),
        Family {
            pattern: re_bare_grouped,
            notation: Notation::Vietnamese,
            reject_fractional_tail: true,
        },
        en(re_english_suffix),
        en(re_english_prefix),
    ]
}

// ── Public extraction API ─────────────────────────────────────────────────────

pub struct Extractor;

impl Extractor {
    /// Every distinct amount of at least [`MIN_AMOUNT`] in `text`, largest first.
    /// Matches that do not parse are skipped.
    pub fn extract(text: &str) -> Vec<AmountCandidate> {
        let mut candidates: Vec<AmountCandidate> = Vec::new();

        for family in families() {
            for caps in (family.pattern)().captures_iter(text) {
                let Some(amount) = caps.get(1) else { continue };
                // The regex engine has no lookbehind; a match starting mid-number
                // ("1234.567" -> "234.567") is a misread, not an amount.
                if text[..amount.start()].ends_with(|c: char| c.is_ascii_digit()) {
                    continue;
                }
                if family.reject_fractional_tail && has_fractional_tail(&text[amount.end()..]) {
                    continue;
                }

                let parsed = match family.notation {
                    Notation::Vietnamese => parse_vietnamese_amount(amount.as_str()),
                    Notation::English => parse_english_amount(amount.as_str()),
                };
                let Some(value) = parsed else {
                    tracing::debug!("Discarding unparseable amount '{}'", amount.as_str());
                    continue;
                };
                tracing::debug!("Found amount match '{}' -> {value}", amount.as_str());

                if value < MIN_AMOUNT || candidates.iter().any(|c| c.value == value) {
                    continue;
                }
                candidates.push(AmountCandidate::new(value.normalize(), amount.range()));
            }
        }

        candidates.sort_by(|a, b| b.value.cmp(&a.value));
        tracing::debug!(
            "Extracted amounts: {}",
            candidates.iter().map(|c| c.value.to_string()).collect::<Vec<_>>().join(", ")
        );
        candidates
    }
}

fn has_fractional_tail(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some('.') && chars.next().is_some_and(|c| c.is_ascii_digit())
}

// ── Amount parsing ────────────────────────────────────────────────────────────

fn separators_and_digits(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect()
}

fn positive(normalized: &str) -> Option<Decimal> {
    Decimal::from_str(normalized).ok().filter(|d| *d > Decimal::ZERO)
}

/// `510.000`, `1.234.567`: first group of 1–3 digits, every later group exactly 3.
fn is_thousands_grouped(s: &str, separator: char) -> bool {
    let mut groups = s.split(separator);
    let Some(first) = groups.next() else { return false };
    let rest: Vec<&str> = groups.collect();
    !rest.is_empty()
        && (1..=3).contains(&first.len())
        && rest.iter().all(|g| g.len() == 3)
}

/// Parse an amount written the Vietnamese way.
///
/// | dots | commas | condition                         | result                      |
/// |------|--------|-----------------------------------|-----------------------------|
/// | ≥1   | 0      | groups are `d{1,3}(.ddd)+`        | dots stripped               |
/// | ≥1   | 0      | anything else                     | rejected                    |
/// | ≥1   | 1      | comma after the last dot          | dots stripped, comma → `.`  |
/// | any  | ≥1     | otherwise                         | commas stripped             |
/// | 0    | 0      |                                   | digits as-is                |
pub fn parse_vietnamese_amount(input: &str) -> Option<Decimal> {
    let cleaned = separators_and_digits(input);
    if cleaned.is_empty() {
        return None;
    }

    let dots = cleaned.matches('.').count();
    let commas = cleaned.matches(',').count();

    let normalized = match (dots, commas) {
        (1.., 0) if is_thousands_grouped(&cleaned, '.') => cleaned.replace('.', ""),
        (1.., 0) => return None,
        (1.., 1) if cleaned.rfind(',') > cleaned.rfind('.') => {
            let comma = cleaned.rfind(',')?;
            format!("{}.{}", cleaned[..comma].replace('.', ""), &cleaned[comma + 1..])
        }
        (_, 1..) => cleaned.replace(',', ""),
        _ => cleaned,
    };

    positive(&normalized)
}

/// Parse an amount written the English way: whichever of `.` and `,` comes
/// last is the decimal point and the other one is a thousands separator.
pub fn parse_english_amount(input: &str) -> Option<Decimal> {
    let cleaned = separators_and_digits(input);
    if cleaned.is_empty() {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let normalized = if last_dot > last_comma {
        cleaned.replace(',', "")
    } else if let Some(comma) = last_comma {
        format!("{}.{}", cleaned[..comma].replace('.', ""), &cleaned[comma + 1..])
    } else {
        cleaned
    };

    positive(&normalized)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
