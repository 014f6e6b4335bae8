use billscan_core::{format_grouped, format_plain};
use rust_decimal::Decimal;

use crate::types::AmountCandidate;

/// Words printed next to the amount actually paid, in both languages and
/// with and without diacritics (OCR drops them often).
pub const TOTAL_KEYWORDS: &[&str] = &[
    "tổng", "total", "sum", "thành tiền", "thanh toán", "payment", "cộng",
    "tổng cộng", "tong", "thanh toan", "tong cong", "amount", "số tiền",
    "so tien", "tiền", "tien",
];

// ── Scoring ───────────────────────────────────────────────────────────────────

/// Score one amount against the text it was read from.
///
/// Distances and positions are counted in characters of the lower-cased text.
pub fn score(value: Decimal, text: &str) -> i32 {
    let haystack = text.to_lowercase();
    let renderings = [format_plain(value), format_grouped(value)];

    let mut score = magnitude_bonus(value);

    for keyword in TOTAL_KEYWORDS {
        let Some(keyword_at) = char_offsets(&haystack, keyword).next() else { continue };
        for rendering in &renderings {
            let nearest = amount_offsets(&haystack, rendering).map(|at| at.abs_diff(keyword_at)).min();
            score += match nearest {
                Some(d) if d < 50 => 50,
                Some(d) if d < 100 => 30,
                Some(d) if d < 200 => 10,
                _ => 0,
            };
        }
    }

    let len = haystack.chars().count();
    let last = renderings
        .iter()
        .filter_map(|r| amount_offsets(&haystack, r).last())
        .max();
    if let Some(last) = last {
        let relative = last as f64 / len as f64;
        if relative > 0.8 {
            score += 20;
        } else if relative > 0.6 {
            score += 10;
        }
    }

    score
}

fn magnitude_bonus(value: Decimal) -> i32 {
    if value >= Decimal::from(100_000) {
        30
    } else if value >= Decimal::from(50_000) {
        20
    } else if value >= Decimal::from(10_000) {
        10
    } else {
        0
    }
}

/// Character offsets of every occurrence of `needle`, left to right.
fn char_offsets<'a>(haystack: &'a str, needle: &'a str) -> impl Iterator<Item = usize> + 'a {
    haystack
        .match_indices(needle)
        .map(move |(byte_at, _)| haystack[..byte_at].chars().count())
}

/// Like [`char_offsets`], but skips matches that are only part of a longer
/// number, so `50.000` is not found inside `250.000` or `50.000.000`.
fn amount_offsets<'a>(haystack: &'a str, amount: &'a str) -> impl Iterator<Item = usize> + 'a {
    haystack
        .match_indices(amount)
        .filter(move |(byte_at, m)| {
            !continues_number(haystack[..*byte_at].chars().rev())
                && !continues_number(haystack[byte_at + m.len()..].chars())
        })
        .map(move |(byte_at, _)| haystack[..byte_at].chars().count())
}

/// Whether the characters walking away from a match extend the number: a
/// digit, or a separator followed by a digit.
fn continues_number(mut outward: impl Iterator<Item = char>) -> bool {
    match outward.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('.' | ',') => outward.next().is_some_and(|c| c.is_ascii_digit()),
        _ => false,
    }
}

// ── Selection ─────────────────────────────────────────────────────────────────

/// Score every candidate and order them best first: highest score, then
/// larger value.
pub fn rank(candidates: &[AmountCandidate], text: &str) -> Vec<AmountCandidate> {
    let mut ranked: Vec<AmountCandidate> = candidates
        .iter()
        .map(|c| AmountCandidate { score: score(c.value, text), ..c.clone() })
        .collect();
    ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| b.value.cmp(&a.value)));

    tracing::debug!(
        "Amount scores: {}",
        ranked.iter().map(|c| format!("{}:{}", c.value, c.score)).collect::<Vec<_>>().join(", ")
    );
    ranked
}

/// The amount most likely to be the bill total, if there is any candidate.
pub fn pick(candidates: &[AmountCandidate], text: &str) -> Option<AmountCandidate> {
    let best = rank(candidates, text).into_iter().next()?;
    tracing::info!("Selected main amount: {}", best.value);
    Some(best)
}
