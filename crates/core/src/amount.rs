use rust_decimal::{Decimal, RoundingStrategy};

/// Round to a whole amount, half away from zero (receipts never print half-dong).
pub fn round_whole(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Whole-number rendering without separators: `510000`.
pub fn format_plain(value: Decimal) -> String {
    round_whole(value).normalize().to_string()
}

/// Whole-number rendering with `.` thousands groups, as printed on
/// Vietnamese bills: `1.234.000`.
pub fn format_grouped(value: Decimal) -> String {
    let plain = format_plain(value);
    let (sign, digits) = match plain.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", plain.as_str()),
    };

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("{sign}{grouped}")
}
