use rust_decimal::Decimal;
use std::ops::Range;

/// A number found in recognized text that may be the bill total.
#[derive(Debug, Clone, PartialEq)]
pub struct AmountCandidate {
    pub value: Decimal,
    /// Byte range of the match that produced this value.
    pub span: Range<usize>,
    /// Filled in by the scorer; zero straight out of the extractor.
    pub score: i32,
}

impl AmountCandidate {
    pub fn new(value: Decimal, span: Range<usize>) -> Self {
        Self { value, span, score: 0 }
    }
}
