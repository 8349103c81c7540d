//! Token estimation
//!
//! A character-count heuristic is enough to keep prompts inside a budget;
//! exact tokenizer parity is not needed.

/// Character-count token estimator
pub struct TokenEstimator;

impl TokenEstimator {
    /// Estimate tokens in `text`: about 4 ASCII chars or 1.5 non-ASCII chars per token
    pub fn estimate(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// Sum of estimates over several texts
    pub fn estimate_all<'a>(texts: impl IntoIterator<Item = &'a str>) -> usize {
        texts.into_iter().map(Self::estimate).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_estimate() {
        assert_eq!(TokenEstimator::estimate(""), 0);
        assert_eq!(TokenEstimator::estimate("ab"), 1);
        assert_eq!(TokenEstimator::estimate("click the compose button"), 6);
    }

    #[test]
    fn test_non_ascii_weighs_more() {
        let ascii = TokenEstimator::estimate("abcdef");
        let wide = TokenEstimator::estimate("日本語のテキ");
        assert!(wide > ascii);
    }

    #[test]
    fn test_estimate_all() {
        assert_eq!(TokenEstimator::estimate_all(["abcd", "efgh", ""]), 2);
    }
}
