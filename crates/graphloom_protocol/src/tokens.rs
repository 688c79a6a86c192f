//! Token estimation for rate-limit accounting.
//!
//! These are packing/reservation numbers, not billing numbers.

/// Rough estimate: 4 characters ≈ 1 token, never below 1.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.len() / 4) as u64).max(1)
}

/// Estimate the total tokens an API call will consume, input plus
/// output, with a little formatting overhead on the system prompt.
pub fn estimate_call_tokens(
    system_prompt: &str,
    user_message: &str,
    expected_output_tokens: Option<u64>,
) -> u64 {
    let system = if system_prompt.is_empty() {
        0
    } else {
        estimate_tokens(system_prompt)
    };
    let user = if user_message.is_empty() {
        0
    } else {
        estimate_tokens(user_message)
    };
    let system_overhead = system / 2;
    let output = expected_output_tokens.unwrap_or_else(|| ((system + user) / 10).max(100));

    (system + user + system_overhead + output).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_chars_per_token() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("x"), 1);
        assert_eq!(estimate_tokens(""), 1);
    }

    #[test]
    fn call_estimate_covers_output_floor() {
        // 400 chars -> 100 input tokens, output floor of 100.
        let text = "a".repeat(400);
        assert_eq!(estimate_call_tokens("", &text, None), 200);
        // Explicit output expectation wins.
        assert_eq!(estimate_call_tokens("", &text, Some(10)), 110);
    }
}
