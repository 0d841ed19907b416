//! Recovers the platform thread id embedded in a message id.
//!
//! Message ids are base64 descriptors such as
//! `ig_message_item:1:IGMessageThread:<owner>:<thread>:<item>`. The thread id
//! the conversation API expects is the base64 of
//! `ig_message_thread:1:IGMessageThread:<owner>:<thread>` without padding.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

fn thread_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"IGMessageThread[^:]*:(\d+):(\d+)").ok())
        .as_ref()
}

pub fn decode_thread_id(message_id: &str) -> Option<String> {
    let trimmed = message_id.trim();
    if trimmed.is_empty() {
        return None;
    }
    let decoded = LENIENT.decode(trimmed).ok()?;
    let text = String::from_utf8_lossy(&decoded);
    let captures = thread_pattern()?.captures(&text)?;
    let owner = captures.get(1)?.as_str();
    let thread = captures.get(2)?.as_str();
    let descriptor = format!("ig_message_thread:1:IGMessageThread:{owner}:{thread}");
    Some(STANDARD_NO_PAD.encode(descriptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    #[test]
    fn decodes_thread_from_message_descriptor() {
        let mid = STANDARD.encode("ig_message_item:1:IGMessageThread:340282366:178414:9001");
        let expected = STANDARD_NO_PAD.encode("ig_message_thread:1:IGMessageThread:340282366:178414");
        assert_eq!(decode_thread_id(&mid), Some(expected.clone()));

        let unpadded = mid.trim_end_matches('=');
        assert_eq!(decode_thread_id(unpadded), Some(expected));
    }

    #[test]
    fn opaque_ids_do_not_decode() {
        assert_eq!(decode_thread_id(""), None);
        assert_eq!(decode_thread_id("m_abc-def"), None);
        assert_eq!(decode_thread_id(&STANDARD.encode("something else")), None);
    }
}
