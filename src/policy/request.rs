//! Attributes of one policy delegation request.

use std::collections::HashMap;
use std::fmt;
use tracing::warn;

/// Attribute carrying the number of recipients of the message.
pub const RECIPIENT_COUNT: &str = "recipient_count";
/// Attribute carrying the SASL login of an authenticated client.
pub const SASL_USERNAME: &str = "sasl_username";
/// Attribute carrying the envelope sender.
pub const SENDER: &str = "sender";

/// Key/value attributes parsed from a policy request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    attributes: HashMap<String, String>,
}

impl RequestAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse whitespace-separated `key=value` tokens.
    ///
    /// A token without `=` is kept as a key with an empty value. When a
    /// key repeats, the last value wins.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let mut request = Self::new();

        for token in text.split_whitespace() {
            match token.split_once('=') {
                Some((key, value)) => request.set(key, value),
                None => {
                    warn!(token, "Policy attribute without '=', keeping it with an empty value");
                    request.set(token, "");
                }
            }
        }

        request
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Value of `key`, or the empty string if absent.
    pub fn get(&self, key: &str) -> &str {
        self.attributes.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Declared recipient count, if present and a valid unsigned integer.
    pub fn recipient_count(&self) -> Option<u64> {
        self.get(RECIPIENT_COUNT).parse().ok()
    }

    /// Identity to rate limit: the SASL login, else the envelope sender.
    pub fn sender_identity(&self) -> &str {
        match self.get(SASL_USERNAME) {
            "" => self.get(SENDER),
            username => username,
        }
    }
}

impl fmt::Display for RequestAttributes {
    /// Lists non-empty attributes in key order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self
            .attributes
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k)
            .collect();
        keys.sort_unstable();

        let pairs: Vec<String> = keys
            .into_iter()
            .map(|k| format!("{}={}", k, self.attributes[k]))
            .collect();
        write!(f, "{}", pairs.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTFIX_REQUEST: &[u8] = b"request=smtpd_access_policy\n\
protocol_state=RCPT\n\
protocol_name=ESMTP\n\
client_address=192.0.2.10\n\
sender=alice@example.com\n\
recipient=bob@example.org\n\
recipient_count=3\n\
sasl_username=\n\
\n";

    #[test]
    fn test_parse_postfix_request() {
        let request = RequestAttributes::parse(POSTFIX_REQUEST);

        assert_eq!(request.get("request"), "smtpd_access_policy");
        assert_eq!(request.get("client_address"), "192.0.2.10");
        assert_eq!(request.recipient_count(), Some(3));
        assert_eq!(request.sender_identity(), "alice@example.com");
        assert_eq!(request.get("missing"), "");
        assert_eq!(request.len(), 8);
    }

    #[test]
    fn test_sasl_username_preferred() {
        let request = RequestAttributes::parse(b"sender=alice@example.com sasl_username=alice\n\n");
        assert_eq!(request.sender_identity(), "alice");
    }

    #[test]
    fn test_token_without_equals_kept_with_empty_value() {
        let request = RequestAttributes::parse(b"garbage recipient_count=1\n\n");
        assert_eq!(request.get("garbage"), "");
        assert!(request.keys().any(|k| k == "garbage"));
        assert_eq!(request.recipient_count(), Some(1));
    }

    #[test]
    fn test_last_duplicate_wins_and_value_keeps_equals() {
        let request = RequestAttributes::parse(b"sender=a@x.com sender=b@x.com ccert_subject=CN=mx\n\n");
        assert_eq!(request.get("sender"), "b@x.com");
        assert_eq!(request.get("ccert_subject"), "CN=mx");
    }

    #[test]
    fn test_recipient_count_unparsable() {
        assert_eq!(RequestAttributes::parse(b"recipient_count=lots\n\n").recipient_count(), None);
        assert_eq!(RequestAttributes::parse(b"recipient_count=-1\n\n").recipient_count(), None);
        assert_eq!(RequestAttributes::parse(b"sender=a@x.com\n\n").recipient_count(), None);
    }

    #[test]
    fn test_display_skips_empty_values() {
        let mut request = RequestAttributes::new();
        request.set("sender", "a@x.com");
        request.set("sasl_username", "");
        request.set("recipient_count", "2");

        assert_eq!(request.to_string(), "recipient_count=2 sender=a@x.com");
    }
}
