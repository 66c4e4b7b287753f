//! Policy decisions and their wire form.

use std::fmt;

/// Outcome of a rate limit decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Let the mail server continue with its other restrictions
    Accept,
    /// Temporarily reject with the given message
    Defer(String),
}

impl Action {
    pub fn is_accept(&self) -> bool {
        matches!(self, Action::Accept)
    }

    /// Render the policy protocol response, blank-line terminated.
    pub fn to_response(&self) -> String {
        format!("action={}\n\n", self)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => write!(f, "dunno"),
            Action::Defer(message) => write!(f, "defer_if_permit {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_response() {
        assert_eq!(Action::Accept.to_response(), "action=dunno\n\n");
        assert!(Action::Accept.is_accept());
    }

    #[test]
    fn test_defer_response() {
        let action = Action::Defer("rate limit exceeded".to_string());
        assert_eq!(
            action.to_response(),
            "action=defer_if_permit rate limit exceeded\n\n"
        );
        assert!(!action.is_accept());
    }
}
