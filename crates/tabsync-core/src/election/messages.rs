//! Wire types for leader election.
//!
//! Wire format: `{"context":"leader","action":"apply","token":"…","dictator":false}`.
//! Messages carrying any other `context` belong to someone else on the
//! channel and are rejected by the parsers.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt::{self, Display, Formatter};

const CONTEXT: &str = "leader";

/// Opaque token identifying one application attempt.
///
/// Tokens are compared byte-wise lexicographically (the derived `Ord` on the
/// inner string). Every elector therefore agrees on which of two tokens is
/// larger, whatever produced them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElectionToken(String);

impl ElectionToken {
    /// Fresh random token (UUIDv4, hyphenated lowercase).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ElectionToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ElectionToken {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for ElectionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Total order used to settle every contested election.
///
/// Field order matters: `dictator` is compared first (`false < true`), then
/// the token. So a dictator always outranks a non-dictator, and two
/// candidates of the same kind fall back to the token comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Precedence {
    pub dictator: bool,
    pub token: ElectionToken,
}

impl Precedence {
    pub fn new(dictator: bool, token: ElectionToken) -> Self {
        Self { dictator, token }
    }

    /// True if `self` wins a contest against `other`.
    pub fn beats(&self, other: &Precedence) -> bool {
        self > other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionAction {
    /// Candidate announces it is applying for leadership.
    Apply,
    /// The current leader announces itself.
    Tell,
    /// An elector is going away for good.
    Death,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionMessage {
    context: String,
    pub action: ElectionAction,
    pub token: ElectionToken,
    #[serde(default)]
    pub dictator: bool,
}

impl ElectionMessage {
    fn new(action: ElectionAction, token: ElectionToken, dictator: bool) -> Self {
        Self {
            context: CONTEXT.to_string(),
            action,
            token,
            dictator,
        }
    }

    pub fn apply(token: ElectionToken, dictator: bool) -> Self {
        Self::new(ElectionAction::Apply, token, dictator)
    }

    pub fn tell(token: ElectionToken, dictator: bool) -> Self {
        Self::new(ElectionAction::Tell, token, dictator)
    }

    pub fn death(token: ElectionToken, dictator: bool) -> Self {
        Self::new(ElectionAction::Death, token, dictator)
    }

    pub fn precedence(&self) -> Precedence {
        Precedence::new(self.dictator, self.token.clone())
    }

    pub fn to_value(&self) -> Value {
        json!({
            "context": CONTEXT,
            "action": self.action,
            "token": self.token,
            "dictator": self.dictator,
        })
    }

    /// Parse an already-decoded JSON value.
    ///
    /// Returns `None` if the value isn't an election message.
    pub fn from_value(value: Value) -> Option<Self> {
        let msg: Self = serde_json::from_value(value).ok()?;
        (msg.context == CONTEXT).then_some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(s: &str) -> ElectionToken {
        ElectionToken::from(s)
    }

    #[test]
    fn test_token_order_is_lexicographic() {
        assert!(token("b") > token("a"));
        assert!(token("ab") > token("a"));
        assert!(token("B") < token("a"));
        assert!(token("10") < token("9"));
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        assert_ne!(ElectionToken::generate(), ElectionToken::generate());
    }

    #[test]
    fn test_dictator_beats_any_non_dictator() {
        let dictator = Precedence::new(true, token("0"));
        let plain = Precedence::new(false, token("zzzz"));
        assert!(dictator.beats(&plain));
        assert!(!plain.beats(&dictator));
    }

    #[test]
    fn test_same_kind_tie_breaks_by_token() {
        let low = Precedence::new(true, token("a"));
        let high = Precedence::new(true, token("b"));
        assert!(high.beats(&low));
        assert!(!low.beats(&high));

        let low = Precedence::new(false, token("a"));
        let high = Precedence::new(false, token("b"));
        assert!(high.beats(&low));
    }

    #[test]
    fn test_nothing_beats_itself() {
        let p = Precedence::new(false, token("a"));
        assert!(!p.beats(&p.clone()));
    }

    #[test]
    fn test_wire_format() {
        let msg = ElectionMessage::apply(token("t1"), true);
        let value = msg.to_value();
        assert_eq!(
            value,
            json!({"context": "leader", "action": "apply", "token": "t1", "dictator": true})
        );
        assert_eq!(ElectionMessage::from_value(value), Some(msg));
    }

    #[test]
    fn test_dictator_defaults_to_false() {
        let msg = ElectionMessage::from_value(json!({"context": "leader", "action": "death", "token": "x"}))
            .unwrap();
        assert_eq!(msg.action, ElectionAction::Death);
        assert!(!msg.dictator);
    }

    #[test]
    fn test_rejects_foreign_context() {
        let foreign = json!({"context": "other", "action": "tell", "token": "x", "dictator": false});
        assert!(ElectionMessage::from_value(foreign).is_none());
        assert!(ElectionMessage::from_value(json!("not a message")).is_none());
        assert!(ElectionMessage::from_value(json!({"action": "tell"})).is_none());
    }
}
