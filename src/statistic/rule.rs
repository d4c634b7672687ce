//! Routing rule descriptors attached to tracked connections

/// A routing rule that selected a connection's outbound
pub trait Rule: Send + Sync {
    /// Rule kind, e.g. `DOMAIN-SUFFIX`
    fn rule_type(&self) -> &str;

    /// Rule argument, e.g. `example.com`
    fn payload(&self) -> &str;
}

/// Rule match as reported by the rule engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedRule {
    rule_type: String,
    payload: String,
}

impl MatchedRule {
    pub fn new(rule_type: impl Into<String>, payload: impl Into<String>) -> Self {
        MatchedRule {
            rule_type: rule_type.into(),
            payload: payload.into(),
        }
    }

    /// Parse a `TYPE,payload` or `TYPE:payload` descriptor
    pub fn parse(desc: &str) -> Self {
        if desc.eq_ignore_ascii_case("default") {
            return MatchedRule::new("MATCH", "");
        }

        if let Some((rule, payload)) = desc.split_once(',') {
            return MatchedRule::new(rule, payload);
        }

        if let Some((rule, payload)) = desc.split_once(':') {
            return MatchedRule::new(rule, payload);
        }

        MatchedRule::new(desc, "")
    }
}

impl Rule for MatchedRule {
    fn rule_type(&self) -> &str {
        &self.rule_type
    }

    fn payload(&self) -> &str {
        &self.payload
    }
}
