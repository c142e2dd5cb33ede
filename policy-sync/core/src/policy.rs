use std::{collections::BTreeMap, fmt};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileId {
    pub name: String,
}

/// Names a policy within its tier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PolicyId {
    pub tier: String,
    pub name: String,
}

/// The rules a policy contributes to each endpoint it selects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Policy {
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
}

/// A profile's rules, along with the labels it applies to the endpoints that use it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub labels_to_apply: BTreeMap<String, String>,
    pub inbound_rules: Vec<Rule>,
    pub outbound_rules: Vec<Rule>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub protocol: Option<String>,
    pub source: EntityRule,
    pub destination: EntityRule,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Deny,
    Log,
    Pass,
}

/// Matches one side of a connection. Empty fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityRule {
    pub nets: Vec<String>,
    pub ports: Vec<u16>,
}

// === impl ProfileId ===

impl ProfileId {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.name.fmt(f)
    }
}

// === impl PolicyId ===

impl PolicyId {
    pub fn new(tier: impl ToString, name: impl ToString) -> Self {
        Self {
            tier: tier.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tier, self.name)
    }
}

// === impl Action ===

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Log => "log",
            Self::Pass => "pass",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl Rule ===

impl Rule {
    pub fn allow() -> Self {
        Self {
            action: Action::Allow,
            protocol: None,
            source: EntityRule::default(),
            destination: EntityRule::default(),
        }
    }
}
