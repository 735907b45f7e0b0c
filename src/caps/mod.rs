//! Pre-flight spending-cap checks.
//!
//! Spend totals are owned by the collector; this side only reads them. Every
//! failure to reach the cap service resolves to [`CapDecision::Allowed`].

mod circuit;
mod guard;
mod service;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitPermit, CircuitState};
pub use guard::CapGuard;
pub use service::{CapService, HttpCapService};

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapScope {
    Global,
    Provider,
    Model,
    Agent,
    Customer,
}

impl fmt::Display for CapScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Global => "global",
            Self::Provider => "provider",
            Self::Model => "model",
            Self::Agent => "agent",
            Self::Customer => "customer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Advisory only; never blocks.
    Alert,
    #[default]
    HardBlock,
}

/// A configured limit with the collector's view of current spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cap {
    #[serde(alias = "cap_type")]
    pub scope: CapScope,
    #[serde(default, alias = "target_name")]
    pub target: Option<String>,
    pub limit: Decimal,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub enforcement: Enforcement,
    #[serde(default, alias = "current")]
    pub current_spend: Decimal,
}

impl Cap {
    fn exceeded_by(&self, projected: Decimal) -> bool {
        self.current_spend + projected > self.limit
    }
}

/// A cap reported (or found) to be over its limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceededCap {
    pub cap_type: CapScope,
    #[serde(default)]
    pub target_name: Option<String>,
    pub current: Decimal,
    pub limit: Decimal,
    #[serde(default)]
    pub period: String,
    #[serde(default)]
    pub enforcement: Enforcement,
}

impl ExceededCap {
    fn same_cap(&self, other: &ExceededCap) -> bool {
        self.cap_type == other.cap_type
            && self.target_name == other.target_name
            && self.period == other.period
    }
}

impl From<&Cap> for ExceededCap {
    fn from(cap: &Cap) -> Self {
        Self {
            cap_type: cap.scope,
            target_name: cap.target.clone(),
            current: cap.current_spend,
            limit: cap.limit,
            period: cap.period.clone(),
            enforcement: cap.enforcement,
        }
    }
}

impl fmt::Display for ExceededCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cap_type)?;
        if let Some(target) = &self.target_name {
            write!(f, " '{target}'")?;
        }
        write!(f, " at {} of {}", self.current, self.limit)?;
        if !self.period.is_empty() {
            write!(f, " per {}", self.period)?;
        }
        Ok(())
    }
}

fn allowed_by_default() -> bool {
    true
}

/// Cap service reply. Missing fields read as permissive.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CapCheckResponse {
    #[serde(default = "allowed_by_default")]
    pub allowed: bool,
    #[serde(default)]
    pub exceeded_caps: Vec<ExceededCap>,
    /// Every cap matching the query, when the service reports them; lets the
    /// guard add the projected cost of the pending call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<Cap>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Dimensions of a pending call; the cache key for check results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CapQuery {
    pub provider: String,
    pub model: Option<String>,
    pub customer_id: Option<String>,
    pub agent: Option<String>,
}

impl CapQuery {
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![("provider", self.provider.as_str())];
        for (key, value) in [
            ("model", &self.model),
            ("customer_id", &self.customer_id),
            ("agent", &self.agent),
        ] {
            if let Some(value) = value {
                pairs.push((key, value.as_str()));
            }
        }
        pairs
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapDecision {
    Allowed,
    /// Only alert-mode caps are over; the call proceeds.
    AllowedWithWarning(Vec<ExceededCap>),
    Blocked {
        message: String,
        caps: Vec<ExceededCap>,
    },
}

impl CapDecision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// Applies a check response to a call projected to cost `projected`.
    pub fn from_response(response: &CapCheckResponse, projected: Decimal) -> Self {
        let mut over: Vec<ExceededCap> = Vec::new();
        for cap in &response.caps {
            if cap.exceeded_by(projected) {
                over.push(cap.into());
            }
        }
        for cap in &response.exceeded_caps {
            if !over.iter().any(|c| c.same_cap(cap)) {
                over.push(cap.clone());
            }
        }

        let (blocking, warnings): (Vec<_>, Vec<_>) = over
            .into_iter()
            .partition(|c| c.enforcement == Enforcement::HardBlock);

        if !blocking.is_empty() {
            let message = response.message.clone().unwrap_or_else(|| {
                blocking
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            });
            return Self::Blocked {
                message,
                caps: blocking,
            };
        }
        if !response.allowed && warnings.is_empty() {
            return Self::Blocked {
                message: response
                    .message
                    .clone()
                    .unwrap_or_else(|| "spending cap exceeded".to_string()),
                caps: Vec::new(),
            };
        }
        if warnings.is_empty() {
            Self::Allowed
        } else {
            Self::AllowedWithWarning(warnings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cap(enforcement: Enforcement, current: Decimal, limit: Decimal) -> Cap {
        Cap {
            scope: CapScope::Provider,
            target: Some("openai".into()),
            limit,
            period: "daily".into(),
            enforcement,
            current_spend: current,
        }
    }

    #[test]
    fn test_projection_blocks_hard_cap() {
        let response = CapCheckResponse {
            allowed: true,
            caps: vec![cap(Enforcement::HardBlock, dec!(9.99), dec!(10))],
            ..Default::default()
        };
        assert_eq!(CapDecision::from_response(&response, dec!(0.005)), CapDecision::Allowed);
        let decision = CapDecision::from_response(&response, dec!(0.02));
        assert!(decision.is_blocked());
    }

    #[test]
    fn test_alert_caps_never_block() {
        let response = CapCheckResponse {
            allowed: true,
            caps: vec![cap(Enforcement::Alert, dec!(50), dec!(10))],
            ..Default::default()
        };
        let decision = CapDecision::from_response(&response, Decimal::ZERO);
        assert!(matches!(decision, CapDecision::AllowedWithWarning(ref caps) if caps.len() == 1));
    }

    #[test]
    fn test_disallowed_without_details_blocks() {
        let response = CapCheckResponse {
            allowed: false,
            message: Some("global cap reached".into()),
            ..Default::default()
        };
        match CapDecision::from_response(&response, Decimal::ZERO) {
            CapDecision::Blocked { message, caps } => {
                assert_eq!(message, "global cap reached");
                assert!(caps.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wire_shape() {
        let response: CapCheckResponse = serde_json::from_str(
            r#"{"allowed": false, "message": "over",
                "exceeded_caps": [{"cap_type": "customer", "target_name": "acme",
                                   "current": 120.5, "limit": 100, "period": "monthly"}]}"#,
        )
        .unwrap();
        assert_eq!(response.exceeded_caps[0].enforcement, Enforcement::HardBlock);
        let decision = CapDecision::from_response(&response, Decimal::ZERO);
        match decision {
            CapDecision::Blocked { caps, .. } => {
                assert_eq!(caps[0].to_string(), "customer 'acme' at 120.5 of 100 per monthly");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_response_is_permissive() {
        let response: CapCheckResponse = serde_json::from_str("{}").unwrap();
        assert!(response.allowed);
        assert_eq!(CapDecision::from_response(&response, dec!(1)), CapDecision::Allowed);
    }

    #[test]
    fn test_query_pairs_skip_missing() {
        let query = CapQuery {
            provider: "openai".into(),
            model: Some("gpt-4o".into()),
            ..Default::default()
        };
        assert_eq!(query.query_pairs(), vec![("provider", "openai"), ("model", "gpt-4o")]);
    }
}
