use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Epsilon presets offered to callers that do not want to pick a raw value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Low,
    Medium,
    High,
    Maximum,
}

impl PrivacyLevel {
    pub const ALL: [PrivacyLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Maximum];

    pub fn epsilon(self) -> f64 {
        match self {
            Self::Low => 10.0,
            Self::Medium => 1.0,
            Self::High => 0.1,
            Self::Maximum => 0.01,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Maximum => "maximum",
        }
    }
}

impl Default for PrivacyLevel {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrivacyLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown privacy level `{value}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stricter_levels_spend_less() {
        let epsilons: Vec<f64> = PrivacyLevel::ALL.iter().map(|l| l.epsilon()).collect();
        assert!(epsilons.windows(2).all(|pair| pair[0] > pair[1]));
        assert_eq!(PrivacyLevel::default().epsilon(), 1.0);
    }

    #[test]
    fn parses_names() {
        assert_eq!("HIGH".parse::<PrivacyLevel>(), Ok(PrivacyLevel::High));
        assert!("extreme".parse::<PrivacyLevel>().is_err());
    }
}
