// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Classification policy deciding which validated events get buffered.

use hashbrown::HashSet;
use serde::Deserialize;

use crate::config::AlertConfig;
use crate::event::Event;

const PT_MARKER: &str = "PTsecurity";
const ET_PREFIX: &str = "ET";

/// Rule families recognised by their message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum RuleFamily {
    /// Vendor rules, tagged `PTsecurity` in the message.
    #[serde(rename = "PT")]
    Pt,
    /// Emerging Threats rules, message starts with `ET`.
    #[serde(rename = "ET")]
    Et,
    /// Anything that is neither PT nor ET.
    Custom,
}

impl RuleFamily {
    fn is_pt(message: &str) -> bool {
        message.contains(PT_MARKER)
    }

    fn is_et(message: &str) -> bool {
        message.starts_with(ET_PREFIX)
    }

    pub fn matches(self, message: &str) -> bool {
        match self {
            RuleFamily::Pt => Self::is_pt(message),
            RuleFamily::Et => Self::is_et(message),
            RuleFamily::Custom => !Self::is_pt(message) && !Self::is_et(message),
        }
    }
}

/// Why an event was not buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Priority,
    IgnoredSid,
    IgnoredMessage,
    RuleFamily,
}

#[derive(Debug, Clone)]
pub struct AlertFilter {
    priorities: HashSet<u8>,
    ignore_sids: HashSet<u64>,
    /// Lowercased once up front.
    ignore_msg: Vec<String>,
    /// Empty accepts every family.
    families: HashSet<RuleFamily>,
}

impl AlertFilter {
    pub fn new(config: &AlertConfig) -> Self {
        AlertFilter {
            priorities: config.priority_filter.iter().copied().collect(),
            ignore_sids: config.ignore_sids.iter().copied().collect(),
            ignore_msg: config
                .ignore_msg
                .iter()
                .filter(|m| !m.is_empty())
                .map(|m| m.to_lowercase())
                .collect(),
            families: config.rules_filter.iter().copied().collect(),
        }
    }

    pub fn check(&self, event: &Event) -> Result<(), Rejection> {
        let rule = &event.rule;
        if !self.priorities.contains(&rule.priority) {
            return Err(Rejection::Priority);
        }
        if self.ignore_sids.contains(&rule.sid) {
            return Err(Rejection::IgnoredSid);
        }
        if !self.ignore_msg.is_empty() {
            let message = rule.message.to_lowercase();
            if self.ignore_msg.iter().any(|m| message.contains(m.as_str())) {
                return Err(Rejection::IgnoredMessage);
            }
        }
        if !self.families.is_empty() && !self.families.iter().any(|f| f.matches(&rule.message)) {
            return Err(Rejection::RuleFamily);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures;

    fn config(families: Vec<RuleFamily>) -> AlertConfig {
        AlertConfig {
            priority_filter: vec![1, 2],
            ignore_sids: vec![2000],
            ignore_msg: vec!["Scanner".to_string()],
            rules_filter: families,
            ..Default::default()
        }
    }

    fn with_message(sid: u64, message: &str) -> Event {
        let mut event = fixtures::event(sid, "nad.example.com");
        event.rule.message = message.to_string();
        event
    }

    #[test]
    fn test_rule_family_matching() {
        assert!(RuleFamily::Pt.matches("[PTsecurity] Exploit attempt"));
        assert!(!RuleFamily::Pt.matches("ET POLICY curl"));
        assert!(RuleFamily::Et.matches("ET POLICY curl"));
        assert!(!RuleFamily::Et.matches("Local ET rule"));
        assert!(RuleFamily::Custom.matches("Local ET rule"));
        assert!(!RuleFamily::Custom.matches("ET POLICY curl"));
        assert!(!RuleFamily::Custom.matches("PTsecurity thing"));
    }

    #[test]
    fn test_default_filter_accepts_pt_priority_one() {
        let filter = AlertFilter::new(&AlertConfig::default());
        assert_eq!(filter.check(&with_message(1, "PTsecurity Exploit")), Ok(()));
        assert_eq!(
            filter.check(&with_message(1, "ET POLICY curl")),
            Err(Rejection::RuleFamily)
        );
    }

    #[test]
    fn test_priority_filter() {
        let filter = AlertFilter::new(&config(vec![]));
        let mut event = with_message(1, "anything");
        event.rule.priority = 3;
        assert_eq!(filter.check(&event), Err(Rejection::Priority));
        event.rule.priority = 2;
        assert_eq!(filter.check(&event), Ok(()));
    }

    #[test]
    fn test_ignore_lists() {
        let filter = AlertFilter::new(&config(vec![]));
        assert_eq!(
            filter.check(&with_message(2000, "anything")),
            Err(Rejection::IgnoredSid)
        );
        assert_eq!(
            filter.check(&with_message(1, "Network SCANNER detected")),
            Err(Rejection::IgnoredMessage)
        );
    }

    #[test]
    fn test_empty_rules_filter_accepts_all_families() {
        let filter = AlertFilter::new(&config(vec![]));
        assert_eq!(filter.check(&with_message(1, "ET POLICY curl")), Ok(()));
        assert_eq!(filter.check(&with_message(1, "home made rule")), Ok(()));
    }

    #[test]
    fn test_combined_families() {
        let filter = AlertFilter::new(&config(vec![RuleFamily::Et, RuleFamily::Custom]));
        assert_eq!(filter.check(&with_message(1, "ET POLICY curl")), Ok(()));
        assert_eq!(filter.check(&with_message(1, "home made rule")), Ok(()));
        assert_eq!(
            filter.check(&with_message(1, "PTsecurity Exploit")),
            Err(Rejection::RuleFamily)
        );
    }
}
