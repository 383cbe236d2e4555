//! Per-SID connection overrides and extra labels.

use regex::Regex;
use tracing::debug;

use crate::config::{DiscoveryConfig, DynamicParams, Secret};
use crate::data::Tags;
use crate::driver::ConnectParams;

/// Placeholder in `connect_dsn` replaced by the discovered SID.
pub const SID_PLACEHOLDER: &str = "SID";

struct Rule {
    sid_regex: Regex,
    params: DynamicParams,
}

/// Compiled `[discovery]` connection and label settings.
pub struct DynamicRules {
    dsn: String,
    user: String,
    password: Secret,
    max_connections: u32,
    connect_timeout: std::time::Duration,
    static_labels: Tags,
    rules: Vec<Rule>,
}

impl DynamicRules {
    pub fn new(cfg: &DiscoveryConfig) -> Result<Self, regex::Error> {
        let rules = cfg
            .dynamic_params
            .iter()
            .map(|p| {
                Ok(Rule {
                    sid_regex: Regex::new(&p.sid_regex)?,
                    params: p.clone(),
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self {
            dsn: cfg.connect_dsn.clone(),
            user: cfg.connect_user.clone(),
            password: cfg.connect_pass.clone(),
            max_connections: cfg.max_open_connections,
            connect_timeout: cfg.connect_timeout,
            static_labels: cfg.extra_labels.clone().into_iter().collect(),
            rules,
        })
    }

    /// Connection parameters for `sid`.
    ///
    /// For each of DSN, user and password the first matching rule with a
    /// non-empty value wins; otherwise the `[discovery]` default applies.
    pub fn connect_params(&self, sid: &str) -> ConnectParams {
        let matching: Vec<&DynamicParams> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.sid_regex.is_match(sid))
            .map(|(n, r)| {
                debug!(sid, rule = n, regex = %r.sid_regex, "dynamic connect params match");
                &r.params
            })
            .collect();

        let dsn = matching
            .iter()
            .map(|p| p.connect_dsn.as_str())
            .find(|v| !v.is_empty())
            .unwrap_or(&self.dsn);
        let user = matching
            .iter()
            .map(|p| p.connect_user.as_str())
            .find(|v| !v.is_empty())
            .unwrap_or(&self.user);
        let password = matching
            .iter()
            .map(|p| &p.connect_pass)
            .find(|v| !v.is_empty())
            .unwrap_or(&self.password);

        ConnectParams {
            dsn: dsn.replace(SID_PLACEHOLDER, sid),
            user: user.to_string(),
            password: password.clone(),
            max_connections: self.max_connections,
            connect_timeout: self.connect_timeout,
        }
    }

    /// Static labels, then every matching rule's labels in order (later
    /// rules override earlier ones), then the mandatory identity labels.
    pub fn labels(&self, instance: &str, role: &str, db: &str) -> Tags {
        let mut labels = self.static_labels.clone();
        for rule in self.rules.iter().filter(|r| r.sid_regex.is_match(instance)) {
            labels.extend(
                rule.params
                    .extra_labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        labels.insert("instance".to_string(), instance.to_string());
        labels.insert("instance_role".to_string(), role.to_string());
        labels.insert("db".to_string(), db.to_string());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn rule(regex: &str, dsn: &str, user: &str, labels: &[(&str, &str)]) -> DynamicParams {
        DynamicParams {
            sid_regex: regex.into(),
            connect_dsn: dsn.into(),
            connect_user: user.into(),
            connect_pass: Secret::default(),
            extra_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn config(rules: Vec<DynamicParams>) -> DiscoveryConfig {
        DiscoveryConfig {
            connect_dsn: "db:1521/SID".into(),
            connect_user: "monitor".into(),
            connect_pass: Secret::new("pw"),
            extra_labels: BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("dc".to_string(), "east".to_string()),
            ]),
            dynamic_params: rules,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_dsn_placeholder_is_replaced() {
        let r = DynamicRules::new(&config(vec![])).unwrap();
        let p = r.connect_params("ORCL1");
        assert_eq!(p.dsn, "db:1521/ORCL1");
        assert_eq!(p.user, "monitor");
        assert_eq!(p.password.expose(), "pw");
        assert_eq!(p.max_connections, 3);
    }

    #[test]
    fn test_first_matching_rule_wins_per_field() {
        let r = DynamicRules::new(&config(vec![
            rule("^TEST", "", "tester", &[]),
            rule("^TEST1", "test1:1521/SID", "other", &[]),
            rule("^PROD", "prod:1521/SID", "", &[]),
        ]))
        .unwrap();

        let p = r.connect_params("TEST1");
        assert_eq!(p.dsn, "test1:1521/TEST1");
        assert_eq!(p.user, "tester");
        assert_eq!(p.password.expose(), "pw");

        let p = r.connect_params("DEV");
        assert_eq!(p.dsn, "db:1521/DEV");
    }

    #[test]
    fn test_later_label_rule_overrides_earlier() {
        let r = DynamicRules::new(&config(vec![
            rule("^ORCL", "", "", &[("env", "staging"), ("team", "a")]),
            rule("ORCL1$", "", "", &[("team", "b")]),
            rule("^NOPE", "", "", &[("dc", "west")]),
        ]))
        .unwrap();

        let labels = r.labels("ORCL1", "PRIMARY_INSTANCE", "ORCL");
        assert_eq!(labels["env"], "staging");
        assert_eq!(labels["team"], "b");
        assert_eq!(labels["dc"], "east");
        assert_eq!(labels["instance"], "ORCL1");
        assert_eq!(labels["instance_role"], "PRIMARY_INSTANCE");
        assert_eq!(labels["db"], "ORCL");

        let labels = r.labels("OTHER", "", "");
        assert_eq!(labels["env"], "prod");
        assert!(!labels.contains_key("team"));
    }

    #[test]
    fn test_mandatory_labels_cannot_be_overridden() {
        let r = DynamicRules::new(&config(vec![rule(".*", "", "", &[("instance", "x")])])).unwrap();
        assert_eq!(r.labels("ORCL1", "", "")["instance"], "ORCL1");
    }
}
