use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::error::AccessError;

/// A right granted by an access group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessRight {
    Read,
    Write,
}

/// Access security groups, loaded at boot from the rules file and bound to
/// channels through their descriptor's `group` attribute.
///
/// The YAML format of a rules file is
///
/// ```yml
/// groups:
///   default: [read, write]
///   readonly: [read]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRules {
    pub groups: BTreeMap<String, Vec<AccessRight>>,
}

impl Default for AccessRules {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            String::from("default"),
            vec![AccessRight::Read, AccessRight::Write],
        );
        groups.insert(String::from("readonly"), vec![AccessRight::Read]);
        Self { groups }
    }
}

impl AccessRules {
    pub fn read_rules_file(path: &Path) -> Result<Self, AccessError> {
        if !path.exists() {
            return Err(AccessError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        let rules = serde_yaml::from_str::<Self>(&yaml_str)?;
        if !rules.groups.contains_key("default") {
            return Err(AccessError::MissingDefault);
        }
        Ok(rules)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    fn grants(&self, group: &str, right: AccessRight) -> bool {
        self.groups
            .get(group)
            .is_some_and(|rights| rights.contains(&right))
    }

    pub fn can_read(&self, group: &str) -> bool {
        self.grants(group, AccessRight::Read)
    }

    pub fn can_write(&self, group: &str) -> bool {
        self.grants(group, AccessRight::Write)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_rules() {
        let rules = AccessRules::default();
        assert!(rules.can_write("default"));
        assert!(rules.can_read("readonly"));
        assert!(!rules.can_write("readonly"));
        assert!(!rules.can_read("unknown"));
    }

    #[test]
    fn test_rules_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "groups:\n  default: [read, write]\n  operators: [read]\n"
        )
        .unwrap();
        let rules = AccessRules::read_rules_file(file.path()).unwrap();
        assert!(rules.has_group("operators"));
        assert!(!rules.can_write("operators"));
    }

    #[test]
    fn test_rules_file_without_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "groups:\n  operators: [read]\n").unwrap();
        assert!(matches!(
            AccessRules::read_rules_file(file.path()),
            Err(AccessError::MissingDefault)
        ));
    }
}
