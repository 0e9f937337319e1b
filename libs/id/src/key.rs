//! Job keys: the `namespace/name` identity used by the store and work queue.

use std::fmt;
use std::str::FromStr;

use crate::IdError;

/// Maximum length of a namespace or name segment.
pub const MAX_LABEL_LEN: usize = 63;

/// Identity of a job within the store.
///
/// Keys are user-chosen and stable across delete/recreate; pair with a
/// [`JobUid`](crate::JobUid) to identify one incarnation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    namespace: String,
    name: String,
}

impl JobKey {
    /// Build a key, validating both segments.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_label("namespace", &namespace)?;
        validate_label("name", &name)?;
        Ok(Self { namespace, name })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Lowercase alphanumerics and '-', starting and ending alphanumeric.
fn validate_label(field: &'static str, value: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidLabel {
        field,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(invalid("must be at most 63 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("must contain only lowercase alphanumerics and '-'"));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(invalid("must start and end with an alphanumeric"));
    }
    Ok(())
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for JobKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((namespace, name)) = s.split_once('/') else {
            return Err(IdError::InvalidKey(s.to_string()));
        };
        Self::new(namespace, name)
    }
}

impl serde::Serialize for JobKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for JobKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_display_and_parse() {
        let key = JobKey::new("research", "resnet-50").unwrap();
        assert_eq!(key.to_string(), "research/resnet-50");
        let parsed: JobKey = "research/resnet-50".parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.namespace(), "research");
        assert_eq!(parsed.name(), "resnet-50");
    }

    #[test]
    fn test_job_key_missing_slash() {
        let err = "resnet".parse::<JobKey>().unwrap_err();
        assert!(matches!(err, IdError::InvalidKey(_)));
        assert!(err.is_key_error());
    }

    #[test]
    fn test_job_key_rejects_uppercase() {
        let err = JobKey::new("default", "ResNet").unwrap_err();
        assert!(matches!(err, IdError::InvalidLabel { field: "name", .. }));
    }

    #[test]
    fn test_job_key_rejects_leading_dash() {
        assert!(JobKey::new("-ns", "job").is_err());
        assert!(JobKey::new("ns", "job-").is_err());
    }

    #[test]
    fn test_job_key_rejects_long_label() {
        let long = "a".repeat(MAX_LABEL_LEN + 1);
        assert!(JobKey::new("default", long).is_err());
    }

    #[test]
    fn test_job_key_json_roundtrip() {
        let key = JobKey::new("default", "bert").unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"default/bert\"");
        let parsed: JobKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, key);
    }
}
