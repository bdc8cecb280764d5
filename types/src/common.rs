use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. `0` means "unset" (never happened).
pub type Millis = i64;

pub fn now_ms() -> Millis {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A value that is either given inline or resolved from a secret store at
/// use time. Exactly one of the two fields is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EnvVar {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

impl EnvVar {
    pub fn value(v: impl Into<String>) -> Self {
        EnvVar {
            value: Some(v.into()),
            secret_name: None,
        }
    }

    pub fn secret(name: impl Into<String>) -> Self {
        EnvVar {
            value: None,
            secret_name: Some(name.into()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some() ^ self.secret_name.is_some()
    }
}

/// Named, unique tag attachable to clusters, installations, and groups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Annotation {
    pub name: String,
}

/// Fields every lock-bearing resource carries: the lease held by the work
/// lock, plus the two independent policy flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LockState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_acquired_by: Option<String>,
    #[serde(default)]
    pub lock_acquired_at: Millis,
    #[serde(default)]
    pub api_locked: bool,
    #[serde(default)]
    pub deletion_locked: bool,
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        self.lock_acquired_at != 0
    }

    /// The holder identifier and the acquisition timestamp are always set
    /// or unset together.
    pub fn is_consistent(&self) -> bool {
        self.lock_acquired_by.is_some() == (self.lock_acquired_at != 0)
    }
}

/// Paging request as accepted by the HTTP surface: zero-indexed `page`,
/// `per_page` (<= 0 means "all"), and a deletion visibility filter.
///
/// Fields deserialize from either native values or their string forms,
/// since query-string parsing hands every value over as a string when
/// this struct is flattened into a larger filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default, deserialize_with = "deserialize_i64_from_string_or_int")]
    pub page: i64,
    #[serde(default, deserialize_with = "deserialize_i64_from_string_or_int")]
    pub per_page: i64,
    #[serde(default, deserialize_with = "deserialize_bool_from_string_or_bool")]
    pub include_deleted: bool,
}

pub fn deserialize_i64_from_string_or_int<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct I64Visitor;

    impl serde::de::Visitor<'_> for I64Visitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer or a string containing an integer")
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            i64::try_from(v).map_err(|_| E::custom("integer out of range"))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            v.trim()
                .parse::<i64>()
                .map_err(|e| E::custom(format!("invalid integer: {e}")))
        }
    }

    deserializer.deserialize_any(I64Visitor)
}

pub fn deserialize_bool_from_string_or_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct BoolVisitor;

    impl serde::de::Visitor<'_> for BoolVisitor {
        type Value = bool;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a boolean or a string containing a boolean")
        }

        fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            match v.trim() {
                "true" | "1" => Ok(true),
                "false" | "0" | "" => Ok(false),
                other => Err(E::custom(format!("invalid boolean: {other}"))),
            }
        }
    }

    deserializer.deserialize_any(BoolVisitor)
}

pub fn deserialize_opt_bool_from_string_or_bool<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct OptBoolVisitor;

    impl<'de> serde::de::Visitor<'de> for OptBoolVisitor {
        type Value = Option<bool>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an optional boolean or a string containing a boolean")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2>(self, deserializer: D2) -> Result<Self::Value, D2::Error>
        where
            D2: serde::Deserializer<'de>,
        {
            deserialize_bool_from_string_or_bool(deserializer).map(Some)
        }

        fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v.trim().is_empty() {
                return Ok(None);
            }
            match v.trim() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                other => Err(E::custom(format!("invalid boolean: {other}"))),
            }
        }
    }

    deserializer.deserialize_any(OptBoolVisitor)
}

impl Default for PageRequest {
    fn default() -> Self {
        PageRequest {
            page: 0,
            per_page: 0,
            include_deleted: false,
        }
    }
}

impl PageRequest {
    /// Translate page/per_page into the offset/limit pair the Store's SQL
    /// primitives speak natively.
    pub fn offset_limit(&self) -> (i64, Option<i64>) {
        if self.per_page <= 0 {
            (0, None)
        } else {
            (self.page.max(0) * self.per_page, Some(self.per_page))
        }
    }
}

/// Tri-state filter for a nullable boolean column (e.g. deletion_locked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Any,
    OnlyTrue,
    OnlyFalse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
    pub has_more: bool,
    pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_request_accepts_stringly_typed_query_values() {
        let parsed: PageRequest =
            serde_json::from_str(r#"{"page": "2", "per_page": "10", "include_deleted": "true"}"#)
                .unwrap();
        assert_eq!(parsed.page, 2);
        assert_eq!(parsed.per_page, 10);
        assert!(parsed.include_deleted);

        let native: PageRequest =
            serde_json::from_str(r#"{"page": 1, "per_page": 5, "include_deleted": false}"#).unwrap();
        assert_eq!(native.page, 1);
        assert_eq!(native.per_page, 5);

        assert!(serde_json::from_str::<PageRequest>(r#"{"page": "zero"}"#).is_err());
    }

    #[test]
    fn per_page_at_or_below_zero_means_unbounded() {
        let all = PageRequest {
            page: 3,
            per_page: 0,
            include_deleted: false,
        };
        assert_eq!(all.offset_limit(), (0, None));

        let bounded = PageRequest {
            page: 2,
            per_page: 25,
            include_deleted: false,
        };
        assert_eq!(bounded.offset_limit(), (50, Some(25)));
    }

    #[test]
    fn env_var_requires_exactly_one_side() {
        assert!(EnvVar::value("x").is_valid());
        assert!(EnvVar::secret("s").is_valid());
        assert!(!EnvVar::default().is_valid());
        assert!(
            !EnvVar {
                value: Some("x".into()),
                secret_name: Some("s".into()),
            }
            .is_valid()
        );
    }

    #[test]
    fn lock_state_consistency() {
        assert!(LockState::default().is_consistent());
        let held = LockState {
            lock_acquired_by: Some("worker-a".into()),
            lock_acquired_at: 1,
            api_locked: false,
            deletion_locked: false,
        };
        assert!(held.is_consistent() && held.is_locked());
        let torn = LockState {
            lock_acquired_by: None,
            lock_acquired_at: 5,
            api_locked: false,
            deletion_locked: false,
        };
        assert!(!torn.is_consistent());
    }
}
