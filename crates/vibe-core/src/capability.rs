//! Capability kinds and column-level capability maps.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::ident::Identifier;

/// A single operation a tenant may perform against a schema or table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Select,
    Insert,
    Update,
    Delete,
    Truncate,
    References,
    Trigger,
    CreateTable,
    AlterTable,
    DropTable,
    CreateSchema,
}

impl Capability {
    /// Table privileges, in the order Postgres lists them.
    pub const TABLE_PRIVILEGES: [Capability; 7] = [
        Capability::Select,
        Capability::Insert,
        Capability::Update,
        Capability::Delete,
        Capability::Truncate,
        Capability::References,
        Capability::Trigger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Truncate => "truncate",
            Self::References => "references",
            Self::Trigger => "trigger",
            Self::CreateTable => "create_table",
            Self::AlterTable => "alter_table",
            Self::DropTable => "drop_table",
            Self::CreateSchema => "create_schema",
        }
    }

    /// Keyword used in a Postgres `GRANT` statement, if this is a table privilege.
    pub fn privilege_keyword(&self) -> Option<&'static str> {
        match self {
            Self::Select => Some("SELECT"),
            Self::Insert => Some("INSERT"),
            Self::Update => Some("UPDATE"),
            Self::Delete => Some("DELETE"),
            Self::Truncate => Some("TRUNCATE"),
            Self::References => Some("REFERENCES"),
            Self::Trigger => Some("TRIGGER"),
            _ => None,
        }
    }

    /// Whether Postgres allows granting this capability on individual columns.
    pub fn is_column_grantable(&self) -> bool {
        matches!(
            self,
            Self::Select | Self::Insert | Self::Update | Self::References
        )
    }

    /// Whether this capability permits modifying data or structure.
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Select | Self::References)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a capability name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capability '{0}'")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "select" => Ok(Self::Select),
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "truncate" => Ok(Self::Truncate),
            "references" => Ok(Self::References),
            "trigger" => Ok(Self::Trigger),
            "create_table" => Ok(Self::CreateTable),
            "alter_table" => Ok(Self::AlterTable),
            "drop_table" => Ok(Self::DropTable),
            "create_schema" => Ok(Self::CreateSchema),
            other => Err(UnknownCapability(other.to_string())),
        }
    }
}

/// Error raised when a column map fails validation at write time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ColumnMaskError {
    #[error("invalid column name '{0}'")]
    InvalidColumn(String),

    #[error(transparent)]
    UnknownCapability(#[from] UnknownCapability),

    #[error("capability '{capability}' cannot be granted on column '{column}'")]
    NotColumnGrantable { column: String, capability: Capability },

    #[error("column '{0}' has an empty capability list")]
    EmptyColumn(String),
}

/// Strongly typed column-level capability map.
///
/// Construction always goes through validation, so a stored mask can never
/// hold an entry that silently disables enforcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ColumnMask {
    columns: BTreeMap<String, BTreeSet<Capability>>,
}

impl ColumnMask {
    /// Build a mask from `column -> [capability names]`, as stored in the
    /// control database (`{"email": ["SELECT"], "name": ["SELECT", "UPDATE"]}`).
    pub fn from_names<I, C, S>(entries: I) -> Result<Self, ColumnMaskError>
    where
        I: IntoIterator<Item = (C, Vec<S>)>,
        C: AsRef<str>,
        S: AsRef<str>,
    {
        let mut columns = BTreeMap::new();
        for (column, names) in entries {
            let column = column.as_ref();
            let mut caps = BTreeSet::new();
            for name in names {
                caps.insert(name.as_ref().parse::<Capability>()?);
            }
            Self::check_entry(column, &caps)?;
            columns.insert(column.to_string(), caps);
        }
        Ok(Self { columns })
    }

    /// Build a mask from already-typed entries.
    pub fn new(
        entries: impl IntoIterator<Item = (String, BTreeSet<Capability>)>,
    ) -> Result<Self, ColumnMaskError> {
        let mut columns = BTreeMap::new();
        for (column, caps) in entries {
            Self::check_entry(&column, &caps)?;
            columns.insert(column, caps);
        }
        Ok(Self { columns })
    }

    fn check_entry(column: &str, caps: &BTreeSet<Capability>) -> Result<(), ColumnMaskError> {
        if Identifier::parse(column).is_err() {
            return Err(ColumnMaskError::InvalidColumn(column.to_string()));
        }
        if caps.is_empty() {
            return Err(ColumnMaskError::EmptyColumn(column.to_string()));
        }
        if let Some(bad) = caps.iter().find(|c| !c.is_column_grantable()) {
            return Err(ColumnMaskError::NotColumnGrantable {
                column: column.to_string(),
                capability: *bad,
            });
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether `column` may be used for `capability`.
    pub fn allows(&self, column: &str, capability: Capability) -> bool {
        self.columns
            .get(column)
            .is_some_and(|caps| caps.contains(&capability))
    }

    /// Columns accessible for `capability`, in name order.
    pub fn columns_with(&self, capability: Capability) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|(_, caps)| caps.contains(&capability))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<Capability>)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<'de> Deserialize<'de> for ColumnMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw: BTreeMap<String, Vec<String>> = BTreeMap::deserialize(deserializer)?;
        ColumnMask::from_names(raw).map_err(serde::de::Error::custom)
    }
}
