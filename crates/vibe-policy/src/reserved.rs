//! Database names tenants can never address.

/// The control database name plus any configured extras. Comparison ignores
/// ASCII case and surrounding double quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedDatabases {
    names: Vec<String>,
}

impl ReservedDatabases {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| normalize(n.as_ref()))
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &vibe_core::VibeConfig) -> Self {
        Self::new(config.reserved_databases())
    }

    pub fn is_reserved(&self, database: &str) -> bool {
        let database = normalize(database);
        self.names.iter().any(|n| *n == database)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_matches('"').to_ascii_lowercase()
}
