use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// A repository's catalog row: its owning namespace (first path component
/// of its name, per `core::name`'s grammar) and whether anonymous pull is
/// allowed. This is the ambient catalog the HTTP adapter consults when
/// turning a JWT `sub` claim into an `AccessSet` (spec §4.H leaves "how
/// the adapter builds an access-set" unspecified).
#[allow(dead_code)]
#[derive(Debug, Clone, FromRow, Default)]
pub struct Repo {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repo {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            is_public: false,
            ..Default::default()
        }
    }
}
