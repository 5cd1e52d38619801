use std::io::Write;
use std::str::FromStr;

use crate::models::schema::instances;
use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsExpression, FromSqlRow,
)]
#[diesel(sql_type = Text)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Updating,
    Error,
    Deleted,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Updating => "updating",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown instance status: {0:?}")]
pub struct ParseInstanceStatusError(String);

impl FromStr for InstanceStatus {
    type Err = ParseInstanceStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "updating" => Ok(Self::Updating),
            "error" => Ok(Self::Error),
            "deleted" => Ok(Self::Deleted),
            other => Err(ParseInstanceStatusError(other.to_string())),
        }
    }
}

impl ToSql<Text, Pg> for InstanceStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for InstanceStatus {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let raw = <String as FromSql<Text, Pg>>::from_sql(bytes)?;
        Ok(raw.parse::<InstanceStatus>()?)
    }
}

/// A persisted sandbox record. Credential columns never serialize.
#[derive(Queryable, Serialize, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = instances)]
pub struct Instance {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub model: String,
    pub channel: String,
    pub ai_provider: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    #[serde(skip_serializing)]
    pub gateway_token: Option<String>,
    pub status: InstanceStatus,
    pub container_ref: Option<String>,
    pub port: Option<i32>,

    pub created_at: chrono::NaiveDateTime,
    pub updated_at: chrono::NaiveDateTime,
}

impl Instance {
    pub fn host_port(&self) -> Option<u16> {
        self.port.and_then(|p| u16::try_from(p).ok())
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = instances)]
pub struct NewInstance {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub model: String,
    pub channel: String,
    pub ai_provider: Option<String>,
    pub api_key: Option<String>,
    pub bot_token: Option<String>,
    pub status: InstanceStatus,
}

/// Partial update. `None` leaves a column untouched; `Some(None)` clears a
/// nullable column.
#[derive(AsChangeset, Debug, Clone, Default, PartialEq)]
#[diesel(table_name = instances)]
pub struct InstancePatch {
    pub status: Option<InstanceStatus>,
    pub container_ref: Option<Option<String>>,
    pub port: Option<Option<i32>>,
    pub gateway_token: Option<Option<String>>,
    pub updated_at: Option<chrono::NaiveDateTime>,
}

impl InstancePatch {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn bound(container_ref: &str, port: u16, status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            container_ref: Some(Some(container_ref.to_string())),
            port: Some(Some(i32::from(port))),
            ..Default::default()
        }
    }

    pub fn with_gateway_token(mut self, token: &str) -> Self {
        self.gateway_token = Some(Some(token.to_string()));
        self
    }

    /// Applies the patch to an in-memory copy, mirroring the SQL update.
    pub fn apply_to(&self, instance: &mut Instance, now: chrono::NaiveDateTime) {
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(container_ref) = &self.container_ref {
            instance.container_ref = container_ref.clone();
        }
        if let Some(port) = self.port {
            instance.port = port;
        }
        if let Some(token) = &self.gateway_token {
            instance.gateway_token = token.clone();
        }
        instance.updated_at = self.updated_at.unwrap_or(now);
    }
}

impl Instance {
    pub fn insert(conn: &mut PgConnection, new: &NewInstance) -> anyhow::Result<Self> {
        let instance = diesel::insert_into(instances::table)
            .values(new)
            .get_result::<Self>(conn)?;
        Ok(instance)
    }

    pub fn find(conn: &mut PgConnection, id: &str) -> anyhow::Result<Option<Self>> {
        let instance = instances::table
            .find(id)
            .first::<Self>(conn)
            .optional()?;
        Ok(instance)
    }

    pub fn list_for_owner(conn: &mut PgConnection, owner_id: &str) -> anyhow::Result<Vec<Self>> {
        let items = instances::table
            .filter(instances::owner_id.eq(owner_id))
            .order(instances::created_at.desc())
            .load::<Self>(conn)?;
        Ok(items)
    }

    pub fn list_with_status(
        conn: &mut PgConnection,
        statuses: &[InstanceStatus],
    ) -> anyhow::Result<Vec<Self>> {
        let items = instances::table
            .filter(instances::status.eq_any(statuses.to_vec()))
            .order(instances::id.asc())
            .load::<Self>(conn)?;
        Ok(items)
    }

    pub fn apply_patch(
        conn: &mut PgConnection,
        id: &str,
        patch: &InstancePatch,
    ) -> anyhow::Result<Option<Self>> {
        let mut patch = patch.clone();
        patch.updated_at = Some(chrono::Utc::now().naive_utc());
        let instance = diesel::update(instances::table.find(id))
            .set(&patch)
            .get_result::<Self>(conn)
            .optional()?;
        Ok(instance)
    }

    pub fn delete(conn: &mut PgConnection, id: &str) -> anyhow::Result<bool> {
        let removed = diesel::delete(instances::table.find(id)).execute(conn)?;
        Ok(removed > 0)
    }
}
