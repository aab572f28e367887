//! Postgres world store.
//!
//! All queries are runtime-checked (`sqlx::query`), so the crate builds
//! without a database. Allocation commits run in one transaction that
//! locks the region's area rows and version-checks every server it updates.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use areaplane_id::{AreaId, RegionId, ServerId, TaskId, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use tracing::{debug, instrument};

use super::{DbError, RegionSnapshot, WorldStore};
use crate::allocation::{AllocationPlan, ServerChange, ServerKey};
use crate::hosting::HostedTask;
use crate::model::{Area, AreaRef, Position, Region, Server, ServerState, Task, TaskRole, World};

const SERVER_COLUMNS: &str = "s.id, s.version, s.region_id, s.map_name, s.x, s.y, s.z, \
     s.enabled, s.active, s.public_ip, s.public_web_socket_port, s.domain, s.web_socket_url, s.seen";

const TASK_COLUMNS: &str = "t.id, t.version, t.identifier, t.kind, t.server_id, \
     t.public_web_socket_port, t.private_ip, t.public_ip, t.domain, t.initiated, t.seen";

const AREA_COLUMNS: &str = "a.id, a.region_id, a.area_index, a.name, a.x, a.y, a.z, a.server_id";

/// A row from the servers table, before its areas are attached.
#[derive(Debug, Clone)]
struct ServerRow {
    id: i64,
    version: i64,
    region_id: i64,
    map_name: String,
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    enabled: bool,
    active: bool,
    public_ip: Option<String>,
    public_web_socket_port: Option<i32>,
    domain: Option<String>,
    web_socket_url: Option<String>,
    seen: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ServerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            region_id: row.try_get("region_id")?,
            map_name: row.try_get("map_name")?,
            x: row.try_get("x")?,
            y: row.try_get("y")?,
            z: row.try_get("z")?,
            enabled: row.try_get("enabled")?,
            active: row.try_get("active")?,
            public_ip: row.try_get("public_ip")?,
            public_web_socket_port: row.try_get("public_web_socket_port")?,
            domain: row.try_get("domain")?,
            web_socket_url: row.try_get("web_socket_url")?,
            seen: row.try_get("seen")?,
        })
    }
}

impl ServerRow {
    fn into_server(self, areas: Vec<AreaRef>) -> Result<Server, DbError> {
        let position = match (self.x, self.y, self.z) {
            (Some(x), Some(y), Some(z)) => Some(Position::new(x, y, z)),
            _ => None,
        };
        Ok(Server {
            id: ServerId::new(self.id),
            version: Version::new(self.version),
            state: ServerState {
                region_id: RegionId::new(self.region_id),
                map_name: self.map_name,
                areas,
                position,
                enabled: self.enabled,
                active: self.active,
                public_ip: parse_ip("servers.public_ip", self.public_ip)?,
                public_web_socket_port: parse_port(self.public_web_socket_port)?,
                domain: self.domain,
                web_socket_url: self.web_socket_url,
                seen: self.seen,
            },
        })
    }
}

#[derive(Debug, Clone)]
struct TaskRow {
    id: i64,
    version: i64,
    identifier: String,
    kind: String,
    server_id: Option<i64>,
    public_web_socket_port: Option<i32>,
    private_ip: Option<String>,
    public_ip: Option<String>,
    domain: Option<String>,
    initiated: Option<DateTime<Utc>>,
    seen: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            version: row.try_get("version")?,
            identifier: row.try_get("identifier")?,
            kind: row.try_get("kind")?,
            server_id: row.try_get("server_id")?,
            public_web_socket_port: row.try_get("public_web_socket_port")?,
            private_ip: row.try_get("private_ip")?,
            public_ip: row.try_get("public_ip")?,
            domain: row.try_get("domain")?,
            initiated: row.try_get("initiated")?,
            seen: row.try_get("seen")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let role = match (row.kind.as_str(), row.server_id) {
            ("manager", _) => TaskRole::Manager,
            ("kiosk", _) => TaskRole::Kiosk,
            ("server", Some(server_id)) => TaskRole::Server {
                server_id: ServerId::new(server_id),
                public_web_socket_port: parse_port(row.public_web_socket_port)?,
            },
            (kind, _) => {
                return Err(DbError::Validation(format!(
                    "task {} has invalid kind '{kind}'",
                    row.id
                )))
            }
        };
        Ok(Task {
            id: TaskId::new(row.id),
            version: Version::new(row.version),
            identifier: row.identifier,
            role,
            private_ip: parse_ip("tasks.private_ip", row.private_ip)?,
            public_ip: parse_ip("tasks.public_ip", row.public_ip)?,
            domain: row.domain,
            initiated: row.initiated,
            seen: row.seen,
        })
    }
}

fn parse_ip(column: &str, value: Option<String>) -> Result<Option<IpAddr>, DbError> {
    value
        .map(|s| {
            s.parse()
                .map_err(|_| DbError::Validation(format!("{column} '{s}' is not an IP address")))
        })
        .transpose()
}

fn parse_port(value: Option<i32>) -> Result<Option<u16>, DbError> {
    value
        .map(|p| {
            u16::try_from(p).map_err(|_| DbError::Validation(format!("port {p} out of range")))
        })
        .transpose()
}

fn parse_hosts(column: &str, values: Vec<String>) -> Result<BTreeSet<IpAddr>, DbError> {
    values
        .into_iter()
        .map(|s| {
            s.parse()
                .map_err(|_| DbError::Validation(format!("{column} '{s}' is not an IP address")))
        })
        .collect()
}

fn host_strings(hosts: &BTreeSet<IpAddr>) -> Vec<String> {
    hosts.iter().map(IpAddr::to_string).collect()
}

fn tasks_from_rows(rows: Vec<TaskRow>) -> Result<Vec<Task>, DbError> {
    rows.into_iter().map(Task::try_from).collect()
}

fn select_servers(filter: &str) -> String {
    format!("SELECT {SERVER_COLUMNS} FROM servers s {filter} ORDER BY s.id")
}

/// Binds every stored server column except `region_id`, in column order:
/// map_name, x, y, z, enabled, active, public_ip, public_web_socket_port,
/// domain, web_socket_url, seen.
fn bind_state<'q>(
    query: Query<'q, Postgres, PgArguments>,
    state: &'q ServerState,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(state.map_name.as_str())
        .bind(state.position.map(|p| p.x))
        .bind(state.position.map(|p| p.y))
        .bind(state.position.map(|p| p.z))
        .bind(state.enabled)
        .bind(state.active)
        .bind(state.public_ip.map(|ip| ip.to_string()))
        .bind(state.public_web_socket_port.map(i32::from))
        .bind(state.domain.as_deref())
        .bind(state.web_socket_url.as_deref())
        .bind(state.seen)
}

/// Attaches each server's held areas, ordered by area index.
async fn hydrate(conn: &mut PgConnection, rows: Vec<ServerRow>) -> Result<Vec<Server>, DbError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let area_rows = sqlx::query(
        r#"
        SELECT id, area_index, server_id
        FROM areas
        WHERE server_id = ANY($1)
        ORDER BY area_index, id
        "#,
    )
    .bind(ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(DbError::from_sqlx)?;

    let mut held: HashMap<i64, Vec<AreaRef>> = HashMap::new();
    for row in area_rows {
        let server_id: i64 = row.try_get("server_id").map_err(DbError::from_sqlx)?;
        held.entry(server_id).or_default().push(AreaRef {
            id: AreaId::new(row.try_get("id").map_err(DbError::from_sqlx)?),
            index: row.try_get("area_index").map_err(DbError::from_sqlx)?,
        });
    }

    rows.into_iter()
        .map(|row| {
            let areas = held.remove(&row.id).unwrap_or_default();
            row.into_server(areas)
        })
        .collect()
}

/// World store backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, DbError> {
        self.pool.acquire().await.map_err(DbError::from_sqlx)
    }

    async fn servers_matching(
        &self,
        filter: &str,
        region_id: Option<RegionId>,
    ) -> Result<Vec<Server>, DbError> {
        let mut conn = self.acquire().await?;
        let sql = select_servers(filter);
        let mut query = sqlx::query_as::<_, ServerRow>(&sql);
        if let Some(region_id) = region_id {
            query = query.bind(region_id.get());
        }
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(DbError::from_sqlx)?;
        hydrate(&mut conn, rows).await
    }

    async fn task_exists(&self, id: TaskId) -> Result<bool, DbError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tasks WHERE id = $1)")
            .bind(id.get())
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from_sqlx)
    }
}

#[async_trait]
impl WorldStore for PgStore {
    async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;
        Ok(())
    }

    async fn list_regions(&self) -> Result<Vec<Region>, DbError> {
        let rows = sqlx::query("SELECT id, name, map_name FROM regions ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;

        rows.into_iter()
            .map(|row| {
                Ok(Region {
                    id: RegionId::new(row.try_get("id")?),
                    name: row.try_get("name")?,
                    map_name: row.try_get("map_name")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(DbError::from_sqlx)
    }

    async fn insert_region(&self, name: &str, map_name: &str) -> Result<Region, DbError> {
        let id: i64 =
            sqlx::query_scalar("INSERT INTO regions (name, map_name) VALUES ($1, $2) RETURNING id")
                .bind(name)
                .bind(map_name)
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::from_sqlx)?;

        Ok(Region {
            id: RegionId::new(id),
            name: name.to_string(),
            map_name: map_name.to_string(),
        })
    }

    async fn insert_area(
        &self,
        region_id: RegionId,
        index: i32,
        name: &str,
        position: Position,
    ) -> Result<Area, DbError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO areas (region_id, area_index, name, x, y, z)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(region_id.get())
        .bind(index)
        .bind(name)
        .bind(position.x)
        .bind(position.y)
        .bind(position.z)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            let (unique, foreign_key) = match &e {
                sqlx::Error::Database(db) => {
                    (db.is_unique_violation(), db.is_foreign_key_violation())
                }
                _ => (false, false),
            };
            if unique {
                DbError::Validation(format!(
                    "area index {index} already used in region {region_id}"
                ))
            } else if foreign_key {
                DbError::not_found("region", region_id)
            } else {
                DbError::from_sqlx(e)
            }
        })?;

        Ok(Area {
            id: AreaId::new(id),
            region_id,
            index,
            name: name.to_string(),
            position,
            server_id: None,
        })
    }

    async fn delete_area(&self, area_id: AreaId) -> Result<(), DbError> {
        sqlx::query("DELETE FROM areas WHERE id = $1")
            .bind(area_id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;
        Ok(())
    }

    #[instrument(skip(self), fields(region_id = %region_id))]
    async fn region_snapshot(&self, region_id: RegionId) -> Result<RegionSnapshot, DbError> {
        let mut conn = self.acquire().await?;

        let region = sqlx::query("SELECT id, name, map_name FROM regions WHERE id = $1")
            .bind(region_id.get())
            .fetch_optional(&mut *conn)
            .await
            .map_err(DbError::from_sqlx)?
            .ok_or_else(|| DbError::not_found("region", region_id))?;
        let region = Region {
            id: region_id,
            name: region.try_get("name").map_err(DbError::from_sqlx)?,
            map_name: region.try_get("map_name").map_err(DbError::from_sqlx)?,
        };

        let area_rows = sqlx::query(&format!(
            "SELECT {AREA_COLUMNS} FROM areas a WHERE a.region_id = $1 ORDER BY a.area_index, a.id"
        ))
        .bind(region_id.get())
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::from_sqlx)?;
        let areas = area_rows
            .into_iter()
            .map(|row| {
                let server_id: Option<i64> = row.try_get("server_id")?;
                Ok(Area {
                    id: AreaId::new(row.try_get("id")?),
                    region_id,
                    index: row.try_get("area_index")?,
                    name: row.try_get("name")?,
                    position: Position::new(row.try_get("x")?, row.try_get("y")?, row.try_get("z")?),
                    server_id: server_id.map(ServerId::new),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(DbError::from_sqlx)?;

        let server_rows =
            sqlx::query_as::<_, ServerRow>(&select_servers("WHERE s.region_id = $1"))
                .bind(region_id.get())
                .fetch_all(&mut *conn)
                .await
                .map_err(DbError::from_sqlx)?;
        let servers = hydrate(&mut conn, server_rows).await?;

        let task_rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT DISTINCT ON (t.server_id) {TASK_COLUMNS}
            FROM tasks t
            JOIN servers s ON s.id = t.server_id
            WHERE s.region_id = $1
            ORDER BY t.server_id, t.id
            "#
        ))
        .bind(region_id.get())
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::from_sqlx)?;
        let server_tasks = tasks_from_rows(task_rows)?
            .into_iter()
            .filter_map(|task| task.role.server_id().map(|id| (id, task)))
            .collect();

        Ok(RegionSnapshot {
            region,
            areas,
            servers,
            server_tasks,
        })
    }

    #[instrument(skip(self, plan), fields(region_id = %plan.region_id))]
    async fn commit_allocation(&self, plan: &AllocationPlan) -> Result<Vec<Server>, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::from_sqlx)?;

        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?;

        let owners: HashMap<i64, Option<i64>> = sqlx::query(
            "SELECT id, server_id FROM areas WHERE region_id = $1 ORDER BY id FOR UPDATE",
        )
        .bind(plan.region_id.get())
        .fetch_all(&mut *tx)
        .await
        .map_err(DbError::from_sqlx)?
        .into_iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("server_id")?)))
        .collect::<Result<_, sqlx::Error>>()
        .map_err(DbError::from_sqlx)?;

        for (area_id, expected) in &plan.expected_owners {
            match owners.get(&area_id.get()) {
                Some(current) if *current == expected.map(|id| id.get()) => {}
                _ => return Err(DbError::conflict("area", area_id)),
            }
        }

        let mut assigned: HashMap<usize, ServerId> = HashMap::new();
        let mut updated: Vec<i64> = Vec::new();

        for planned in &plan.servers {
            match (planned.key, planned.change) {
                (ServerKey::New(n), _) => {
                    let query = sqlx::query_scalar::<_, i64>(
                        r#"
                        INSERT INTO servers (
                            region_id, map_name, x, y, z, enabled, active, public_ip,
                            public_web_socket_port, domain, web_socket_url, seen
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                        RETURNING id
                        "#,
                    )
                    .bind(plan.region_id.get())
                    .bind(planned.state.map_name.as_str())
                    .bind(planned.state.position.map(|p| p.x))
                    .bind(planned.state.position.map(|p| p.y))
                    .bind(planned.state.position.map(|p| p.z))
                    .bind(planned.state.enabled)
                    .bind(planned.state.active)
                    .bind(planned.state.public_ip.map(|ip| ip.to_string()))
                    .bind(planned.state.public_web_socket_port.map(i32::from))
                    .bind(planned.state.domain.as_deref())
                    .bind(planned.state.web_socket_url.as_deref())
                    .bind(planned.state.seen);
                    let id = query
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(DbError::from_sqlx)?;
                    assigned.insert(n, ServerId::new(id));
                    updated.push(id);
                }
                (ServerKey::Existing { .. }, ServerChange::Unchanged) => {}
                (ServerKey::Existing { id, .. }, ServerChange::Seen) => {
                    sqlx::query("UPDATE servers SET seen = $2 WHERE id = $1")
                        .bind(id.get())
                        .bind(planned.state.seen)
                        .execute(&mut *tx)
                        .await
                        .map_err(DbError::from_sqlx)?;
                }
                (ServerKey::Existing { id, version }, ServerChange::Updated) => {
                    let query = sqlx::query(
                        r#"
                        UPDATE servers SET
                            version = version + 1,
                            map_name = $3, x = $4, y = $5, z = $6, enabled = $7, active = $8,
                            public_ip = $9, public_web_socket_port = $10, domain = $11,
                            web_socket_url = $12, seen = $13
                        WHERE id = $1 AND version = $2
                        "#,
                    )
                    .bind(id.get())
                    .bind(version.value());
                    let result = bind_state(query, &planned.state)
                        .execute(&mut *tx)
                        .await
                        .map_err(DbError::from_sqlx)?;
                    if result.rows_affected() == 0 {
                        return Err(DbError::conflict("server", id));
                    }
                    updated.push(id.get());
                }
            }
        }

        for (area_id, owner) in plan.desired_owners() {
            let owner = match owner {
                None => None,
                Some(ServerKey::Existing { id, .. }) => Some(id),
                Some(ServerKey::New(n)) => assigned.get(&n).copied(),
            };
            sqlx::query(
                "UPDATE areas SET server_id = $2 WHERE id = $1 AND server_id IS DISTINCT FROM $2",
            )
            .bind(area_id.get())
            .bind(owner.map(|id| id.get()))
            .execute(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;
        }

        let rows = sqlx::query_as::<_, ServerRow>(&select_servers("WHERE s.id = ANY($1)"))
            .bind(updated)
            .fetch_all(&mut *tx)
            .await
            .map_err(DbError::from_sqlx)?;
        let servers = hydrate(&mut *tx, rows).await?;

        tx.commit().await.map_err(DbError::from_sqlx)?;

        debug!(updated = servers.len(), "Committed allocation");
        Ok(servers)
    }

    async fn list_servers(&self) -> Result<Vec<Server>, DbError> {
        self.servers_matching("", None).await
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>, DbError> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query_as::<_, ServerRow>(&select_servers("WHERE s.id = $1"))
            .bind(id.get())
            .fetch_all(&mut *conn)
            .await
            .map_err(DbError::from_sqlx)?;
        Ok(hydrate(&mut conn, rows).await?.into_iter().next())
    }

    async fn update_server(&self, server: &Server) -> Result<Server, DbError> {
        let query = sqlx::query(
            r#"
            UPDATE servers SET
                version = version + 1,
                map_name = $3, x = $4, y = $5, z = $6, enabled = $7, active = $8,
                public_ip = $9, public_web_socket_port = $10, domain = $11,
                web_socket_url = $12, seen = $13
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(server.id.get())
        .bind(server.version.value());
        let result = bind_state(query, &server.state)
            .execute(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return match self.get_server(server.id).await? {
                Some(_) => Err(DbError::conflict("server", server.id)),
                None => Err(DbError::not_found("server", server.id)),
            };
        }

        self.get_server(server.id)
            .await?
            .ok_or_else(|| DbError::not_found("server", server.id))
    }

    async fn servers_with_areas_differing(
        &self,
        region_id: RegionId,
        area_ids: &BTreeSet<AreaId>,
    ) -> Result<Vec<Server>, DbError> {
        let servers = self
            .servers_matching("WHERE s.region_id = $1", Some(region_id))
            .await?;
        Ok(servers
            .into_iter()
            .filter(|s| s.state.area_ids() != *area_ids)
            .collect())
    }

    async fn first_server_containing(
        &self,
        region_id: RegionId,
        area_id: AreaId,
    ) -> Result<Option<Server>, DbError> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query_as::<_, ServerRow>(&format!(
            r#"
            SELECT {SERVER_COLUMNS} FROM servers s
            WHERE s.region_id = $1
              AND EXISTS (SELECT 1 FROM areas a WHERE a.server_id = s.id AND a.id = $2)
            ORDER BY s.id
            LIMIT 1
            "#
        ))
        .bind(region_id.get())
        .bind(area_id.get())
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::from_sqlx)?;
        Ok(hydrate(&mut conn, rows).await?.into_iter().next())
    }

    async fn first_empty_server(&self, region_id: RegionId) -> Result<Option<Server>, DbError> {
        let mut conn = self.acquire().await?;
        let rows = sqlx::query_as::<_, ServerRow>(&format!(
            r#"
            SELECT {SERVER_COLUMNS} FROM servers s
            WHERE s.region_id = $1
              AND NOT EXISTS (SELECT 1 FROM areas a WHERE a.server_id = s.id)
            ORDER BY s.id
            LIMIT 1
            "#
        ))
        .bind(region_id.get())
        .fetch_all(&mut *conn)
        .await
        .map_err(DbError::from_sqlx)?;
        Ok(hydrate(&mut conn, rows).await?.into_iter().next())
    }

    async fn enabled_servers_without_task(&self) -> Result<Vec<Server>, DbError> {
        self.servers_matching(
            "WHERE s.enabled AND NOT EXISTS (SELECT 1 FROM tasks t WHERE t.server_id = s.id)",
            None,
        )
        .await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DbError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t ORDER BY t.id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        tasks_from_rows(rows)
    }

    async fn server_task(&self, server_id: ServerId) -> Result<Option<Task>, DbError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks t WHERE t.server_id = $1 ORDER BY t.id LIMIT 1"
        ))
        .bind(server_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        row.map(Task::try_from).transpose()
    }

    async fn enabled_server_tasks(&self) -> Result<Vec<Task>, DbError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT DISTINCT ON (t.server_id) {TASK_COLUMNS}
            FROM tasks t
            JOIN servers s ON s.id = t.server_id
            WHERE s.enabled
            ORDER BY t.server_id, t.id
            "#
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        tasks_from_rows(rows)
    }

    async fn upsert_polled_task(
        &self,
        hosted: &HostedTask,
        seen: DateTime<Utc>,
    ) -> Result<Task, DbError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO tasks AS t (
                identifier, kind, server_id, public_web_socket_port, private_ip, public_ip, seen
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (identifier) DO UPDATE SET
                kind = EXCLUDED.kind,
                server_id = EXCLUDED.server_id,
                public_web_socket_port = EXCLUDED.public_web_socket_port,
                private_ip = EXCLUDED.private_ip,
                domain = CASE
                    WHEN t.public_ip IS DISTINCT FROM EXCLUDED.public_ip THEN NULL
                    ELSE t.domain
                END,
                public_ip = EXCLUDED.public_ip,
                seen = EXCLUDED.seen,
                version = t.version + 1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&hosted.identifier)
        .bind(hosted.role.kind())
        .bind(hosted.role.server_id().map(|id| id.get()))
        .bind(hosted.role.public_web_socket_port().map(i32::from))
        .bind(hosted.private_ip.map(|ip| ip.to_string()))
        .bind(hosted.public_ip.map(|ip| ip.to_string()))
        .bind(seen)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        Task::try_from(row)
    }

    async fn record_started_task(
        &self,
        hosted: &HostedTask,
        initiated: DateTime<Utc>,
    ) -> Result<Task, DbError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            INSERT INTO tasks AS t (
                identifier, kind, server_id, public_web_socket_port, private_ip, public_ip, initiated
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (identifier) DO UPDATE SET
                initiated = EXCLUDED.initiated,
                version = t.version + 1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(&hosted.identifier)
        .bind(hosted.role.kind())
        .bind(hosted.role.server_id().map(|id| id.get()))
        .bind(hosted.role.public_web_socket_port().map(i32::from))
        .bind(hosted.private_ip.map(|ip| ip.to_string()))
        .bind(hosted.public_ip.map(|ip| ip.to_string()))
        .bind(initiated)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        Task::try_from(row)
    }

    async fn stale_tasks(
        &self,
        keep: &BTreeSet<String>,
        seen_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks t
            WHERE t.seen IS NOT NULL
              AND t.seen < $1
              AND NOT (t.identifier = ANY($2))
            ORDER BY t.id
            "#
        ))
        .bind(seen_before)
        .bind(keep.iter().cloned().collect::<Vec<String>>())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        tasks_from_rows(rows)
    }

    async fn unused_server_tasks(
        &self,
        keep: &BTreeSet<String>,
        initiated_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, DbError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            SELECT {TASK_COLUMNS} FROM tasks t
            WHERE t.kind = 'server'
              AND NOT (t.identifier = ANY($1))
              AND (t.initiated IS NULL OR t.initiated < $2)
            ORDER BY t.id
            "#
        ))
        .bind(keep.iter().cloned().collect::<Vec<String>>())
        .bind(initiated_before)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;
        tasks_from_rows(rows)
    }

    async fn set_task_domain(&self, id: TaskId, domain: &str) -> Result<(), DbError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET domain = $2, version = version + 1
            WHERE id = $1 AND domain IS DISTINCT FROM $2
            "#,
        )
        .bind(id.get())
        .bind(domain)
        .execute(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;

        if result.rows_affected() == 0 && !self.task_exists(id).await? {
            return Err(DbError::not_found("task", id));
        }
        Ok(())
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), DbError> {
        sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?;
        Ok(())
    }

    async fn get_world(&self) -> Result<World, DbError> {
        let row = sqlx::query("SELECT version, manager_hosts, kiosk_hosts FROM world WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from_sqlx)?
            .ok_or_else(|| DbError::not_found("world", 1))?;
        world_from_row(&row)
    }

    async fn update_world_hosts(
        &self,
        manager_hosts: &BTreeSet<IpAddr>,
        kiosk_hosts: &BTreeSet<IpAddr>,
    ) -> Result<Option<World>, DbError> {
        let row = sqlx::query(
            r#"
            UPDATE world SET
                manager_hosts = $1,
                kiosk_hosts = $2,
                version = version + 1
            WHERE id = 1
              AND (manager_hosts IS DISTINCT FROM $1 OR kiosk_hosts IS DISTINCT FROM $2)
            RETURNING version, manager_hosts, kiosk_hosts
            "#,
        )
        .bind(host_strings(manager_hosts))
        .bind(host_strings(kiosk_hosts))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from_sqlx)?;

        row.as_ref().map(world_from_row).transpose()
    }
}

fn world_from_row(row: &PgRow) -> Result<World, DbError> {
    let version: i64 = row.try_get("version").map_err(DbError::from_sqlx)?;
    let manager_hosts: Vec<String> = row.try_get("manager_hosts").map_err(DbError::from_sqlx)?;
    let kiosk_hosts: Vec<String> = row.try_get("kiosk_hosts").map_err(DbError::from_sqlx)?;
    Ok(World {
        version: Version::new(version),
        manager_hosts: parse_hosts("world.manager_hosts", manager_hosts)?,
        kiosk_hosts: parse_hosts("world.kiosk_hosts", kiosk_hosts)?,
    })
}
