use crate::error::{DataSetError, Result};
use crate::model::{generate_id, generate_path_id, AttributeChain, AuditInfo, EntityKind, Id, DEFAULT_MAX_CHAIN_DEPTH};
use crate::store::collaborators::{AuditSink, LogAuditSink};
use crate::store::records::{
    AttributePathRecord, AttributeRecord, DataSetListRecord, DataSetRecord, ListValueRecord, NewAttribute,
    ParameterInput, ParameterRecord, VisibilityAreaRecord,
};
use crate::store::row_stream::{
    AttributeColumns, DataSetColumns, FlatRow, ListValueColumns, ParameterColumns, PathColumns, RowQuery, RowSource,
    RowStream,
};
use crate::store::traits::{AttributeStore, DataSetListStore, DataSetStore, ParameterStore, VisibilityAreaStore};
use crate::store::validation::{check_chain, check_new_attribute, check_payload};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::runtime::Handle;

const LIST_COLUMNS: &str = "id, visibility_area_id, name, test_plan_id, created_by, created_when, modified_by, modified_when";
const ATTRIBUTE_COLUMNS: &str = "id, data_set_list_id, name, ordering, attribute_type, reference_list_id";
const DATA_SET_COLUMNS: &str = "id, data_set_list_id, name, ordering, locked";
const PARAMETER_COLUMNS: &str = "id, data_set_id, attribute_id, path_id, text, list_value_id, data_set_ref_id";
const PATH_COLUMNS: &str = "id, data_set_list_id, data_set_id, target_attribute_id, chain";

const HEADER_SELECT: &str = r#"
    va.id AS area_id, va.name AS area_name,
    l.id AS list_id, l.name AS list_name, l.test_plan_id,
    l.created_by, l.created_when, l.modified_by, l.modified_when"#;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    runtime: Handle,
    audit: Arc<dyn AuditSink>,
    max_chain_depth: usize,
}

impl PostgresStore {
    /// Connect to PostgreSQL. Must be called from within a tokio runtime,
    /// which row streams later use to drive queries.
    pub async fn new(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self {
            pool,
            runtime: Handle::current(),
            audit: Arc::new(LogAuditSink),
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
        })
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_max_chain_depth(mut self, max_chain_depth: usize) -> Self {
        self.max_chain_depth = max_chain_depth;
        self
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn notify(&self, touched: &BTreeSet<Id>) {
        for list_id in touched {
            self.audit.data_set_list_modified(list_id);
        }
    }

    async fn fetch_rows(&self, query: &RowQuery) -> Result<Vec<FlatRow>> {
        let direct_sql = format!(
            r#"
            SELECT {HEADER_SELECT},
                ds.id AS ds_id, ds.name AS ds_name, ds.ordering AS ds_ordering, ds.locked AS ds_locked,
                a.id AS attr_id, a.name AS attr_name, a.attribute_type, a.reference_list_id,
                a.ordering AS attr_ordering,
                lv.id AS lv_id, lv.text AS lv_text,
                p.id AS param_id, p.text AS param_text, p.list_value_id, p.data_set_ref_id
            FROM data_set_lists l
            JOIN visibility_areas va ON va.id = l.visibility_area_id
            LEFT JOIN data_sets ds ON ds.data_set_list_id = l.id
                AND ($2::uuid[] IS NULL OR ds.id = ANY($2))
            LEFT JOIN attributes a ON a.data_set_list_id = l.id
                AND ($3::uuid[] IS NULL OR a.id = ANY($3))
            LEFT JOIN list_values lv ON lv.attribute_id = a.id
            LEFT JOIN parameters p ON p.data_set_id = ds.id AND p.attribute_id = a.id AND p.path_id IS NULL
            WHERE l.id = $1
            ORDER BY ds.ordering NULLS FIRST, a.ordering NULLS FIRST, lv.text
            "#
        );
        let override_sql = format!(
            r#"
            SELECT {HEADER_SELECT},
                ds.id AS ds_id, ds.name AS ds_name, ds.ordering AS ds_ordering, ds.locked AS ds_locked,
                ap.id AS path_id, ap.chain, ap.target_attribute_id, t.data_set_list_id AS target_list_id,
                p.id AS param_id, p.text AS param_text, p.list_value_id, p.data_set_ref_id
            FROM attribute_paths ap
            JOIN data_sets ds ON ds.id = ap.data_set_id
            JOIN data_set_lists l ON l.id = ap.data_set_list_id
            JOIN visibility_areas va ON va.id = l.visibility_area_id
            JOIN attributes t ON t.id = ap.target_attribute_id
            JOIN parameters p ON p.path_id = ap.id
            WHERE ap.data_set_list_id = $1
                AND ($2::uuid[] IS NULL OR ds.id = ANY($2))
                AND ($3::uuid[] IS NULL OR ap.chain[1] = ANY($3))
            ORDER BY ds.ordering, ap.id
            "#
        );

        // Both halves of the stream must see the same snapshot
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .execute(&mut *tx)
            .await?;
        let direct = sqlx::query(&direct_sql)
            .bind(query.data_set_list_id)
            .bind(query.data_set_ids.clone())
            .bind(query.attribute_ids.clone())
            .fetch_all(&mut *tx)
            .await?;
        let overrides = sqlx::query(&override_sql)
            .bind(query.data_set_list_id)
            .bind(query.data_set_ids.clone())
            .bind(query.attribute_ids.clone())
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut rows = direct.iter().map(direct_row).collect::<Result<Vec<_>>>()?;
        for row in &overrides {
            rows.push(override_row(row)?);
        }
        // Stable: override rows land after the direct rows of their data set
        rows.sort_by_key(FlatRow::sort_key);
        Ok(rows)
    }
}

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("max_chain_depth", &self.max_chain_depth)
            .finish()
    }
}

fn header(row: &PgRow) -> Result<FlatRow> {
    Ok(FlatRow {
        visibility_area_id: row.try_get("area_id")?,
        visibility_area_name: row.try_get("area_name")?,
        data_set_list_id: row.try_get("list_id")?,
        data_set_list_name: row.try_get("list_name")?,
        test_plan_id: row.try_get("test_plan_id")?,
        created_by: row.try_get("created_by")?,
        created_when: row.try_get("created_when")?,
        modified_by: row.try_get("modified_by")?,
        modified_when: row.try_get("modified_when")?,
        data_set: data_set_columns(row)?,
        attribute: None,
        list_value: None,
        path: None,
        parameter: parameter_columns(row)?,
    })
}

fn data_set_columns(row: &PgRow) -> Result<Option<DataSetColumns>> {
    let Some(id) = row.try_get::<Option<Id>, _>("ds_id")? else {
        return Ok(None);
    };
    Ok(Some(DataSetColumns {
        id,
        name: row.try_get("ds_name")?,
        ordering: row.try_get("ds_ordering")?,
        locked: row.try_get("ds_locked")?,
    }))
}

fn parameter_columns(row: &PgRow) -> Result<Option<ParameterColumns>> {
    let Some(id) = row.try_get::<Option<Id>, _>("param_id")? else {
        return Ok(None);
    };
    Ok(Some(ParameterColumns {
        id,
        text: row.try_get("param_text")?,
        list_value_id: row.try_get("list_value_id")?,
        data_set_ref_id: row.try_get("data_set_ref_id")?,
    }))
}

fn direct_row(row: &PgRow) -> Result<FlatRow> {
    let mut flat = header(row)?;
    if let Some(id) = row.try_get::<Option<Id>, _>("attr_id")? {
        flat.attribute = Some(AttributeColumns {
            id,
            name: row.try_get("attr_name")?,
            attribute_type: row.try_get("attribute_type")?,
            reference_list_id: row.try_get("reference_list_id")?,
            ordering: row.try_get("attr_ordering")?,
        });
    }
    if let Some(id) = row.try_get::<Option<Id>, _>("lv_id")? {
        flat.list_value = Some(ListValueColumns {
            id,
            text: row.try_get("lv_text")?,
        });
    }
    Ok(flat)
}

fn override_row(row: &PgRow) -> Result<FlatRow> {
    let mut flat = header(row)?;
    let chain = AttributeChain::new(row.try_get::<Vec<Id>, _>("chain")?);
    flat.path = Some(PathColumns {
        id: row.try_get("path_id")?,
        chain_key: chain.to_string(),
        target_attribute_id: row.try_get("target_attribute_id")?,
        target_list_id: row.try_get("target_list_id")?,
    });
    Ok(flat)
}

fn area_record(row: &PgRow) -> Result<VisibilityAreaRecord> {
    Ok(VisibilityAreaRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
    })
}

fn list_record(row: &PgRow) -> Result<DataSetListRecord> {
    Ok(DataSetListRecord {
        id: row.try_get("id")?,
        visibility_area_id: row.try_get("visibility_area_id")?,
        name: row.try_get("name")?,
        test_plan_id: row.try_get("test_plan_id")?,
        audit: AuditInfo {
            created_by: row.try_get("created_by")?,
            created_when: row.try_get("created_when")?,
            modified_by: row.try_get("modified_by")?,
            modified_when: row.try_get("modified_when")?,
        },
    })
}

fn attribute_record(row: &PgRow) -> Result<AttributeRecord> {
    let attribute_type: String = row.try_get("attribute_type")?;
    Ok(AttributeRecord {
        id: row.try_get("id")?,
        data_set_list_id: row.try_get("data_set_list_id")?,
        name: row.try_get("name")?,
        ordering: row.try_get("ordering")?,
        attribute_type: attribute_type.parse()?,
        reference_list_id: row.try_get("reference_list_id")?,
    })
}

fn list_value_record(row: &PgRow) -> Result<ListValueRecord> {
    Ok(ListValueRecord {
        id: row.try_get("id")?,
        attribute_id: row.try_get("attribute_id")?,
        text: row.try_get("text")?,
    })
}

fn data_set_record(row: &PgRow) -> Result<DataSetRecord> {
    Ok(DataSetRecord {
        id: row.try_get("id")?,
        data_set_list_id: row.try_get("data_set_list_id")?,
        name: row.try_get("name")?,
        ordering: row.try_get("ordering")?,
        locked: row.try_get("locked")?,
    })
}

fn parameter_record(row: &PgRow) -> Result<ParameterRecord> {
    Ok(ParameterRecord {
        id: row.try_get("id")?,
        data_set_id: row.try_get("data_set_id")?,
        attribute_id: row.try_get("attribute_id")?,
        path_id: row.try_get("path_id")?,
        text: row.try_get("text")?,
        list_value_id: row.try_get("list_value_id")?,
        data_set_ref_id: row.try_get("data_set_ref_id")?,
    })
}

fn path_record(row: &PgRow) -> Result<AttributePathRecord> {
    Ok(AttributePathRecord {
        id: row.try_get("id")?,
        data_set_list_id: row.try_get("data_set_list_id")?,
        data_set_id: row.try_get("data_set_id")?,
        target_attribute_id: row.try_get("target_attribute_id")?,
        chain: AttributeChain::new(row.try_get::<Vec<Id>, _>("chain")?),
    })
}

async fn fetch_attribute(conn: &mut PgConnection, id: &Id) -> Result<Option<AttributeRecord>> {
    sqlx::query(&format!("SELECT {ATTRIBUTE_COLUMNS} FROM attributes WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .as_ref()
        .map(attribute_record)
        .transpose()
}

async fn fetch_data_set(conn: &mut PgConnection, id: &Id) -> Result<Option<DataSetRecord>> {
    sqlx::query(&format!("SELECT {DATA_SET_COLUMNS} FROM data_sets WHERE id = $1"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .as_ref()
        .map(data_set_record)
        .transpose()
}

async fn writable_data_set(conn: &mut PgConnection, id: &Id) -> Result<DataSetRecord> {
    let data_set = fetch_data_set(conn, id)
        .await?
        .ok_or(DataSetError::not_found(EntityKind::DataSet, *id))?;
    if data_set.locked {
        return Err(DataSetError::RowLocked(*id));
    }
    Ok(data_set)
}

/// Validate `input` against `attribute`, loading whatever it points at
async fn check_input(conn: &mut PgConnection, attribute: &AttributeRecord, input: &ParameterInput) -> Result<()> {
    let list_value = match input {
        ParameterInput::ListValue(id) => sqlx::query("SELECT id, attribute_id, text FROM list_values WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
            .as_ref()
            .map(list_value_record)
            .transpose()?,
        _ => None,
    };
    let data_set = match input {
        ParameterInput::DataSetRef(id) => fetch_data_set(conn, id).await?,
        _ => None,
    };
    check_payload(attribute, input, list_value.as_ref(), data_set.as_ref())
}

/// Insert or update the parameter identified by `existing`
async fn upsert_parameter(
    conn: &mut PgConnection,
    existing: Option<ParameterRecord>,
    data_set_id: Id,
    attribute_id: Id,
    path_id: Option<Id>,
    input: &ParameterInput,
) -> Result<ParameterRecord> {
    let record = match existing {
        Some(mut record) => {
            record.apply(input);
            record
        }
        None => ParameterRecord::new(data_set_id, attribute_id, path_id, input),
    };
    sqlx::query(
        r#"
        INSERT INTO parameters (id, data_set_id, attribute_id, path_id, text, list_value_id, data_set_ref_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE SET
            text = EXCLUDED.text,
            list_value_id = EXCLUDED.list_value_id,
            data_set_ref_id = EXCLUDED.data_set_ref_id
        "#,
    )
    .bind(record.id)
    .bind(record.data_set_id)
    .bind(record.attribute_id)
    .bind(record.path_id)
    .bind(&record.text)
    .bind(record.list_value_id)
    .bind(record.data_set_ref_id)
    .execute(conn)
    .await?;
    Ok(record)
}

async fn delete_attribute_cascade(conn: &mut PgConnection, id: &Id, touched: &mut BTreeSet<Id>) -> Result<()> {
    // Paths through the attribute are not reachable by foreign keys
    let lists = sqlx::query(
        "DELETE FROM attribute_paths WHERE target_attribute_id = $1 OR $1 = ANY(chain) RETURNING data_set_list_id",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    for row in &lists {
        touched.insert(row.try_get("data_set_list_id")?);
    }
    if let Some(row) = sqlx::query("DELETE FROM attributes WHERE id = $1 RETURNING data_set_list_id")
        .bind(id)
        .fetch_optional(conn)
        .await?
    {
        touched.insert(row.try_get("data_set_list_id")?);
    }
    Ok(())
}

/// Override paths anchored by parameters whose `column` holds `id`; they are
/// orphaned once a cascade removes those parameters.
async fn anchored_paths(conn: &mut PgConnection, column: &'static str, id: &Id) -> Result<Vec<Id>> {
    let rows = sqlx::query(&format!(
        "SELECT path_id FROM parameters WHERE {column} = $1 AND path_id IS NOT NULL"
    ))
    .bind(id)
    .fetch_all(conn)
    .await?;
    let mut path_ids = Vec::with_capacity(rows.len());
    for row in &rows {
        path_ids.push(row.try_get("path_id")?);
    }
    Ok(path_ids)
}

async fn delete_unanchored_paths(conn: &mut PgConnection, path_ids: &[Id], touched: &mut BTreeSet<Id>) -> Result<()> {
    if path_ids.is_empty() {
        return Ok(());
    }
    let lists = sqlx::query(
        r#"
        DELETE FROM attribute_paths ap
        WHERE ap.id = ANY($1)
          AND NOT EXISTS (SELECT 1 FROM parameters p WHERE p.path_id = ap.id)
        RETURNING ap.data_set_list_id
        "#,
    )
    .bind(path_ids)
    .fetch_all(conn)
    .await?;
    for row in &lists {
        touched.insert(row.try_get("data_set_list_id")?);
    }
    Ok(())
}

impl RowSource for PostgresStore {
    /// Blocks on the captured runtime; call from a blocking context such as
    /// `tokio::task::spawn_blocking`.
    fn open(&self, query: &RowQuery) -> Result<RowStream> {
        let rows = self.runtime.block_on(self.fetch_rows(query))?;
        log::debug!("postgres row stream for {}: {} rows", query.data_set_list_id, rows.len());
        Ok(RowStream::from_rows(rows))
    }
}

#[async_trait::async_trait]
impl VisibilityAreaStore for PostgresStore {
    async fn get_visibility_area(&self, id: &Id) -> Result<Option<VisibilityAreaRecord>> {
        sqlx::query("SELECT id, name FROM visibility_areas WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(area_record)
            .transpose()
    }

    async fn create_visibility_area(&self, name: &str) -> Result<VisibilityAreaRecord> {
        let area = VisibilityAreaRecord {
            id: generate_id(),
            name: name.to_string(),
        };
        sqlx::query("INSERT INTO visibility_areas (id, name) VALUES ($1, $2)")
            .bind(area.id)
            .bind(&area.name)
            .execute(&self.pool)
            .await?;
        Ok(area)
    }

    async fn delete_visibility_area(&self, id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let lists = sqlx::query("SELECT id FROM data_set_lists WHERE visibility_area_id = $1")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;
        let mut touched = BTreeSet::new();
        for row in &lists {
            let list_id: Id = row.try_get("id")?;
            delete_list_cascade(&mut tx, &list_id, &mut touched).await?;
        }
        let result = sqlx::query("DELETE FROM visibility_areas WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.notify(&touched);
        Ok(result.rows_affected() > 0)
    }
}

/// Foreign keys take owned rows, parameters and paths; attributes of other
/// lists that referenced this one go first so their paths are cleaned too.
async fn delete_list_cascade(conn: &mut PgConnection, id: &Id, touched: &mut BTreeSet<Id>) -> Result<bool> {
    let referencing = sqlx::query("SELECT id FROM attributes WHERE reference_list_id = $1 OR data_set_list_id = $1")
        .bind(id)
        .fetch_all(&mut *conn)
        .await?;
    for row in &referencing {
        let attribute_id: Id = row.try_get("id")?;
        delete_attribute_cascade(conn, &attribute_id, touched).await?;
    }
    let result = sqlx::query("DELETE FROM data_set_lists WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    touched.insert(*id);
    Ok(result.rows_affected() > 0)
}

#[async_trait::async_trait]
impl DataSetListStore for PostgresStore {
    async fn get_data_set_list(&self, id: &Id) -> Result<Option<DataSetListRecord>> {
        sqlx::query(&format!("SELECT {LIST_COLUMNS} FROM data_set_lists WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(list_record)
            .transpose()
    }

    async fn list_data_set_lists(&self, visibility_area_id: &Id) -> Result<Vec<DataSetListRecord>> {
        sqlx::query(&format!(
            "SELECT {LIST_COLUMNS} FROM data_set_lists WHERE visibility_area_id = $1 ORDER BY name"
        ))
        .bind(visibility_area_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(list_record)
        .collect()
    }

    async fn create_data_set_list(
        &self,
        visibility_area_id: &Id,
        name: &str,
        test_plan_id: Option<Id>,
        user: Option<String>,
    ) -> Result<DataSetListRecord> {
        let mut tx = self.pool.begin().await?;
        let area_exists: bool = sqlx::query("SELECT EXISTS(SELECT 1 FROM visibility_areas WHERE id = $1)")
            .bind(visibility_area_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if !area_exists {
            return Err(DataSetError::not_found(EntityKind::VisibilityArea, *visibility_area_id));
        }
        let taken: bool =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM data_set_lists WHERE visibility_area_id = $1 AND name = $2)")
                .bind(visibility_area_id)
                .bind(name)
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?;
        if taken {
            return Err(DataSetError::DuplicateName {
                kind: EntityKind::DataSetList,
                name: name.to_string(),
            });
        }

        let list = DataSetListRecord {
            id: generate_id(),
            visibility_area_id: *visibility_area_id,
            name: name.to_string(),
            test_plan_id,
            audit: AuditInfo::created(user),
        };
        sqlx::query(&format!(
            "INSERT INTO data_set_lists ({LIST_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(list.id)
        .bind(list.visibility_area_id)
        .bind(&list.name)
        .bind(list.test_plan_id)
        .bind(&list.audit.created_by)
        .bind(list.audit.created_when)
        .bind(&list.audit.modified_by)
        .bind(list.audit.modified_when)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.audit.data_set_list_modified(&list.id);
        Ok(list)
    }

    async fn rename_data_set_list(&self, id: &Id, name: &str, user: Option<String>) -> Result<DataSetListRecord> {
        let mut tx = self.pool.begin().await?;
        let mut list = sqlx::query(&format!("SELECT {LIST_COLUMNS} FROM data_set_lists WHERE id = $1 FOR UPDATE"))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(list_record)
            .transpose()?
            .ok_or(DataSetError::not_found(EntityKind::DataSetList, *id))?;
        let taken: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM data_set_lists WHERE visibility_area_id = $1 AND name = $2 AND id <> $3)",
        )
        .bind(list.visibility_area_id)
        .bind(name)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?
        .try_get(0)?;
        if taken {
            return Err(DataSetError::DuplicateName {
                kind: EntityKind::DataSetList,
                name: name.to_string(),
            });
        }

        list.name = name.to_string();
        list.audit.touch(user);
        sqlx::query("UPDATE data_set_lists SET name = $2, modified_by = $3, modified_when = $4 WHERE id = $1")
            .bind(id)
            .bind(&list.name)
            .bind(&list.audit.modified_by)
            .bind(list.audit.modified_when)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.audit.data_set_list_modified(id);
        Ok(list)
    }

    async fn delete_data_set_list(&self, id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let mut touched = BTreeSet::new();
        let deleted = delete_list_cascade(&mut tx, id, &mut touched).await?;
        tx.commit().await?;
        if deleted {
            self.notify(&touched);
        }
        Ok(deleted)
    }
}

#[async_trait::async_trait]
impl AttributeStore for PostgresStore {
    async fn get_attribute(&self, id: &Id) -> Result<Option<AttributeRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_attribute(&mut conn, id).await
    }

    async fn list_attributes(&self, data_set_list_id: &Id) -> Result<Vec<AttributeRecord>> {
        sqlx::query(&format!(
            "SELECT {ATTRIBUTE_COLUMNS} FROM attributes WHERE data_set_list_id = $1 ORDER BY ordering, id"
        ))
        .bind(data_set_list_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(attribute_record)
        .collect()
    }

    async fn list_values(&self, attribute_id: &Id) -> Result<Vec<ListValueRecord>> {
        sqlx::query("SELECT id, attribute_id, text FROM list_values WHERE attribute_id = $1 ORDER BY text")
            .bind(attribute_id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(list_value_record)
            .collect()
    }

    async fn create_attribute(&self, data_set_list_id: &Id, attribute: NewAttribute) -> Result<AttributeRecord> {
        let mut tx = self.pool.begin().await?;
        let list_exists: bool = sqlx::query("SELECT EXISTS(SELECT 1 FROM data_set_lists WHERE id = $1)")
            .bind(data_set_list_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if !list_exists {
            return Err(DataSetError::not_found(EntityKind::DataSetList, *data_set_list_id));
        }
        let reference_exists: bool = match attribute.reference_list_id {
            Some(list_id) => sqlx::query("SELECT EXISTS(SELECT 1 FROM data_set_lists WHERE id = $1)")
                .bind(list_id)
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?,
            None => false,
        };
        check_new_attribute(&attribute, reference_exists)?;

        let taken: bool =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM attributes WHERE data_set_list_id = $1 AND name = $2)")
                .bind(data_set_list_id)
                .bind(&attribute.name)
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?;
        if taken {
            return Err(DataSetError::DuplicateName {
                kind: EntityKind::Attribute,
                name: attribute.name,
            });
        }
        let ordering: i32 =
            sqlx::query("SELECT COALESCE(MAX(ordering) + 1, 0) FROM attributes WHERE data_set_list_id = $1")
                .bind(data_set_list_id)
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?;

        let record = AttributeRecord {
            id: generate_id(),
            data_set_list_id: *data_set_list_id,
            name: attribute.name.clone(),
            ordering,
            attribute_type: attribute.attribute_type,
            reference_list_id: attribute.reference_list_id,
        };
        sqlx::query(&format!("INSERT INTO attributes ({ATTRIBUTE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6)"))
            .bind(record.id)
            .bind(record.data_set_list_id)
            .bind(&record.name)
            .bind(record.ordering)
            .bind(record.attribute_type.as_str())
            .bind(record.reference_list_id)
            .execute(&mut *tx)
            .await?;
        for text in &attribute.list_values {
            sqlx::query("INSERT INTO list_values (id, attribute_id, text) VALUES ($1, $2, $3)")
                .bind(generate_id())
                .bind(record.id)
                .bind(text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.audit.data_set_list_modified(data_set_list_id);
        Ok(record)
    }

    async fn add_list_value(&self, attribute_id: &Id, text: &str) -> Result<ListValueRecord> {
        let mut tx = self.pool.begin().await?;
        let attribute = fetch_attribute(&mut tx, attribute_id)
            .await?
            .ok_or(DataSetError::not_found(EntityKind::Attribute, *attribute_id))?;
        if attribute.attribute_type != crate::model::AttributeType::List {
            return Err(DataSetError::InvalidAttribute(format!(
                "'{}' is not a LIST attribute",
                attribute.name
            )));
        }
        let taken: bool = sqlx::query("SELECT EXISTS(SELECT 1 FROM list_values WHERE attribute_id = $1 AND text = $2)")
            .bind(attribute_id)
            .bind(text)
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if taken {
            return Err(DataSetError::DuplicateName {
                kind: EntityKind::ListValue,
                name: text.to_string(),
            });
        }

        let value = ListValueRecord {
            id: generate_id(),
            attribute_id: *attribute_id,
            text: text.to_string(),
        };
        sqlx::query("INSERT INTO list_values (id, attribute_id, text) VALUES ($1, $2, $3)")
            .bind(value.id)
            .bind(value.attribute_id)
            .bind(&value.text)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.audit.data_set_list_modified(&attribute.data_set_list_id);
        Ok(value)
    }

    async fn delete_list_value(&self, id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let anchored = anchored_paths(&mut tx, "list_value_id", id).await?;
        let row = sqlx::query(
            r#"
            DELETE FROM list_values lv USING attributes a
            WHERE lv.id = $1 AND a.id = lv.attribute_id
            RETURNING a.data_set_list_id
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut touched = BTreeSet::new();
        touched.insert(row.try_get("data_set_list_id")?);
        delete_unanchored_paths(&mut tx, &anchored, &mut touched).await?;
        tx.commit().await?;
        self.notify(&touched);
        Ok(true)
    }

    async fn delete_attribute(&self, id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let exists = fetch_attribute(&mut tx, id).await?.is_some();
        if !exists {
            return Ok(false);
        }
        let mut touched = BTreeSet::new();
        delete_attribute_cascade(&mut tx, id, &mut touched).await?;
        tx.commit().await?;
        self.notify(&touched);
        Ok(true)
    }
}

#[async_trait::async_trait]
impl DataSetStore for PostgresStore {
    async fn get_data_set(&self, id: &Id) -> Result<Option<DataSetRecord>> {
        let mut conn = self.pool.acquire().await?;
        fetch_data_set(&mut conn, id).await
    }

    async fn list_data_sets(&self, data_set_list_id: &Id) -> Result<Vec<DataSetRecord>> {
        sqlx::query(&format!(
            "SELECT {DATA_SET_COLUMNS} FROM data_sets WHERE data_set_list_id = $1 ORDER BY ordering, id"
        ))
        .bind(data_set_list_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(data_set_record)
        .collect()
    }

    async fn create_data_set(&self, data_set_list_id: &Id, name: &str) -> Result<DataSetRecord> {
        let mut tx = self.pool.begin().await?;
        let list_exists: bool = sqlx::query("SELECT EXISTS(SELECT 1 FROM data_set_lists WHERE id = $1)")
            .bind(data_set_list_id)
            .fetch_one(&mut *tx)
            .await?
            .try_get(0)?;
        if !list_exists {
            return Err(DataSetError::not_found(EntityKind::DataSetList, *data_set_list_id));
        }
        let taken: bool =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM data_sets WHERE data_set_list_id = $1 AND name = $2)")
                .bind(data_set_list_id)
                .bind(name)
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?;
        if taken {
            return Err(DataSetError::DuplicateName {
                kind: EntityKind::DataSet,
                name: name.to_string(),
            });
        }
        let ordering: i32 =
            sqlx::query("SELECT COALESCE(MAX(ordering) + 1, 0) FROM data_sets WHERE data_set_list_id = $1")
                .bind(data_set_list_id)
                .fetch_one(&mut *tx)
                .await?
                .try_get(0)?;

        let record = DataSetRecord {
            id: generate_id(),
            data_set_list_id: *data_set_list_id,
            name: name.to_string(),
            ordering,
            locked: false,
        };
        sqlx::query(&format!("INSERT INTO data_sets ({DATA_SET_COLUMNS}) VALUES ($1, $2, $3, $4, $5)"))
            .bind(record.id)
            .bind(record.data_set_list_id)
            .bind(&record.name)
            .bind(record.ordering)
            .bind(record.locked)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.audit.data_set_list_modified(data_set_list_id);
        Ok(record)
    }

    async fn set_data_set_locked(&self, id: &Id, locked: bool) -> Result<DataSetRecord> {
        let record = sqlx::query(&format!(
            "UPDATE data_sets SET locked = $2 WHERE id = $1 RETURNING {DATA_SET_COLUMNS}"
        ))
        .bind(id)
        .bind(locked)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(data_set_record)
        .transpose()?
        .ok_or(DataSetError::not_found(EntityKind::DataSet, *id))?;
        self.audit.data_set_list_modified(&record.data_set_list_id);
        Ok(record)
    }

    async fn delete_data_set(&self, id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        // Rows whose references are about to be cleared by the cascade
        let referencing = sqlx::query(
            r#"
            SELECT DISTINCT ds.data_set_list_id
            FROM parameters p JOIN data_sets ds ON ds.id = p.data_set_id
            WHERE p.data_set_ref_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let anchored = anchored_paths(&mut tx, "data_set_ref_id", id).await?;
        let deleted = sqlx::query("DELETE FROM data_sets WHERE id = $1 RETURNING data_set_list_id")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(deleted) = deleted else {
            return Ok(false);
        };

        let mut touched = BTreeSet::new();
        touched.insert(deleted.try_get("data_set_list_id")?);
        for row in &referencing {
            touched.insert(row.try_get("data_set_list_id")?);
        }
        delete_unanchored_paths(&mut tx, &anchored, &mut touched).await?;
        tx.commit().await?;
        self.notify(&touched);
        Ok(true)
    }
}

#[async_trait::async_trait]
impl ParameterStore for PostgresStore {
    async fn get_parameter(&self, data_set_id: &Id, attribute_id: &Id) -> Result<Option<ParameterRecord>> {
        sqlx::query(&format!(
            "SELECT {PARAMETER_COLUMNS} FROM parameters WHERE data_set_id = $1 AND attribute_id = $2 AND path_id IS NULL"
        ))
        .bind(data_set_id)
        .bind(attribute_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(parameter_record)
        .transpose()
    }

    async fn set_parameter(
        &self,
        data_set_id: &Id,
        attribute_id: &Id,
        input: ParameterInput,
    ) -> Result<ParameterRecord> {
        let mut tx = self.pool.begin().await?;
        let data_set = writable_data_set(&mut tx, data_set_id).await?;
        let attribute = fetch_attribute(&mut tx, attribute_id)
            .await?
            .ok_or(DataSetError::not_found(EntityKind::Attribute, *attribute_id))?;
        if attribute.data_set_list_id != data_set.data_set_list_id {
            return Err(DataSetError::InvalidAttribute(format!(
                "attribute '{}' does not belong to the data set's list",
                attribute.name
            )));
        }
        check_input(&mut tx, &attribute, &input).await?;

        let existing = sqlx::query(&format!(
            "SELECT {PARAMETER_COLUMNS} FROM parameters WHERE data_set_id = $1 AND attribute_id = $2 AND path_id IS NULL"
        ))
        .bind(data_set_id)
        .bind(attribute_id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(parameter_record)
        .transpose()?;
        let record = upsert_parameter(&mut tx, existing, *data_set_id, *attribute_id, None, &input).await?;
        tx.commit().await?;
        self.audit.data_set_list_modified(&data_set.data_set_list_id);
        Ok(record)
    }

    async fn clear_parameter(&self, data_set_id: &Id, attribute_id: &Id) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let data_set = writable_data_set(&mut tx, data_set_id).await?;
        let result =
            sqlx::query("DELETE FROM parameters WHERE data_set_id = $1 AND attribute_id = $2 AND path_id IS NULL")
                .bind(data_set_id)
                .bind(attribute_id)
                .execute(&mut *tx)
                .await?;
        tx.commit().await?;
        let cleared = result.rows_affected() > 0;
        if cleared {
            self.audit.data_set_list_modified(&data_set.data_set_list_id);
        }
        Ok(cleared)
    }

    async fn get_override_path(
        &self,
        data_set_id: &Id,
        target_attribute_id: &Id,
        chain: &[Id],
    ) -> Result<Option<AttributePathRecord>> {
        let mut conn = self.pool.acquire().await?;
        let Some(data_set) = fetch_data_set(&mut conn, data_set_id).await? else {
            return Ok(None);
        };
        let path_id = generate_path_id(&data_set.data_set_list_id, data_set_id, target_attribute_id, chain);
        sqlx::query(&format!("SELECT {PATH_COLUMNS} FROM attribute_paths WHERE id = $1"))
            .bind(path_id)
            .fetch_optional(&mut *conn)
            .await?
            .as_ref()
            .map(path_record)
            .transpose()
    }

    async fn list_paths(&self, data_set_id: &Id) -> Result<Vec<AttributePathRecord>> {
        sqlx::query(&format!(
            "SELECT {PATH_COLUMNS} FROM attribute_paths WHERE data_set_id = $1 ORDER BY cardinality(chain), id"
        ))
        .bind(data_set_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(path_record)
        .collect()
    }

    async fn set_override(
        &self,
        data_set_id: &Id,
        target_attribute_id: &Id,
        chain: &[Id],
        input: ParameterInput,
    ) -> Result<ParameterRecord> {
        let mut tx = self.pool.begin().await?;
        let data_set = writable_data_set(&mut tx, data_set_id).await?;

        let mut wanted: Vec<Id> = chain.to_vec();
        wanted.push(*target_attribute_id);
        let attributes: HashMap<Id, AttributeRecord> =
            sqlx::query(&format!("SELECT {ATTRIBUTE_COLUMNS} FROM attributes WHERE id = ANY($1)"))
                .bind(&wanted)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|row| attribute_record(row).map(|record| (record.id, record)))
                .collect::<Result<_>>()?;
        let target = check_chain(
            data_set.data_set_list_id,
            chain,
            target_attribute_id,
            &attributes,
            self.max_chain_depth,
        )?;
        check_input(&mut tx, target, &input).await?;

        let path_id = generate_path_id(&data_set.data_set_list_id, data_set_id, target_attribute_id, chain);
        sqlx::query(&format!(
            "INSERT INTO attribute_paths ({PATH_COLUMNS}) VALUES ($1, $2, $3, $4, $5) ON CONFLICT (id) DO NOTHING"
        ))
        .bind(path_id)
        .bind(data_set.data_set_list_id)
        .bind(data_set_id)
        .bind(target_attribute_id)
        .bind(chain)
        .execute(&mut *tx)
        .await?;

        let existing = sqlx::query(&format!("SELECT {PARAMETER_COLUMNS} FROM parameters WHERE path_id = $1"))
            .bind(path_id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(parameter_record)
            .transpose()?;
        let record =
            upsert_parameter(&mut tx, existing, *data_set_id, *target_attribute_id, Some(path_id), &input).await?;
        tx.commit().await?;
        self.audit.data_set_list_modified(&data_set.data_set_list_id);
        Ok(record)
    }

    async fn clear_override(&self, data_set_id: &Id, target_attribute_id: &Id, chain: &[Id]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let data_set = writable_data_set(&mut tx, data_set_id).await?;
        let path_id = generate_path_id(&data_set.data_set_list_id, data_set_id, target_attribute_id, chain);
        // Parameters on the path go with it
        let result = sqlx::query("DELETE FROM attribute_paths WHERE id = $1")
            .bind(path_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        let cleared = result.rows_affected() > 0;
        if cleared {
            self.audit.data_set_list_modified(&data_set.data_set_list_id);
        }
        Ok(cleared)
    }
}
