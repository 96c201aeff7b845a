use crate::api::views::{list_view, resolve_view, DataSetListView, ResolveView};
use crate::cache::{CacheMode, IdentityCache};
use crate::config::AppConfig;
use crate::error::DataSetError;
use crate::logic::{DataSetListGraph, GraphBuilder, ValueFormatter};
use crate::model::{AttributeChain, Id};
use crate::store::{MacroContext, ParameterInput, ParameterRecord, Store};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// Shared handler state. Graph builds without an explicit `cache` query
/// parameter go through `cache`, which is cleared on every mutation.
pub struct AppState<S> {
    pub store: Arc<S>,
    pub cache: Arc<IdentityCache>,
    pub formatter: ValueFormatter,
    pub config: Arc<AppConfig>,
}

impl<S> AppState<S> {
    pub fn new(store: Arc<S>, config: AppConfig) -> Self {
        Self {
            store,
            cache: Arc::new(IdentityCache::new(config.cache.mode)),
            formatter: ValueFormatter::default(),
            config: Arc::new(config),
        }
    }

    pub fn with_formatter(mut self, formatter: ValueFormatter) -> Self {
        self.formatter = formatter;
        self
    }
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            cache: self.cache.clone(),
            formatter: self.formatter.clone(),
            config: self.config.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    pub sorted: Option<bool>,
    pub cache: Option<CacheMode>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub list: Option<Id>,
    pub target: Id,
    /// Comma separated attribute ids
    pub chain: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub target_attribute_id: Id,
    pub chain: Vec<Id>,
    pub value: ParameterInput,
}

#[derive(Debug, Deserialize)]
pub struct ClearOverrideQuery {
    pub target: Id,
    pub chain: String,
}

#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub cleared: bool,
}

pub fn error_status(err: &DataSetError) -> StatusCode {
    match err {
        DataSetError::NotFound { .. } => StatusCode::NOT_FOUND,
        DataSetError::DuplicateName { .. } => StatusCode::CONFLICT,
        DataSetError::InvalidAttribute(_)
        | DataSetError::InvalidPath(_)
        | DataSetError::TypeMismatch(_)
        | DataSetError::ChainDepthExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        DataSetError::RowLocked(_) => StatusCode::LOCKED,
        DataSetError::InconsistentGraph(_)
        | DataSetError::UnreachableOverrideTarget { .. }
        | DataSetError::CacheContractViolation { .. }
        | DataSetError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: DataSetError) -> (StatusCode, Json<ErrorResponse>) {
    let status = error_status(&err);
    if status.is_server_error() {
        log::error!("request failed: {}", err);
    }
    (status, Json(ErrorResponse::new(&err.to_string())))
}

fn not_found(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new(message)))
}

/// `a,b,c` into attribute ids; empty input is the empty chain
fn parse_chain(raw: Option<&str>) -> Result<Vec<Id>, (StatusCode, Json<ErrorResponse>)> {
    let key = raw.unwrap_or_default().replace(',', "_");
    key.parse::<AttributeChain>()
        .map(AttributeChain::into_inner)
        .map_err(error_response)
}

/// Run a graph build off the async executor; row sources may block
async fn with_graph<S, T, F>(
    state: &AppState<S>,
    list_id: Id,
    mode: Option<CacheMode>,
    render: F,
) -> Result<Option<T>, (StatusCode, Json<ErrorResponse>)>
where
    S: Store + 'static,
    T: Send + 'static,
    F: FnOnce(&DataSetListGraph) -> crate::error::Result<T> + Send + 'static,
{
    let builder = GraphBuilder::new(state.store.clone());
    let builder = match mode {
        Some(mode) => builder.with_cache_mode(mode),
        None => builder.with_shared_cache(state.cache.clone()),
    };

    let built = tokio::task::spawn_blocking(move || match builder.build(&list_id)? {
        Some(graph) => render(&graph).map(Some),
        None => Ok(None),
    })
    .await
    .map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(&format!("graph build failed: {}", e))),
        )
    })?;
    built.map_err(error_response)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

pub async fn get_data_set_list_tree<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(list_id): Path<Id>,
    Query(query): Query<TreeQuery>,
) -> ApiResult<DataSetListView> {
    let sorted = query.sorted.unwrap_or(state.config.graph.sorted_view);
    let formatter = state.formatter.clone();

    match with_graph(&state, list_id, query.cache, move |graph| list_view(graph, &formatter, sorted)).await? {
        Some(view) => Ok(Json(view)),
        None => Err(not_found("Data set list not found")),
    }
}

pub async fn resolve_value<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(data_set_id): Path<Id>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<ResolveView> {
    let chain = parse_chain(query.chain.as_deref())?;
    let list_id = match query.list {
        Some(list_id) => list_id,
        None => match state.store.get_data_set(&data_set_id).await {
            Ok(Some(data_set)) => data_set.data_set_list_id,
            Ok(None) => return Err(not_found("Data set not found")),
            Err(e) => return Err(error_response(e)),
        },
    };
    let target_id = query.target;
    let formatter = state.formatter.clone();

    let rendered = with_graph(&state, list_id, None, move |graph| {
        let Some(resolved) = graph.resolve(&data_set_id, &target_id, &chain)? else {
            return Ok(None);
        };
        let Some(target) = graph.attribute(&target_id) else {
            return Err(DataSetError::not_found(crate::model::EntityKind::Attribute, target_id));
        };
        let context = MacroContext {
            data_set_list_id: list_id,
            data_set_id,
        };
        resolve_view(data_set_id, &target, &chain, &resolved, &formatter, &context).map(Some)
    })
    .await?;

    match rendered.flatten() {
        Some(view) => Ok(Json(view)),
        None => Err(not_found("Data set not found in data set list")),
    }
}

pub async fn put_override<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(data_set_id): Path<Id>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<ParameterRecord> {
    let record = state
        .store
        .set_override(&data_set_id, &request.target_attribute_id, &request.chain, request.value)
        .await
        .map_err(error_response)?;
    state.cache.clear();
    Ok(Json(record))
}

pub async fn delete_override<S: Store + 'static>(
    State(state): State<AppState<S>>,
    Path(data_set_id): Path<Id>,
    Query(query): Query<ClearOverrideQuery>,
) -> ApiResult<ClearedResponse> {
    let chain = parse_chain(Some(&query.chain))?;
    let cleared = state
        .store
        .clear_override(&data_set_id, &query.target, &chain)
        .await
        .map_err(error_response)?;
    state.cache.clear();
    Ok(Json(ClearedResponse { cleared }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_id;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&DataSetError::not_found(crate::model::EntityKind::DataSet, generate_id())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(error_status(&DataSetError::RowLocked(generate_id())), StatusCode::LOCKED);
        assert_eq!(
            error_status(&DataSetError::ChainDepthExceeded { depth: 16, max: 15 }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            error_status(&DataSetError::inconsistent("row of another list")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_parse_chain() {
        let (a, b) = (generate_id(), generate_id());
        assert_eq!(parse_chain(Some(&format!("{},{}", a, b))).unwrap(), vec![a, b]);
        assert!(parse_chain(None).unwrap().is_empty());
        assert!(parse_chain(Some("not-a-uuid")).is_err());
    }
}
