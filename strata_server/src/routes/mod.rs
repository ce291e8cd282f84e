pub mod db;
pub mod health;
pub mod storage;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new().merge(db::router()).merge(storage::router())
}
