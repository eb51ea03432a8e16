//! Read-only HTTP routes over a [`MonitoringApi`].
//!
//! Register the façade as `web::Data<dyn MonitoringApi>`, e.g.
//! `Data::from(store.monitoring_api())`.

use actix_web::{get, web, Scope};
use serde::Deserialize;

use crate::{
    error::Error,
    message::{MessageKind, MessageRecord},
    monitoring::{HourlyCount, MessageQuery, MonitoringApi, PagedMessages, Statistics},
    status::StatusName,
};

#[derive(Debug, Default, Deserialize)]
pub struct MessagesParams {
    status: Option<String>,
    name: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TimelineParams {
    status: String,
}

#[get("/stats")]
async fn stats(api: web::Data<dyn MonitoringApi>) -> Result<web::Json<Statistics>, Error> {
    Ok(web::Json(api.statistics().await?))
}

#[get("/{kind}/messages")]
async fn list_messages(
    api: web::Data<dyn MonitoringApi>,
    path: web::Path<String>,
    params: web::Query<MessagesParams>,
) -> Result<web::Json<PagedMessages>, Error> {
    let params = params.into_inner();

    let status = params
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(StatusName::parse)
        .transpose()?;

    let query = MessageQuery::builder()
        .kind(MessageKind::parse(&path)?)
        .maybe_status(status)
        .maybe_name(params.name.filter(|n| !n.is_empty()))
        .maybe_page(params.page)
        .maybe_page_size(params.page_size)
        .build();

    Ok(web::Json(api.messages(&query).await?))
}

#[get("/{kind}/messages/{id}")]
async fn get_message(
    api: web::Data<dyn MonitoringApi>,
    path: web::Path<(String, i64)>,
) -> Result<web::Json<MessageRecord>, Error> {
    let (kind, id) = path.into_inner();

    Ok(web::Json(api.message(MessageKind::parse(&kind)?, id).await?))
}

#[get("/{kind}/timeline")]
async fn timeline(
    api: web::Data<dyn MonitoringApi>,
    path: web::Path<String>,
    params: web::Query<TimelineParams>,
) -> Result<web::Json<Vec<HourlyCount>>, Error> {
    let kind = MessageKind::parse(&path)?;
    let status = StatusName::parse(&params.status)?;

    Ok(web::Json(api.hourly_counts(kind, status).await?))
}

pub fn service() -> Scope {
    web::scope("/monitoring")
        .service(stats)
        .service(list_messages)
        .service(get_message)
        .service(timeline)
}
