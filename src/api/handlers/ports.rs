use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::api::{state::AppState, types::*};
use crate::services::validate_protocol;

/// GET /api/servers/:server_id/ports/available?start=&end=&protocol=
pub async fn get_available_ports(
    State(state): State<AppState>,
    Path(server_id): Path<i64>,
    Query(query): Query<AvailablePortsQuery>,
) -> ApiResult<AvailablePortsResponse> {
    let protocol = validate_protocol(&query.protocol)?;
    let ports = state
        .handler
        .port_allocator()
        .get_available_ports_in_range(server_id, query.start, query.end, protocol)
        .await?;

    Ok(Json(AvailablePortsResponse {
        server_id,
        protocol,
        ports,
    }))
}
