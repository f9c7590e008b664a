//! The client-facing stream route.

use std::time::Instant;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};

use fleet::debug::RequestRecord;

use crate::api::AppState;
use crate::stream::handler::{self, StreamQuery};

/// `GET /ace/getstream?id=...|infohash=...` — the whole request lifecycle
/// lives in the stream handler; this route only parses, delegates, and
/// records the request.
pub async fn getstream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let started = Instant::now();

    let (response, stream_key) = match handler::parse_stream_request(&query) {
        Ok(key) => {
            let printable = key.to_string();
            let response = match handler::serve_stream(&state, key).await {
                Ok(response) => response,
                Err(e) => e.into_response(),
            };
            (response, Some(printable))
        }
        Err(e) => (e.into_response(), None),
    };

    state.debug.request(RequestRecord {
        method: "GET".to_string(),
        path: "/ace/getstream".to_string(),
        duration_ms: started.elapsed().as_millis() as u64,
        status: response.status().as_u16(),
        stream_key,
    });
    response
}
