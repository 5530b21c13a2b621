//! HTTP request handlers for the control plane.

use axum::{
    body::Body,
    extract::{Form, Path, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    Json,
};
use tokio_util::io::ReaderStream;
use url::form_urlencoded;

use crate::{pull::ProgressSnapshot, session, utils::resolve_download_path};

use super::{
    state::ServerState,
    types::{IndexQuery, QueueActionForm, QueueAddForm},
};

//-------------------------------------------------------------------------------------------------
// Functions: Handlers
//-------------------------------------------------------------------------------------------------

/// Handler for `GET /`.
///
/// Emits a minimal status page: queued tasks, discovered sessions, and
/// finished archives. Full page rendering is a templating concern outside
/// this crate.
pub async fn index_handler(
    State(state): State<ServerState>,
    Query(query): Query<IndexQuery>,
) -> Html<String> {
    let mut page = String::from("<!doctype html><html><body><h1>modelpack</h1>");

    if let Some(message) = query.message.as_deref() {
        page.push_str(&format!("<p><em>{}</em></p>", escape_html(message)));
    }

    page.push_str(
        "<form method=\"post\" action=\"/queue/add\">\
         <input name=\"model\" placeholder=\"owner/name:tag\">\
         <button type=\"submit\">Pull</button></form>",
    );

    page.push_str("<h2>Tasks</h2><ul>");
    for task in state.manager().list() {
        page.push_str(&format!(
            "<li>{} &mdash; {} ({}%) [{}] {}</li>",
            escape_html(&task.model),
            task.state.label(),
            task.progress.percent,
            escape_html(&task.id),
            escape_html(&task.message),
        ));
    }
    page.push_str("</ul>");

    let sessions = session::discover_partials(state.downloads_dir()).await;
    let (running, paused, errored) = session::categorize(sessions);
    if let Some(view) = running {
        page.push_str(&format!(
            "<h2>Running session</h2><p>{} ({})</p>",
            escape_html(&view.model),
            escape_html(&view.updated)
        ));
    }
    if !paused.is_empty() {
        page.push_str("<h2>Paused sessions</h2><ul>");
        for view in paused {
            page.push_str(&format!("<li>{}</li>", escape_html(&view.model)));
        }
        page.push_str("</ul>");
    }
    if !errored.is_empty() {
        page.push_str("<h2>Failed sessions</h2><ul>");
        for view in errored {
            page.push_str(&format!(
                "<li>{}: {}</li>",
                escape_html(&view.model),
                escape_html(&view.message)
            ));
        }
        page.push_str("</ul>");
    }

    page.push_str("<h2>Downloads</h2><ul>");
    for archive in session::completed_archives(state.downloads_dir()).await {
        page.push_str(&format!(
            "<li><a href=\"/download/{name}\">{name}</a></li>",
            name = escape_html(&archive.name)
        ));
    }
    page.push_str("</ul></body></html>");

    Html(page)
}

/// Handler for `POST /queue/add`.
pub async fn queue_add_handler(
    State(state): State<ServerState>,
    Form(form): Form<QueueAddForm>,
) -> Redirect {
    let model = form.model.trim();
    if model.is_empty() {
        return redirect_with_message("model name is required");
    }

    match state.manager().enqueue(model) {
        Ok(id) => redirect_with_message(&format!("queued {model} ({id})")),
        Err(err) => redirect_with_message(&err.to_string()),
    }
}

/// Handler for `POST /queue/action`.
pub async fn queue_action_handler(
    State(state): State<ServerState>,
    Form(form): Form<QueueActionForm>,
) -> Redirect {
    let manager = state.manager();
    let outcome = match form.action.as_str() {
        "pause" => manager.pause(&form.id).await,
        "resume" => manager.resume(&form.id),
        "cancel" => manager.cancel(&form.id).await,
        other => {
            return redirect_with_message(&format!("unknown action: {other}"));
        }
    };

    match outcome {
        Ok(()) => redirect_with_message(&format!("{} {}", form.action, form.id)),
        Err(err) => redirect_with_message(&err.to_string()),
    }
}

/// Handler for `GET /progress`: the active pull's byte counters as JSON.
pub async fn progress_handler(State(state): State<ServerState>) -> Json<ProgressSnapshot> {
    Json(state.manager().active_progress())
}

/// Handler for `GET /download/{name}`: streams a finished archive, rejecting
/// names that escape the downloads directory.
pub async fn file_download_handler(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> Response {
    let path = match resolve_download_path(state.downloads_dir(), &name) {
        Ok(path) => path,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid download name").into_response(),
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(_) => return (StatusCode::NOT_FOUND, "file not found").into_response(),
    };

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        )
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

//-------------------------------------------------------------------------------------------------
// Functions
//-------------------------------------------------------------------------------------------------

/// Redirects to the index with a URL-encoded status message (303 See Other).
fn redirect_with_message(message: &str) -> Redirect {
    let encoded: String = form_urlencoded::byte_serialize(message.as_bytes()).collect();
    Redirect::to(&format!("/?message={encoded}"))
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
