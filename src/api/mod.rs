// src/api/mod.rs

//! Transport-neutral status API.
//!
//! [`Router::handle`] maps an [`ApiRequest`] (method, path, caller identity,
//! JSON body) onto the [`Dispatcher`] and the artifact store and returns an
//! [`ApiResponse`] carrying an HTTP-style status code and a JSON body.
//! The stdio front-end lives in [`stdio`].
//!
//! | Method | Path                 | Success |
//! |--------|----------------------|---------|
//! | POST   | `/artifacts`         | 201     |
//! | GET    | `/artifacts`         | 200     |
//! | DELETE | `/artifacts/{hash}`  | 200     |
//! | POST   | `/jobs`              | 202     |
//! | GET    | `/jobs`              | 200     |
//! | GET    | `/jobs/{id}`         | 200     |
//! | POST   | `/jobs/{id}/cancel`  | 202     |
//!
//! Errors are `{"error": <code>, "message": <text>}`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::engine::{CancelOutcome, DispatchError, Dispatcher, Job, JobId};
use crate::launch::ValidationError;
use crate::store::{ContentHash, StoreError};

pub mod stdio;

/// One API call. `owner` is the authenticated caller.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub body: Value,
}

impl ApiRequest {
    pub fn new(method: &str, path: &str, owner: &str, body: Value) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            owner: owner.to_string(),
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub(crate) fn error(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "error": code, "message": message.into() }),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::error(404, "not_found", message)
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        Self::error(
            405,
            "method_not_allowed",
            format!("{method} is not allowed on {path}"),
        )
    }

    /// The `error` code of an error response, if this is one.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error").and_then(Value::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    filename: String,
    data: String,
    /// Optional digest the client expects the payload to hash to.
    #[serde(default)]
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchBody {
    artifact_hash: String,
    start_command: String,
}

/// Routes API requests to the engine.
#[derive(Debug, Clone)]
pub struct Router {
    dispatcher: Dispatcher,
}

impl Router {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Handle one request. Must run inside a Tokio runtime because
    /// `POST /jobs` spawns the job task.
    pub fn handle(&self, req: &ApiRequest) -> ApiResponse {
        let method = req.method.to_ascii_uppercase();
        let path = req.path.split('?').next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        debug!(method = %method, path = %path, owner = %req.owner, "api request");

        if req.owner.trim().is_empty() {
            return ApiResponse::error(401, "missing_owner", "request carries no owner identity");
        }

        let response = match (segments.as_slice(), method.as_str()) {
            (["artifacts"], "POST") => self.upload(req),
            (["artifacts"], "GET") => self.list_artifacts(&req.owner),
            (["artifacts"], _) => ApiResponse::method_not_allowed(&method, path),

            (["artifacts", hash], "DELETE") => self.delete_artifact(&req.owner, hash),
            (["artifacts", _], _) => ApiResponse::method_not_allowed(&method, path),

            (["jobs"], "POST") => self.launch(req),
            (["jobs"], "GET") => self.list_jobs(&req.owner),
            (["jobs"], _) => ApiResponse::method_not_allowed(&method, path),

            (["jobs", id], "GET") => self.job(&req.owner, id),
            (["jobs", _], _) => ApiResponse::method_not_allowed(&method, path),

            (["jobs", id, "cancel"], "POST") => self.cancel(&req.owner, id),
            (["jobs", _, "cancel"], _) => ApiResponse::method_not_allowed(&method, path),

            _ => ApiResponse::not_found(format!("no route for {path}")),
        };

        if response.status >= 500 {
            warn!(status = response.status, path = %path, body = %response.body, "api request failed");
        }
        response
    }

    fn upload(&self, req: &ApiRequest) -> ApiResponse {
        let body: UploadBody = match serde_json::from_value(req.body.clone()) {
            Ok(b) => b,
            Err(e) => return ApiResponse::error(400, "bad_request", format!("invalid upload body: {e}")),
        };
        if body.filename.trim().is_empty() {
            return ApiResponse::error(400, "bad_request", "filename must not be empty");
        }
        let bytes = match STANDARD.decode(body.data.as_bytes()) {
            Ok(b) => b,
            Err(e) => return ApiResponse::error(400, "bad_request", format!("data is not base64: {e}")),
        };

        let store = self.dispatcher.store();
        let stored = match body.hash.as_deref() {
            Some(expected) => match expected.parse::<ContentHash>() {
                Ok(expected) => store.put_verified(&expected, &req.owner, &body.filename, &bytes),
                Err(e) => return ApiResponse::error(400, "malformed_hash", e.to_string()),
            },
            None => store.put(&req.owner, &body.filename, &bytes),
        };

        match stored {
            Ok(artifact) => ApiResponse::ok(201, json!(artifact)),
            Err(e) => store_error(e),
        }
    }

    fn list_artifacts(&self, owner: &str) -> ApiResponse {
        match self.dispatcher.store().list_owned(owner) {
            Ok(mine) => ApiResponse::ok(200, json!({ "artifacts": mine })),
            Err(e) => store_error(e),
        }
    }

    /// Drop the caller's record for `hash`. Artifacts the caller never
    /// uploaded are reported as missing, like other owners' jobs.
    fn delete_artifact(&self, owner: &str, hash: &str) -> ApiResponse {
        let hash = match hash.parse::<ContentHash>() {
            Ok(h) => h,
            Err(e) => return ApiResponse::error(400, "malformed_hash", e.to_string()),
        };
        match self.dispatcher.store().delete(owner, &hash) {
            Ok(true) => ApiResponse::ok(200, json!({ "deleted": hash })),
            Ok(false) => ApiResponse::error(404, "unknown_artifact", format!("artifact not found: {hash}")),
            Err(e) => store_error(e),
        }
    }

    fn launch(&self, req: &ApiRequest) -> ApiResponse {
        let body: LaunchBody = match serde_json::from_value(req.body.clone()) {
            Ok(b) => b,
            Err(e) => return ApiResponse::error(400, "bad_request", format!("invalid launch body: {e}")),
        };
        match self
            .dispatcher
            .submit(&req.owner, &body.artifact_hash, &body.start_command)
        {
            Ok(id) => ApiResponse::ok(202, json!({ "jobId": id })),
            Err(e) => dispatch_error(e),
        }
    }

    fn list_jobs(&self, owner: &str) -> ApiResponse {
        let jobs = self.dispatcher.tracker().list(owner);
        ApiResponse::ok(200, json!({ "jobs": jobs }))
    }

    fn job(&self, owner: &str, id: &str) -> ApiResponse {
        match self.owned_job(owner, id) {
            Ok(job) => ApiResponse::ok(200, job_view(&job)),
            Err(resp) => resp,
        }
    }

    fn cancel(&self, owner: &str, id: &str) -> ApiResponse {
        let job = match self.owned_job(owner, id) {
            Ok(job) => job,
            Err(resp) => return resp,
        };
        match self.dispatcher.cancel(&job.id()) {
            Ok(outcome) => {
                let outcome = match outcome {
                    CancelOutcome::Requested => "requested",
                    CancelOutcome::AlreadyCancelled => "already_cancelled",
                };
                ApiResponse::ok(202, json!({ "jobId": job.id(), "cancel": outcome }))
            }
            Err(e) => dispatch_error(e),
        }
    }

    /// Look up a job the caller owns. Other owners' jobs are reported as
    /// missing.
    fn owned_job(&self, owner: &str, id: &str) -> Result<Job, ApiResponse> {
        let not_found = || ApiResponse::not_found(format!("job not found: {id}"));
        let id: JobId = id.parse().map_err(|_| not_found())?;
        match self.dispatcher.get(&id) {
            Some(job) if job.spec().owner() == owner => Ok(job),
            _ => Err(not_found()),
        }
    }
}

fn job_view(job: &Job) -> Value {
    let spec = job.spec();
    json!({
        "id": job.id(),
        "owner": spec.owner(),
        "artifact": spec.artifact(),
        "filename": spec.filename(),
        "startCommand": spec.start_command(),
        "state": job.state(),
        "reason": job.reason(),
        "environment": job.environment(),
        "createdAt": spec.created_at(),
        "history": job.history(),
    })
}

fn store_error(e: StoreError) -> ApiResponse {
    match e {
        StoreError::HashMismatch { .. } => ApiResponse::error(409, "hash_mismatch", e.to_string()),
        StoreError::NotFound(_) => ApiResponse::not_found(e.to_string()),
        StoreError::Io(_) | StoreError::Metadata { .. } => {
            ApiResponse::error(500, "storage_error", e.to_string())
        }
    }
}

fn dispatch_error(e: DispatchError) -> ApiResponse {
    match e {
        DispatchError::Validation(ValidationError::UnknownArtifact(_)) => {
            ApiResponse::error(404, "unknown_artifact", e.to_string())
        }
        DispatchError::Validation(ValidationError::Store(_)) => {
            ApiResponse::error(500, "storage_error", e.to_string())
        }
        DispatchError::Validation(_) => ApiResponse::error(400, "validation_failed", e.to_string()),
        DispatchError::JobNotFound(_) => ApiResponse::not_found(e.to_string()),
        DispatchError::AlreadyTerminal { .. } => {
            ApiResponse::error(409, "already_terminal", e.to_string())
        }
        DispatchError::Tracker(_) | DispatchError::Internal(_) => {
            ApiResponse::error(500, "internal_error", e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use base64::Engine as _;

    use super::*;
    use crate::engine::DispatchPolicy;
    use crate::provision::local::LocalProvider;
    use crate::store::{ArtifactStore, MemoryArtifactStore};
    use crate::tracker::StatusTracker;

    fn router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalProvider::new(dir.path(), 2));
        let dispatcher = Dispatcher::new(
            Arc::new(MemoryArtifactStore::new()),
            provider.clone(),
            provider,
            StatusTracker::in_memory(),
            DispatchPolicy::default(),
        );
        (Router::new(dispatcher), dir)
    }

    #[test]
    fn unknown_route_is_404_and_wrong_method_is_405() {
        let (router, _dir) = router();
        let resp = router.handle(&ApiRequest::new("GET", "/nope", "alice", Value::Null));
        assert_eq!(resp.status, 404);
        assert_eq!(resp.error_code(), Some("not_found"));

        let resp = router.handle(&ApiRequest::new("PUT", "/jobs", "alice", Value::Null));
        assert_eq!(resp.status, 405);
        assert_eq!(resp.error_code(), Some("method_not_allowed"));
    }

    #[test]
    fn missing_owner_is_rejected() {
        let (router, _dir) = router();
        let resp = router.handle(&ApiRequest::new("GET", "/jobs", "  ", Value::Null));
        assert_eq!(resp.status, 401);
    }

    #[test]
    fn upload_decodes_base64_and_reports_hash() {
        let (router, _dir) = router();
        let body = json!({ "filename": "bundle.zip", "data": STANDARD.encode(b"0123456789") });
        let resp = router.handle(&ApiRequest::new("POST", "/artifacts", "alice", body));

        assert_eq!(resp.status, 201);
        assert_eq!(resp.body["size"], 10);
        assert_eq!(resp.body["hash"], ContentHash::of(b"0123456789").as_str());
        assert!(router.dispatcher().store().contains(&ContentHash::of(b"0123456789")).unwrap());
    }

    #[test]
    fn upload_with_wrong_digest_conflicts() {
        let (router, _dir) = router();
        let body = json!({
            "filename": "bundle.zip",
            "data": STANDARD.encode(b"0123456789"),
            "hash": ContentHash::of(b"something else").as_str(),
        });
        let resp = router.handle(&ApiRequest::new("POST", "/artifacts", "alice", body));
        assert_eq!(resp.status, 409);
        assert_eq!(resp.error_code(), Some("hash_mismatch"));
    }

    #[test]
    fn upload_with_bad_payload_is_400() {
        let (router, _dir) = router();
        let body = json!({ "filename": "bundle.zip", "data": "***" });
        let resp = router.handle(&ApiRequest::new("POST", "/artifacts", "alice", body));
        assert_eq!(resp.status, 400);

        let resp = router.handle(&ApiRequest::new("POST", "/artifacts", "alice", json!({})));
        assert_eq!(resp.status, 400);
    }

    #[test]
    fn delete_rejects_malformed_hash() {
        let (router, _dir) = router();
        let resp = router.handle(&ApiRequest::new("DELETE", "/artifacts/xyz", "alice", Value::Null));
        assert_eq!(resp.status, 400);
        assert_eq!(resp.error_code(), Some("malformed_hash"));
    }

    #[test]
    fn other_owners_artifacts_are_not_listed() {
        let (router, _dir) = router();
        let store = router.dispatcher().store();
        store.put("alice", "a.zip", b"alice bytes").unwrap();
        store.put("bob", "b.zip", b"bob bytes").unwrap();

        let resp = router.handle(&ApiRequest::new("GET", "/artifacts", "alice", Value::Null));
        assert_eq!(resp.status, 200);
        let listed = resp.body["artifacts"].as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["owner"], "alice");
    }

    #[test]
    fn shared_bytes_are_listed_for_each_uploader() {
        let (router, _dir) = router();
        let data = STANDARD.encode(b"0123456789");
        let first = router.handle(&ApiRequest::new(
            "POST",
            "/artifacts",
            "alice",
            json!({ "filename": "bundle.zip", "data": data }),
        ));
        let second = router.handle(&ApiRequest::new(
            "POST",
            "/artifacts",
            "bob",
            json!({ "filename": "mine.zip", "data": data }),
        ));
        assert_eq!(second.status, 201);
        assert_eq!(second.body["hash"], first.body["hash"]);
        assert_eq!(second.body["owner"], "bob");
        assert_eq!(second.body["filename"], "mine.zip");

        let resp = router.handle(&ApiRequest::new("GET", "/artifacts", "bob", Value::Null));
        let listed = resp.body["artifacts"].as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["filename"], "mine.zip");
    }

    #[test]
    fn malformed_job_id_is_404() {
        let (router, _dir) = router();
        let resp = router.handle(&ApiRequest::new("GET", "/jobs/not-a-uuid", "alice", Value::Null));
        assert_eq!(resp.status, 404);
        let resp = router.handle(&ApiRequest::new(
            "POST",
            &format!("/jobs/{}/cancel", JobId::new()),
            "alice",
            Value::Null,
        ));
        assert_eq!(resp.status, 404);
    }
}
