//! Webhook handler: authenticate, resolve, rebuild

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State as AxumState},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::SharedState;
use crate::access::is_authorized;
use crate::catalog::RepositoryCatalog;
use crate::command::BuildCommand;
use crate::config::load_config;
use crate::error::WebhookError;
use crate::executor::{run_build, summary_for};
use crate::job::BuildRecord;
use crate::provider::Provider;
use crate::webhook::WebhookEvent;

/// Providers cap deliveries well below this.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Handles a webhook delivery from any provider.
///
/// Everything up to and including command assembly runs before the response
/// starts, so rejections carry their own status code. The build output is then
/// streamed back as progress markers followed by a summary line.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Response, WebhookError> {
    let config = load_config(&state.config_path).await.map_err(|e| {
        error!("Could not load config from {:?}: {}", state.config_path, e);
        e
    })?;

    let caller = remote.ip();
    if !is_authorized(caller, config.authorized_ips.as_ref()) {
        warn!("Rejected delivery from unauthorized address {}", caller);
        return Err(WebhookError::AccessDenied);
    }

    config.check_preconditions().map_err(|e| {
        error!("{}", e);
        e
    })?;

    let (parts, body) = request.into_parts();
    let provider = Provider::detect(&parts.headers);
    info!("Received {} delivery from {}", provider, caller);

    // Signatures cover the exact bytes on the wire, so keep the body raw.
    let body: Bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| WebhookError::InvalidPayload(format!("Could not read body: {}", e)))?;

    let event = WebhookEvent::from_request(provider, &parts.headers, &body, &config)?;

    let repository_url = if provider.is_recognized() {
        let catalog = RepositoryCatalog::load(&config.json).await?;
        let resolved = catalog
            .resolve(event.clone_url.as_deref(), event.ssh_url.as_deref())
            .map(String::from);
        if resolved.is_none() {
            warn!(
                "No repository in {:?} matches {:?} / {:?}, rebuilding everything",
                config.json, event.clone_url, event.ssh_url
            );
        }
        resolved
    } else {
        None
    };

    let command = BuildCommand::new(&config, repository_url.as_deref());
    debug!("Build command: {:?}", command.argv());

    let record = BuildRecord::new(provider, repository_url);
    Ok(stream_build(state, command, config.build_timeout(), record).await)
}

async fn stream_build(
    state: SharedState,
    command: BuildCommand,
    timeout: Option<Duration>,
    record: BuildRecord,
) -> Response {
    let build_id = record.id.clone();
    state.history.lock().await.add(record);

    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, Infallible>>();

    tokio::spawn(async move {
        // Only one build runs at a time against the shared json/webroot.
        let _guard = state.build_lock.lock().await;
        state
            .history
            .lock()
            .await
            .update(&build_id, |b| b.mark_running());
        info!("Build {} started: {}", build_id, command.display());

        // A caller that hangs up does not cancel the build.
        let result = run_build(&command, timeout, |chunk| {
            let _ = tx.send(Ok(Bytes::from_static(chunk.marker().as_bytes())));
        })
        .await;

        let exit_code = match result {
            Ok(outcome) => {
                state
                    .history
                    .lock()
                    .await
                    .update(&build_id, |b| b.mark_finished(outcome.exit_code));
                outcome.exit_code
            }
            Err(e) => {
                error!("Build {} failed: {}", build_id, e);
                let _ = tx.send(Ok(Bytes::from(format!("\n{}", e))));
                let exit_code = e.exit_code();
                state
                    .history
                    .lock()
                    .await
                    .update(&build_id, |b| b.mark_failed(e.to_string()));
                exit_code
            }
        };

        info!("Build {} finished with exit code {}", build_id, exit_code);
        let _ = tx.send(Ok(Bytes::from(format!(
            "\n\n{}\n",
            summary_for(exit_code)
        ))));
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(UnboundedReceiverStream::new(rx)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use crate::api::build_router;
    use crate::utils::sign_payload;
    use axum::Router;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SECRET: &str = "s3cr3t";
    const SSH_URL: &str = "git@github.com:acme/lib.git";

    /// A working directory with a fake build tool that records its arguments.
    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new(exit_code: i32) -> Self {
            Self::with_script(&format!(
                "printf '%s\\n' \"$@\" > \"$(dirname \"$0\")/../args.txt\"\n\
                 echo building\n\
                 echo warning >&2\n\
                 exit {}\n",
                exit_code
            ))
        }

        fn with_script(body: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bin = dir.path().join("bin");
            std::fs::create_dir_all(&bin).unwrap();
            let satis = bin.join("satis");
            std::fs::write(&satis, format!("#!/bin/sh\n{}", body)).unwrap();
            std::fs::set_permissions(&satis, std::fs::Permissions::from_mode(0o755)).unwrap();
            std::fs::create_dir_all(dir.path().join("web")).unwrap();
            std::fs::write(
                dir.path().join("satis.json"),
                json!({
                    "name": "acme/packages",
                    "repositories": [
                        { "type": "vcs", "url": "git@github.com:acme/other.git" },
                        { "type": "vcs", "url": SSH_URL }
                    ]
                })
                .to_string(),
            )
            .unwrap();
            let fixture = Self { dir };
            fixture.write_config("");
            fixture
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }

        fn write_config(&self, extra: &str) {
            let config = format!(
                "bin: \"{}\"\njson: \"{}\"\nwebroot: \"{}\"\nsecret: {}\n{}",
                self.path("bin/satis").display(),
                self.path("satis.json").display(),
                self.path("web").display(),
                SECRET,
                extra
            );
            std::fs::write(self.path("config.yml"), config).unwrap();
        }

        fn router(&self, caller: [u8; 4]) -> Router {
            router_for(&self.path("config.yml"), caller)
        }

        fn recorded_args(&self) -> Option<Vec<String>> {
            std::fs::read_to_string(self.path("args.txt"))
                .ok()
                .map(|s| s.lines().map(String::from).collect())
        }
    }

    fn router_for(config_path: &Path, caller: [u8; 4]) -> Router {
        let state = Arc::new(AppState::new(config_path));
        build_router(state).layer(MockConnectInfo(SocketAddr::from((caller, 40000))))
    }

    fn github_request(body: &str, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-GitHub-Event", "push")
            .header("X-Hub-Signature-256", signature)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn github_body() -> String {
        json!({
            "ref": "refs/heads/main",
            "repository": {
                "clone_url": "https://github.com/acme/lib.git",
                "ssh_url": SSH_URL
            }
        })
        .to_string()
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, String) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn signed_github_push_builds_matching_repository() {
        let fixture = Fixture::new(0);
        let body = github_body();
        let signature = sign_payload(SECRET, body.as_bytes());

        let (status, output) = send(
            fixture.router([127, 0, 0, 1]),
            github_request(&body, &signature),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(output.contains('.'));
        assert!(output.contains('E'));
        assert!(output.ends_with("\n\nSuccessful rebuild!\n"));
        assert_eq!(
            fixture.recorded_args().unwrap(),
            vec![
                "build".to_string(),
                "--repository-url".to_string(),
                SSH_URL.to_string(),
                fixture.path("satis.json").display().to_string(),
                fixture.path("web").display().to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn bad_github_signature_is_forbidden_and_nothing_runs() {
        let fixture = Fixture::new(0);
        let body = github_body();
        let signature = sign_payload("wrong", body.as_bytes());

        let (status, output) = send(
            fixture.router([127, 0, 0, 1]),
            github_request(&body, &signature),
        )
        .await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(output, "Hook secret does not match.");
        assert!(fixture.recorded_args().is_none());
    }

    #[tokio::test]
    async fn unauthorized_ip_gets_bare_403() {
        let fixture = Fixture::new(0);
        fixture.write_config("authorized_ips:\n  - 10.0.0.0/8\n  - 192.168.1.1\n");

        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::empty())
            .unwrap();
        let (status, output) = send(fixture.router([172, 16, 0, 1]), req).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(output.is_empty());
        assert!(fixture.recorded_args().is_none());
    }

    #[tokio::test]
    async fn authorized_ip_is_let_through() {
        let fixture = Fixture::new(0);
        fixture.write_config("authorized_ips: 10.0.0.0/8\n");

        let req = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let (status, output) = send(fixture.router([10, 1, 2, 3]), req).await;

        assert_eq!(status, StatusCode::OK);
        assert!(output.ends_with("Successful rebuild!\n"));
    }

    #[tokio::test]
    async fn general_delivery_rebuilds_everything() {
        let fixture = Fixture::new(0);
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from("anything"))
            .unwrap();

        let (status, _) = send(fixture.router([127, 0, 0, 1]), req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            fixture.recorded_args().unwrap(),
            vec![
                "build".to_string(),
                fixture.path("satis.json").display().to_string(),
                fixture.path("web").display().to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn gitlab_push_for_unknown_repository_rebuilds_everything() {
        let fixture = Fixture::new(0);
        let body = json!({
            "project": {
                "http_url": "https://gitlab.com/acme/unknown.git",
                "ssh_url": "git@gitlab.com:acme/unknown.git"
            }
        })
        .to_string();
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-Gitlab-Event", "Push Hook")
            .header("X-Gitlab-Token", SECRET)
            .body(Body::from(body))
            .unwrap();

        let (status, _) = send(fixture.router([127, 0, 0, 1]), req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(fixture.recorded_args().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn gitlab_wrong_token_is_forbidden() {
        let fixture = Fixture::new(0);
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-Gitlab-Event", "Push Hook")
            .header("X-Gitlab-Token", "s3cr3t-but-longer")
            .body(Body::from("{}"))
            .unwrap();

        let (status, output) = send(fixture.router([127, 0, 0, 1]), req).await;

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(output, "Hook secret does not match.");
        assert!(fixture.recorded_args().is_none());
    }

    #[tokio::test]
    async fn failing_build_reports_error() {
        let fixture = Fixture::new(1);
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::empty())
            .unwrap();

        let (status, output) = send(fixture.router([127, 0, 0, 1]), req).await;

        assert_eq!(status, StatusCode::OK);
        assert!(output.ends_with("\n\nOops! An error occured!\n"));
    }

    #[tokio::test]
    async fn timed_out_build_is_reported_in_the_body_and_history() {
        let fixture = Fixture::with_script("echo starting\nexec sleep 30\n");
        fixture.write_config("build_timeout: 1\n");
        let app = fixture.router([127, 0, 0, 1]);
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::empty())
            .unwrap();

        let started = std::time::Instant::now();
        let (status, output) = send(app.clone(), req).await;

        // The status line is already sent when the timer fires.
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(output.starts_with('.'));
        assert!(output.contains("\nBuild timed out after 1 seconds\n"));
        assert!(output.ends_with("\n\nOops! An error occured!\n"));

        let req = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let (_, output) = send(app, req).await;
        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["builds"]["recent"][0]["status"], "failed");
        assert_eq!(
            json["builds"]["recent"][0]["error"],
            "Build timed out after 1 seconds"
        );
    }

    #[tokio::test]
    async fn missing_paths_are_all_reported_before_the_request_is_read() {
        let fixture = Fixture::new(0);
        std::fs::remove_file(fixture.path("bin/satis")).unwrap();
        std::fs::remove_dir(fixture.path("web")).unwrap();

        // A GitHub delivery with a bogus signature: rejected on preconditions first.
        let (status, output) = send(
            fixture.router([127, 0, 0, 1]),
            github_request("{}", "sha256=00"),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            output,
            "The build cannot be run due to some errors. Please, review them and check your config.yml:\n\
             - The Satis bin could not be found.\n\
             - The webroot directory could not be found.\n"
        );
    }

    #[tokio::test]
    async fn missing_config_file_asks_for_one() {
        let dir = tempfile::tempdir().unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::empty())
            .unwrap();

        let (status, output) =
            send(router_for(&dir.path().join("config.yml"), [127, 0, 0, 1]), req).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(output.starts_with("Please, define your satis configuration"));
    }

    #[tokio::test]
    async fn concurrent_deliveries_never_overlap() {
        let fixture = Fixture::with_script(
            "d=\"$(dirname \"$0\")/..\"\n\
             mkdir \"$d/running\" || echo overlap >> \"$d/overlap\"\n\
             sleep 0.2\n\
             rmdir \"$d/running\"\n",
        );
        let app = fixture.router([127, 0, 0, 1]);
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .body(Body::empty())
                .unwrap()
        };

        let (first, second) = tokio::join!(
            send(app.clone(), request()),
            send(app.clone(), request())
        );

        assert!(first.1.ends_with("Successful rebuild!\n"));
        assert!(second.1.ends_with("Successful rebuild!\n"));
        assert!(!fixture.path("overlap").exists());
    }

    #[tokio::test]
    async fn status_lists_recent_builds() {
        let fixture = Fixture::new(0);
        let app = fixture.router([127, 0, 0, 1]);
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::empty())
            .unwrap();
        send(app.clone(), req).await;

        let req = Request::builder()
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let (status, output) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["server"]["name"], "satis_webhook");
        assert_eq!(json["builds"]["recent"][0]["provider"], "general");
        assert_eq!(json["builds"]["recent"][0]["status"], "success");
        assert_eq!(json["builds"]["recent"][0]["exit_code"], 0);
    }
}
