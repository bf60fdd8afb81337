use axum::body::Bytes;
use axum::extract::{Path, RawQuery, Request};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{debug, trace, warn};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tower_http::catch_panic::CatchPanicLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::AutoscanError;
use crate::processor::Processor;
use crate::triggers::a_train::ATrainTrigger;
use crate::triggers::lidarr::LidarrTrigger;
use crate::triggers::manual::ManualTrigger;
use crate::triggers::radarr::RadarrTrigger;
use crate::triggers::readarr::ReadarrTrigger;
use crate::triggers::sonarr::SonarrTrigger;

const AUTH_REALM: &str = "Basic realm=\"Autoscan 1.x\"";

/// Builds the HTTP surface: `/health` plus every configured trigger under
/// `/triggers/{name}`, with request logging, panic recovery, and optional
/// basic auth on the trigger subtree.
pub fn build_router(config: &Config, processor: Arc<Processor>) -> Result<Router, AutoscanError> {
    let mut triggers = Router::new();

    let manual = ManualTrigger::new(
        config.triggers.manual.clone().unwrap_or_default(),
        Arc::clone(&processor),
    )?;
    {
        let form = Arc::clone(&manual);
        let submit = Arc::clone(&manual);
        triggers = triggers.route(
            "/manual",
            get(move || {
                let trigger = Arc::clone(&form);
                async move { trigger.form().await }
            })
            .post(move |RawQuery(query): RawQuery| {
                let trigger = Arc::clone(&submit);
                async move { trigger.handle(query).await }
            }),
        );
    }

    let a_train = ATrainTrigger::new(
        config.triggers.a_train.clone().unwrap_or_default(),
        Arc::clone(&processor),
    )?;
    for route in ["/a-train/{drive}", "/bernard/{drive}"] {
        let trigger = Arc::clone(&a_train);
        triggers = triggers.route(
            route,
            post(move |Path(drive): Path<String>, body: Bytes| {
                let trigger = Arc::clone(&trigger);
                async move { trigger.handle(drive, body).await }
            }),
        );
    }

    for cfg in &config.triggers.sonarr {
        let trigger = SonarrTrigger::new(cfg.clone(), Arc::clone(&processor))?;
        let path = format!("/{}", trigger.name());
        triggers = triggers.route(
            &path,
            post(move |body: Bytes| {
                let trigger = Arc::clone(&trigger);
                async move { trigger.handle(body).await }
            }),
        );
    }

    for cfg in &config.triggers.radarr {
        let trigger = RadarrTrigger::new(cfg.clone(), Arc::clone(&processor))?;
        let path = format!("/{}", trigger.name());
        triggers = triggers.route(
            &path,
            post(move |body: Bytes| {
                let trigger = Arc::clone(&trigger);
                async move { trigger.handle(body).await }
            }),
        );
    }

    for cfg in &config.triggers.lidarr {
        let trigger = LidarrTrigger::new(cfg.clone(), Arc::clone(&processor))?;
        let path = format!("/{}", trigger.name());
        triggers = triggers.route(
            &path,
            post(move |body: Bytes| {
                let trigger = Arc::clone(&trigger);
                async move { trigger.handle(body).await }
            }),
        );
    }

    for cfg in &config.triggers.readarr {
        let trigger = ReadarrTrigger::new(cfg.clone(), Arc::clone(&processor))?;
        let path = format!("/{}", trigger.name());
        triggers = triggers.route(
            &path,
            post(move |body: Bytes| {
                let trigger = Arc::clone(&trigger);
                async move { trigger.handle(body).await }
            }),
        );
    }

    if config.authentication.is_enabled() {
        let credentials = Arc::new((
            config.authentication.username.clone(),
            config.authentication.password.clone(),
        ));
        triggers = triggers.layer(middleware::from_fn(move |req: Request, next: Next| {
            let credentials = Arc::clone(&credentials);
            async move { basic_auth(credentials, req, next).await }
        }));
    }

    Ok(Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .nest("/triggers", triggers)
        .layer(middleware::from_fn(access_log))
        .layer(CatchPanicLayer::new()))
}

/// Assigns a request id and logs method, URL, status and duration.
async fn access_log(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let response = next.run(req).await;

    debug!(
        "Request processed: request_id={request_id} method={method} url={path} status={} duration={:.2?}",
        response.status(),
        start.elapsed()
    );

    response
}

async fn basic_auth(credentials: Arc<(String, String)>, req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_basic);

    if let Some((username, password)) = provided {
        let username_ok: bool = username.as_bytes().ct_eq(credentials.0.as_bytes()).into();
        let password_ok: bool = password.as_bytes().ct_eq(credentials.1.as_bytes()).into();

        if username_ok && password_ok {
            trace!("Successful authentication");
            return next.run(req).await;
        }

        warn!("Invalid authentication");
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, AUTH_REALM)],
        "",
    )
        .into_response()
}

fn decode_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some((username.to_owned(), password.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::processor::ProcessorConfig;
    use crate::rewrite::Rewrite;
    use crate::triggers::manual::ManualConfig;
    use axum::body::Body;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn processor() -> Arc<Processor> {
        let db = Arc::new(Database::open_sqlite_memory().unwrap());
        Arc::new(
            Processor::new(
                ProcessorConfig {
                    anchors: vec![],
                    minimum_age: Duration::from_secs(600),
                },
                db,
            )
            .unwrap(),
        )
    }

    fn config_with_manual_rewrite() -> Config {
        let mut config = Config::default();
        config.triggers.manual = Some(ManualConfig {
            priority: 1,
            rewrite: vec![Rewrite {
                from: "^/Movies/".into(),
                to: "/mnt/Media/Movies/".into(),
            }],
            verbosity: None,
        });
        config
    }

    fn basic_header(username: &str, password: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let app = build_router(&Config::default(), processor()).unwrap();

        let res = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn manual_post_queues_rewritten_scans() {
        let processor = processor();
        let app = build_router(&config_with_manual_rewrite(), Arc::clone(&processor)).unwrap();

        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/triggers/manual?dir=/Movies/Interstellar%20(2014)&dir=/Movies/Parasite%20(2019)")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let scans = processor.all_scans();
        assert_eq!(scans.len(), 2);
        assert_eq!(scans[0].folder, "/mnt/Media/Movies/Interstellar (2014)");
        assert_eq!(scans[1].folder, "/mnt/Media/Movies/Parasite (2019)");
        assert_eq!(scans[0].time, scans[1].time);
    }

    #[tokio::test]
    async fn manual_get_serves_the_form() {
        let app = build_router(&Config::default(), processor()).unwrap();

        let res = app
            .oneshot(
                Request::builder()
                    .uri("/triggers/manual")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bernard_alias_reaches_the_a_train_handler() {
        let processor = processor();
        let app = build_router(&Config::default(), Arc::clone(&processor)).unwrap();

        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/triggers/bernard/drive-1")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"Created":["/Media/Movies/Film"],"Deleted":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(processor.all_scans().len(), 1);
    }

    #[tokio::test]
    async fn named_arr_triggers_are_mounted() {
        let mut config = Config::default();
        config.triggers.sonarr.push(crate::triggers::sonarr::SonarrConfig {
            name: "sonarr-4k".into(),
            priority: 5,
            rewrite: vec![],
            verbosity: None,
        });
        let processor = processor();
        let app = build_router(&config, Arc::clone(&processor)).unwrap();

        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/triggers/sonarr-4k")
                    .body(Body::from(r#"{"eventType":"Test"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credentials_are_challenged() {
        let mut config = config_with_manual_rewrite();
        config.authentication.username = "admin".into();
        config.authentication.password = "secret".into();
        let app = build_router(&config, processor()).unwrap();

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/triggers/manual?dir=/Movies/Film")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            res.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            AUTH_REALM
        );

        // wrong password is rejected the same way
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/triggers/manual?dir=/Movies/Film")
                    .header(header::AUTHORIZATION, basic_header("admin", "wrong"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_credentials_pass_through() {
        let mut config = config_with_manual_rewrite();
        config.authentication.username = "admin".into();
        config.authentication.password = "secret".into();
        let processor = processor();
        let app = build_router(&config, Arc::clone(&processor)).unwrap();

        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/triggers/manual?dir=/Movies/Film")
                    .header(header::AUTHORIZATION, basic_header("admin", "secret"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(processor.all_scans().len(), 1);
    }

    #[tokio::test]
    async fn health_skips_authentication() {
        let mut config = Config::default();
        config.authentication.username = "admin".into();
        config.authentication.password = "secret".into();
        let app = build_router(&config, processor()).unwrap();

        let res = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn basic_header_decoding() {
        assert_eq!(
            decode_basic(&basic_header("user", "pa:ss")),
            Some(("user".to_owned(), "pa:ss".to_owned()))
        );
        assert_eq!(decode_basic("Bearer token"), None);
        assert_eq!(decode_basic("Basic not-base64!"), None);
    }
}
