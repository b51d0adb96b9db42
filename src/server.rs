use crate::api::{Digest, Image, Workload, WorkloadRef};
use crate::backend::CircuitBreaker;
use crate::engine::{Engine, EngineError};
use actix_cors::Cors;
use actix_web::http::StatusCode;
use actix_web::{delete, get, post, put, web, App, HttpResponse, HttpServer, ResponseError};
use scanherd_api::{ConfigUpdate, FinishedScan, ImagePriority, NextImage};
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl ResponseError for EngineError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

type Response = Result<HttpResponse, EngineError>;

#[get("/api/v1/results")]
async fn get_results(engine: web::Data<Engine>) -> Response {
    Ok(HttpResponse::Ok().json(engine.aggregated_results().await?))
}

#[get("/api/v1/metrics")]
async fn get_metrics(engine: web::Data<Engine>, breaker: web::Data<CircuitBreaker>) -> Response {
    let mut metrics = engine.metrics().await?;
    metrics.breaker = Some(breaker.snapshot());
    Ok(HttpResponse::Ok().json(metrics))
}

#[get("/api/v1/model")]
async fn get_model(engine: web::Data<Engine>) -> Response {
    Ok(HttpResponse::Ok().json(engine.model().await?))
}

#[post("/api/v1/workloads")]
async fn add_workload(
    engine: web::Data<Engine>,
    workload: web::Json<scanherd_api::Workload>,
) -> Response {
    engine.add_workload(workload.into_inner().into()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[put("/api/v1/workloads")]
async fn update_workload(
    engine: web::Data<Engine>,
    workload: web::Json<scanherd_api::Workload>,
) -> Response {
    engine.update_workload(workload.into_inner().into()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[put("/api/v1/allworkloads")]
async fn all_workloads(
    engine: web::Data<Engine>,
    workloads: web::Json<Vec<scanherd_api::Workload>>,
) -> Response {
    let workloads: Vec<Workload> = workloads.into_inner().into_iter().map(Into::into).collect();
    engine.all_workloads(workloads).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[delete("/api/v1/workloads/{namespace}/{name}")]
async fn delete_workload(engine: web::Data<Engine>, path: web::Path<(String, String)>) -> Response {
    let (namespace, name) = path.into_inner();
    engine
        .delete_workload(WorkloadRef::new(namespace, name))
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/api/v1/images")]
async fn add_image(engine: web::Data<Engine>, image: web::Json<scanherd_api::Image>) -> Response {
    engine.add_image(image.into_inner().into()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[put("/api/v1/images/{sha}/priority")]
async fn set_image_priority(
    engine: web::Data<Engine>,
    path: web::Path<String>,
    priority: web::Json<ImagePriority>,
) -> Response {
    engine
        .set_image_priority(Digest(path.into_inner()), priority.priority)
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/api/v1/nextimage")]
async fn next_image(engine: web::Data<Engine>) -> Response {
    let image = engine.next_image_for_scanning().await?;
    Ok(HttpResponse::Ok().json(NextImage {
        image: image.map(Image::into),
    }))
}

#[post("/api/v1/finishedscan")]
async fn finished_scan(engine: web::Data<Engine>, scan: web::Json<FinishedScan>) -> Response {
    let FinishedScan { image, error } = scan.into_inner();
    let outcome = match error {
        Some(err) => Err(err),
        None => Ok(()),
    };
    engine.report_scan_outcome(Digest(image.sha), outcome).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/api/v1/config")]
async fn set_config(
    engine: web::Data<Engine>,
    breaker: web::Data<CircuitBreaker>,
    update: web::Json<ConfigUpdate>,
) -> Response {
    let update = update.into_inner();
    match update.max_backoff_secs {
        Some(0) => warn!("Ignoring zero duration for max backoff"),
        Some(secs) => breaker.set_max_backoff(Duration::from_secs(secs)),
        None => {}
    }
    engine.set_config(update).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[post("/api/v1/breaker/reset")]
async fn reset_breaker(breaker: web::Data<CircuitBreaker>) -> HttpResponse {
    breaker.reset();
    HttpResponse::NoContent().finish()
}

fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_results)
        .service(get_metrics)
        .service(get_model)
        .service(add_workload)
        .service(update_workload)
        .service(all_workloads)
        .service(delete_workload)
        .service(add_image)
        .service(set_image_priority)
        .service(next_image)
        .service(finished_scan)
        .service(set_config)
        .service(reset_breaker);
}

pub async fn run(config: ServerConfig, engine: Engine, breaker: CircuitBreaker) -> anyhow::Result<()> {
    let engine = web::Data::new(engine);
    let breaker = web::Data::new(breaker);

    HttpServer::new(move || {
        let cors = Cors::default()
            .send_wildcard()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(engine.clone())
            .app_data(breaker.clone())
            .wrap(cors)
            .configure(configure)
    })
    .bind(&config.bind_addr)?
    .run()
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timings;
    use crate::engine::{engine, Model, ModelConfig};
    use crate::metrics::NoopMetrics;
    use actix_web::test;
    use std::sync::Arc;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    type Runner = tokio::task::JoinHandle<anyhow::Result<()>>;

    fn state() -> (web::Data<Engine>, web::Data<CircuitBreaker>, CancellationToken, Runner) {
        let stop = CancellationToken::new();
        let (timings, _) = watch::channel(Timings::default());
        let model = Model::new(
            ModelConfig {
                concurrent_scan_limit: 1,
                ..Default::default()
            },
            Arc::new(NoopMetrics),
        );
        let (engine, runner) = engine(model, timings, Arc::new(NoopMetrics), stop.clone());
        let task = tokio::spawn(runner);

        let breaker = CircuitBreaker::new(Duration::from_secs(60), Arc::new(NoopMetrics));
        (web::Data::new(engine), web::Data::new(breaker), stop, task)
    }

    fn image(sha: &str) -> scanherd_api::Image {
        scanherd_api::Image {
            repository: "quay.io/app".into(),
            tag: Some("v1".into()),
            sha: sha.into(),
            priority: None,
        }
    }

    #[actix_web::test]
    async fn scan_client_round_trip() {
        let (engine, breaker, stop, task) = state();
        let app = test::init_service(
            App::new()
                .app_data(engine.clone())
                .app_data(breaker)
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/workloads")
            .set_json(scanherd_api::Workload {
                namespace: "ns".into(),
                name: "pod".into(),
                uid: "uid".into(),
                containers: vec![scanherd_api::Container {
                    image: image("sha1"),
                    name: "app".into(),
                }],
            })
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        engine
            .backend_check_result(Digest::from("sha1"), None)
            .await
            .unwrap();

        let req = test::TestRequest::post().uri("/api/v1/nextimage").to_request();
        let next: NextImage = test::call_and_read_body_json(&app, req).await;
        assert_eq!(next.image.map(|i| i.sha), Some("sha1".to_string()));

        let req = test::TestRequest::post().uri("/api/v1/nextimage").to_request();
        let next: NextImage = test::call_and_read_body_json(&app, req).await;
        assert_eq!(next.image, None);

        let req = test::TestRequest::post()
            .uri("/api/v1/finishedscan")
            .set_json(FinishedScan {
                image: image("sha1"),
                error: Some("pull failed".into()),
            })
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/api/v1/model").to_request();
        let model: scanherd_api::Model = test::call_and_read_body_json(&app, req).await;
        assert_eq!(model.images["sha1"].scan_status, "InScanQueue");

        stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[actix_web::test]
    async fn metrics_include_breaker() {
        let (engine, breaker, stop, task) = state();
        let app = test::init_service(
            App::new()
                .app_data(engine)
                .app_data(breaker.clone())
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/config")
            .set_json(ConfigUpdate {
                concurrent_scan_limit: Some(4),
                max_backoff_secs: Some(1),
                ..Default::default()
            })
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let metrics: scanherd_api::Metrics = test::call_and_read_body_json(&app, req).await;
        assert_eq!(metrics.concurrent_scan_limit, 4);
        assert_eq!(metrics.breaker.map(|b| b.state), Some("Enabled".to_string()));

        // the first failure would back off for 2s, the new maximum caps it
        let failed = breaker
            .issue_request("test", || async { Err::<(), _>("down".to_string()) })
            .await;
        assert!(failed.is_err());
        assert!(matches!(
            breaker.snapshot().next_check_in_secs,
            Some(secs) if secs <= 1
        ));

        stop.cancel();
        task.await.unwrap().unwrap();
    }

    #[actix_web::test]
    async fn stopped_engine_is_unavailable() {
        let (engine, breaker, stop, task) = state();
        stop.cancel();
        task.await.unwrap().unwrap();

        let app = test::init_service(
            App::new()
                .app_data(engine)
                .app_data(breaker)
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/results").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
