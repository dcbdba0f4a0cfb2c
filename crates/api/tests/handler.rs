#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use kctl_api::{DeleteRequest, DeleteStatus, InProcApi, KctlApi, KctlError, UpdateRequest, UpdateStatus};
use kctl_core::{GatewayError, RecreateConfig, ResourceKind};
use kctl_kubehub::{DeleteBehavior, MemoryGateway, Op};
use serde_json::json;

const POD: &str = "\
apiVersion: v1
kind: Pod
metadata:
  name: web
  labels:
    app: web
spec:
  containers:
    - name: main
      image: nginx:1.27
";

fn api(gw: &MemoryGateway) -> InProcApi {
    InProcApi::new(Arc::new(gw.clone()), RecreateConfig::default())
}

#[tokio::test]
async fn first_update_creates_in_default_namespace() {
    let gw = MemoryGateway::new();
    let resp = api(&gw).update(UpdateRequest::from_yaml(POD).unwrap()).await.unwrap();
    assert_eq!(resp.status, UpdateStatus::Created);
    assert_eq!(resp.code, 201);
    assert!(gw.object(ResourceKind::Pod, "default", "web").is_some());
}

#[tokio::test]
async fn second_update_recreates_with_new_image() {
    let gw = MemoryGateway::new();
    let api = api(&gw);
    api.update(UpdateRequest::from_yaml(POD).unwrap()).await.unwrap();
    let resp = api.update(UpdateRequest::from_yaml(&POD.replace("nginx:1.27", "nginx:1.28")).unwrap()).await.unwrap();
    assert_eq!(resp.status, UpdateStatus::Recreated, "{:?}", resp);
    assert_eq!(resp.code, 200);
    let live = gw.object(ResourceKind::Pod, "default", "web").expect("recreated");
    assert_eq!(live.raw["spec"]["containers"][0]["image"], "nginx:1.28");
}

#[tokio::test(start_paused = true)]
async fn stuck_deletion_maps_to_gateway_timeout() {
    let gw = MemoryGateway::new();
    gw.seed(ResourceKind::Pod, json!({ "metadata": { "name": "web", "labels": { "app": "web" } } }));
    gw.set_delete_behavior(ResourceKind::Pod, DeleteBehavior::Never);
    let req = UpdateRequest::from_yaml(POD).unwrap().with_timeout(Some(Duration::from_secs(3)));
    let resp = api(&gw).update(req).await.unwrap();
    assert_eq!(resp.status, UpdateStatus::TimedOut);
    assert_eq!(resp.code, 504);
    assert!(!resp.object_absent);
}

#[tokio::test]
async fn missing_name_is_rejected_before_any_call() {
    let gw = MemoryGateway::new();
    let req = UpdateRequest::from_yaml("kind: Pod\nmetadata: {}\n").unwrap();
    let err = api(&gw).update(req).await.unwrap_err();
    assert!(matches!(err, KctlError::Validation(_)));
    assert!(gw.calls().is_empty());
}

#[tokio::test]
async fn validate_surfaces_dry_run_rejection() {
    let gw = MemoryGateway::new();
    gw.fail(Op::DryRun, GatewayError::api(422, "Invalid", "spec.containers: Required value"));
    let err = api(&gw).validate(UpdateRequest::from_yaml(POD).unwrap()).await.unwrap_err();
    assert!(err.to_string().contains("spec.containers"), "{}", err);
    assert!(gw.object(ResourceKind::Pod, "default", "web").is_none());
}

#[tokio::test]
async fn delete_of_missing_object_is_not_found() {
    let gw = MemoryGateway::new();
    let req = DeleteRequest { kind: ResourceKind::Job, namespace: None, name: "gone".into(), timeout: None };
    let resp = api(&gw).delete(req).await.unwrap();
    assert_eq!(resp.status, DeleteStatus::NotFound);
    assert_eq!(resp.code, 404);
}

#[tokio::test(start_paused = true)]
async fn zero_request_timeouts_wait_at_least_one_second() {
    let gw = MemoryGateway::new();
    gw.seed(ResourceKind::Pod, json!({ "metadata": { "name": "web", "labels": { "app": "web" } } }));
    gw.set_delete_behavior(ResourceKind::Pod, DeleteBehavior::Never);
    let api = api(&gw);

    let req = UpdateRequest::from_yaml(POD).unwrap().with_timeout(Some(Duration::ZERO));
    let resp = api.update(req).await.unwrap();
    assert_eq!(resp.status, UpdateStatus::TimedOut);
    assert!(resp.message.contains("within 1s"), "{}", resp.message);

    let req = DeleteRequest { kind: ResourceKind::Pod, namespace: None, name: "web".into(), timeout: Some(Duration::ZERO) };
    let resp = api.delete(req).await.unwrap();
    assert_eq!(resp.status, DeleteStatus::TimedOut);
    assert!(resp.message.contains("within 1s"), "{}", resp.message);
}
